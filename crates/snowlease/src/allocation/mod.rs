mod allocator;
mod backup;
mod mutation;
mod table;

pub use allocator::*;
pub use backup::*;
pub use mutation::*;
pub use table::*;
