mod address;
mod interface;
mod local;
mod partition;
mod registry;

pub use address::*;
pub use interface::*;
pub use local::*;
pub use partition::*;
pub use registry::*;
