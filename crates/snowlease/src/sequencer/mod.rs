mod generator;
mod register;
mod sleep;
#[cfg(test)]
mod tests;

pub use generator::*;
pub use sleep::*;
