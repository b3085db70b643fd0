mod builder;
mod contract;

pub use builder::*;
pub use contract::*;
