mod params;
mod stubs;

pub use params::*;
pub use stubs::*;

pub const TESTING_DEFAULT_CHANNEL_SIZE: usize = 5;
