mod offer;

pub use offer::*;
