mod payout;

pub use payout::*;
