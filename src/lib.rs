pub mod comms;
pub mod common;
pub mod contract;
pub mod escrow;
pub mod manager;
pub mod offer;
pub mod protocol;
pub mod testing;
pub mod trade;
pub mod wallet;
