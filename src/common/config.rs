use std::path::PathBuf;

use secp256k1::XOnlyPublicKey;

/// Engine-wide configuration. Everything the escrow and payout routines
/// need is carried here explicitly so they stay testable with injected
/// parameters instead of reaching for ambient globals.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Root directory for persisted trade files.
    pub data_dir: PathBuf,

    /// Blocks a confirmed deposit must age beyond its confirmation height
    /// before the escrow funds count as spendable.
    pub unlock_window: u64,

    /// Payout construction retries with a higher fee until this cap.
    /// Empirical constant, deliberately tunable.
    pub payout_fee_attempt_cap: u32,

    /// Fee estimate bump per construction attempt, in percent.
    pub payout_fee_bump_percent: u64,

    /// Percentage of each payout used for the trial (fee-probing) build.
    pub payout_trial_percent: u64,

    /// Arbitrators this node accepts init-trade requests from, and the
    /// set this node checks itself against when acting as arbitrator.
    pub accepted_arbitrators: Vec<XOnlyPublicKey>,

    /// Taker fee in basis points of the trade amount.
    pub taker_fee_bps: u64,

    /// Interval of the trade-period recomputation tick.
    pub trade_period_tick_secs: u64,

    /// Bound on concurrent trade re-initializations at startup. Opening an
    /// escrow wallet is expensive, so the fan-out is capped.
    pub restore_concurrency: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("tri_escrow_data"),
            unlock_window: 10,
            payout_fee_attempt_cap: 50,
            payout_fee_bump_percent: 10,
            payout_trial_percent: 90,
            accepted_arbitrators: Vec::new(),
            taker_fee_bps: 25,
            trade_period_tick_secs: 60,
            restore_concurrency: 4,
        }
    }
}

impl EngineConfig {
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }
}
