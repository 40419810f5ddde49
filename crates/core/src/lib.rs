//! CDP lending core.
//!
//! This crate provides:
//! - Fixed-point U256 helpers shared by every component
//! - Per-asset ordered index of troves by nominal collateral ratio
//! - Trove ledger with lazy redistribution rewards
//! - Stability pool with scaled product/sum reward accounting
//! - Decaying base-rate fee model
//! - The [`PositionManager`] engine: open/adjust/close, liquidation,
//!   redemption and stability pool entry points
//!
//! Prices, the debt token, collateral custody and time come from the
//! collaborator traits in `cdp-chain`.

pub mod config;
mod error;
mod events;
mod fees;
mod guard;
mod position_manager;
mod recovery;
pub mod sorted_troves;
pub mod stability_pool;
pub mod trove_ledger;
pub mod u256_math;

pub use config::{config, init_config, AssetConfig, AssetsConfig, ProtocolConfig};
pub use error::{EngineError, ErrorKind, Result};
pub use events::{Event, LiquidationMode, TroveOperation};
pub use fees::{BaseRate, FeeKind, FeeQuote, FeeSchedule};
pub use guard::{GuardToken, NonReentrant};
pub use position_manager::{
    AdjustTrove, LiquidationTotals, OpenTrove, PositionManager, RedeemRequest, RedemptionTotals,
};
pub use recovery::{CriticalRatioPolicy, RecoveryModePolicy, SystemTotals};
pub use sorted_troves::{IndexError, Search, Slot, SortedList, SortedTroves};
pub use stability_pool::{PoolError, PoolSummary, SettledDeposit, StabilityPool};
pub use trove_ledger::{PendingRewards, Trove, TroveLedger, TroveStatus};
