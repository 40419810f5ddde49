//! Collaborator seams for the CDP core.
//!
//! This crate provides:
//! - Price lookup ([`PriceFeed`]) with a concurrent in-memory [`PriceCache`]
//! - Debt-token mint/burn/pool-transfer capability ([`DebtToken`])
//! - Collateral custody and transfers ([`CollateralVault`])
//! - Wall-clock abstraction ([`Clock`]) for fee decay and price staleness
//!
//! The core never adjusts balances directly; every token or collateral
//! movement goes through these traits.

mod clock;
mod error;
pub mod oracle;
mod token;
mod vault;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::ChainError;
pub use oracle::{OracleConfig, OraclesConfig, PriceCache, PriceData, PriceFeed};
pub use token::{DebtToken, InMemoryDebtToken};
pub use vault::{CollateralVault, InMemoryCollateralVault};
