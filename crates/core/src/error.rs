//! Engine error type and its classification.

use alloy::primitives::{Address, U256};
use cdp_chain::ChainError;
use serde::Serialize;
use thiserror::Error;

use crate::sorted_troves::IndexError;
use crate::stability_pool::PoolError;
use crate::trove_ledger::LedgerError;

/// Broad class of an [`EngineError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Malformed or out-of-range input
    Validation,
    /// Operation not allowed in the trove's or system's current state
    State,
    /// Collateralization rule violated
    Solvency,
    /// Size limit reached
    Capacity,
    /// Internal accounting would break; fatal for the call
    Consistency,
    /// Price missing, zero or stale
    Price,
    /// A collaborator call failed; fatal for the call
    Collaborator,
}

impl ErrorKind {
    /// Whether the caller can fix the input and retry.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Consistency | Self::Collaborator)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    // Validation
    #[error("amount must be non-zero")]
    ZeroAmount,

    #[error("no candidates given")]
    EmptyCandidates,

    #[error("iteration count must be non-zero")]
    ZeroIterations,

    #[error("max fee percentage {max_fee} outside [{floor}, {cap}]")]
    InvalidMaxFee { max_fee: U256, floor: U256, cap: U256 },

    #[error("adjustment changes nothing")]
    NothingToAdjust,

    #[error("asset {0} is not registered")]
    UnknownAsset(Address),

    #[error("repayment {repayment} exceeds net debt {net_debt}")]
    RepaymentExceedsDebt { repayment: U256, net_debt: U256 },

    #[error("withdrawal {requested} exceeds trove collateral {available}")]
    WithdrawalExceedsCollateral { requested: U256, available: U256 },

    #[error("net debt {net_debt} below minimum {minimum}")]
    DebtBelowMinimum { net_debt: U256, minimum: U256 },

    #[error("{account} holds {available}, needs {needed}")]
    InsufficientBalance {
        account: Address,
        needed: U256,
        available: U256,
    },

    #[error("stability pool: {0}")]
    Pool(PoolError),

    // State
    #[error("trove of {account} is not active")]
    TroveNotActive { account: Address },

    #[error("trove of {account} already exists")]
    TroveAlreadyExists { account: Address },

    #[error("only one trove left in the system")]
    OnlyOneTroveInSystem,

    #[error("reentrant call")]
    Reentrancy,

    #[error("no collateral surplus for {account}")]
    NoSurplus { account: Address },

    #[error("nothing to liquidate")]
    NothingLiquidated,

    #[error("no redemption occurred")]
    NoRedemptionOccurred,

    // Solvency
    #[error("trove is not liquidatable (ICR {icr})")]
    NotLiquidatable { icr: U256 },

    #[error("ICR {icr} below minimum {minimum}")]
    IcrBelowMinimum { icr: U256, minimum: U256 },

    #[error("TCR {tcr} would fall below critical ratio {ccr}")]
    TcrBelowCritical { tcr: U256, ccr: U256 },

    #[error("not allowed in recovery mode: {0}")]
    RecoveryModeRestriction(&'static str),

    #[error("fee rate {rate} exceeds maximum {max_fee}")]
    FeeExceedsMaximum { rate: U256, max_fee: U256 },

    #[error("redemptions are disabled while TCR {tcr} is below MCR")]
    RedemptionBelowMcr { tcr: U256 },

    #[error("withdrawals are disabled while troves are under-collateralized")]
    UndercollateralizedTroves,

    // Capacity
    #[error("batch of {size} exceeds maximum {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("index: {0}")]
    Index(IndexError),

    // Consistency
    #[error("stability pool holds no deposits")]
    NoPoolFunds,

    #[error("redistribution without remaining stakes")]
    RedistributionWithoutStakes,

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),

    // Price
    #[error("invalid price for {asset}")]
    InvalidPrice { asset: Address },

    #[error("stale price for {asset}: {age_secs}s old")]
    StalePrice { asset: Address, age_secs: u64 },

    #[error("no price for {asset}")]
    NoPrice { asset: Address },

    // Collaborator
    #[error("collaborator call failed: {0}")]
    Collaborator(ChainError),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        use EngineError::*;
        match self {
            ZeroAmount
            | EmptyCandidates
            | ZeroIterations
            | InvalidMaxFee { .. }
            | NothingToAdjust
            | UnknownAsset(_)
            | RepaymentExceedsDebt { .. }
            | WithdrawalExceedsCollateral { .. }
            | DebtBelowMinimum { .. }
            | InsufficientBalance { .. } => ErrorKind::Validation,

            Pool(e) => match e {
                PoolError::NoPoolFunds
                | PoolError::OffsetExceedsDeposits { .. }
                | PoolError::Overflow(_) => ErrorKind::Consistency,
                PoolError::NoDeposit(_) => ErrorKind::State,
                PoolError::ZeroAmount | PoolError::InsufficientDeposit { .. } => {
                    ErrorKind::Validation
                }
            },

            TroveNotActive { .. }
            | TroveAlreadyExists { .. }
            | OnlyOneTroveInSystem
            | Reentrancy
            | NoSurplus { .. }
            | NothingLiquidated
            | NoRedemptionOccurred => ErrorKind::State,

            NotLiquidatable { .. }
            | IcrBelowMinimum { .. }
            | TcrBelowCritical { .. }
            | RecoveryModeRestriction(_)
            | FeeExceedsMaximum { .. }
            | RedemptionBelowMcr { .. }
            | UndercollateralizedTroves => ErrorKind::Solvency,

            BatchTooLarge { .. } => ErrorKind::Capacity,

            Index(e) => match e {
                IndexError::Full { .. } => ErrorKind::Capacity,
                IndexError::InvalidHints { .. } | IndexError::ZeroHealthMetric => {
                    ErrorKind::Validation
                }
                IndexError::UnknownAsset(_) => ErrorKind::Validation,
                IndexError::AlreadyPresent(_) | IndexError::NotFound(_) => {
                    ErrorKind::Consistency
                }
            },

            NoPoolFunds | RedistributionWithoutStakes | Overflow(_) => ErrorKind::Consistency,

            InvalidPrice { .. } | StalePrice { .. } | NoPrice { .. } => ErrorKind::Price,

            Collaborator(_) => ErrorKind::Collaborator,
        }
    }
}

impl From<IndexError> for EngineError {
    fn from(e: IndexError) -> Self {
        match e {
            IndexError::UnknownAsset(asset) => Self::UnknownAsset(asset),
            other => Self::Index(other),
        }
    }
}

impl From<PoolError> for EngineError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::NoPoolFunds => Self::NoPoolFunds,
            PoolError::ZeroAmount => Self::ZeroAmount,
            other => Self::Pool(other),
        }
    }
}

impl From<LedgerError> for EngineError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::UnknownAsset(asset) => Self::UnknownAsset(asset),
            LedgerError::NoStakes(_) => Self::RedistributionWithoutStakes,
            LedgerError::Overflow(what) => Self::Overflow(what),
        }
    }
}

impl From<ChainError> for EngineError {
    fn from(e: ChainError) -> Self {
        Self::Collaborator(e)
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        assert_eq!(EngineError::ZeroAmount.kind(), ErrorKind::Validation);
        assert_eq!(EngineError::Reentrancy.kind(), ErrorKind::State);
        assert_eq!(
            EngineError::NotLiquidatable { icr: U256::ZERO }.kind(),
            ErrorKind::Solvency
        );
        assert_eq!(
            EngineError::from(IndexError::Full { max_size: 1 }).kind(),
            ErrorKind::Capacity
        );
        assert_eq!(
            EngineError::from(LedgerError::NoStakes(Address::ZERO)).kind(),
            ErrorKind::Consistency
        );
        assert_eq!(
            EngineError::from(ChainError::Overflow("x")).kind(),
            ErrorKind::Collaborator
        );
    }

    #[test]
    fn test_recoverability() {
        assert!(ErrorKind::Validation.is_recoverable());
        assert!(ErrorKind::Solvency.is_recoverable());
        assert!(!ErrorKind::Consistency.is_recoverable());
        assert!(!ErrorKind::Collaborator.is_recoverable());
    }

    #[test]
    fn test_pool_error_mapping() {
        assert_eq!(EngineError::from(PoolError::NoPoolFunds), EngineError::NoPoolFunds);
        let err = EngineError::from(PoolError::InsufficientDeposit {
            requested: U256::from(2u64),
            available: U256::from(1u64),
        });
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
}
