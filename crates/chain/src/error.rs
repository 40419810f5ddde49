//! Errors raised by collaborator implementations.

use alloy::primitives::{Address, U256};
use thiserror::Error;

/// Failure of a price lookup, token or collateral movement.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("no price available for asset {asset}")]
    NoPrice { asset: Address },

    #[error("account {account} holds {available}, needs {needed}")]
    InsufficientBalance {
        account: Address,
        needed: U256,
        available: U256,
    },

    #[error("stability pool holds {available} debt tokens, needs {needed}")]
    InsufficientPoolBalance { needed: U256, available: U256 },

    #[error("custody for asset {asset} holds {available}, needs {needed}")]
    InsufficientCustody {
        asset: Address,
        needed: U256,
        available: U256,
    },

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),
}
