//! Collateral custody.

use alloy::primitives::{Address, U256};
use std::collections::HashMap;
use tracing::trace;

use crate::ChainError;

/// Moves collateral between user wallets and protocol custody.
///
/// `transfer` may draw from wherever the implementation keeps reserves;
/// the core only sees succeed-or-abort.
pub trait CollateralVault {
    /// Wallet balance of `account`.
    fn balance_of(&self, asset: Address, account: Address) -> U256;

    /// Collateral held by the protocol.
    fn custody(&self, asset: Address) -> U256;

    /// Pull collateral from a wallet into custody.
    fn pull(&mut self, asset: Address, from: Address, amount: U256) -> Result<(), ChainError>;

    /// Send collateral from custody to a wallet.
    fn transfer(&mut self, asset: Address, to: Address, amount: U256) -> Result<(), ChainError>;
}

/// Balance-map implementation of [`CollateralVault`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryCollateralVault {
    wallets: HashMap<(Address, Address), U256>,
    custody: HashMap<Address, U256>,
}

impl InMemoryCollateralVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Credit a wallet out of thin air (test and simulation seeding).
    pub fn fund(&mut self, asset: Address, account: Address, amount: U256) {
        let balance = self.wallets.entry((asset, account)).or_default();
        *balance = balance.saturating_add(amount);
    }
}

impl CollateralVault for InMemoryCollateralVault {
    fn balance_of(&self, asset: Address, account: Address) -> U256 {
        self.wallets.get(&(asset, account)).copied().unwrap_or_default()
    }

    fn custody(&self, asset: Address) -> U256 {
        self.custody.get(&asset).copied().unwrap_or_default()
    }

    fn pull(&mut self, asset: Address, from: Address, amount: U256) -> Result<(), ChainError> {
        let available = self.balance_of(asset, from);
        if available < amount {
            return Err(ChainError::InsufficientBalance {
                account: from,
                needed: amount,
                available,
            });
        }
        self.wallets.insert((asset, from), available - amount);
        let held = self.custody.entry(asset).or_default();
        *held = held
            .checked_add(amount)
            .ok_or(ChainError::Overflow("collateral custody"))?;
        trace!(asset = %asset, from = %from, amount = %amount, "Collateral pulled");
        Ok(())
    }

    fn transfer(&mut self, asset: Address, to: Address, amount: U256) -> Result<(), ChainError> {
        let available = self.custody(asset);
        if available < amount {
            return Err(ChainError::InsufficientCustody {
                asset,
                needed: amount,
                available,
            });
        }
        self.custody.insert(asset, available - amount);
        self.fund(asset, to, amount);
        trace!(asset = %asset, to = %to, amount = %amount, "Collateral sent");
        Ok(())
    }
}
