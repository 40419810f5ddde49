//! Debt-token capability.

use alloy::primitives::{Address, U256};
use std::collections::HashMap;
use tracing::trace;

use crate::ChainError;

/// Mint/burn capability over the debt token, plus the pool-custody
/// movements used by stability-pool deposits and offsets.
pub trait DebtToken {
    fn balance_of(&self, account: Address) -> U256;

    fn total_supply(&self) -> U256;

    /// Tokens held in stability-pool custody.
    fn pool_balance(&self) -> U256;

    fn mint(&mut self, to: Address, amount: U256) -> Result<(), ChainError>;

    fn burn_from(&mut self, from: Address, amount: U256) -> Result<(), ChainError>;

    /// Move tokens from `from` into pool custody.
    fn send_to_pool(&mut self, from: Address, amount: U256) -> Result<(), ChainError>;

    /// Move tokens from pool custody back to `to`.
    fn return_from_pool(&mut self, to: Address, amount: U256) -> Result<(), ChainError>;

    /// Burn tokens held in pool custody (debt absorbed by an offset).
    fn burn_from_pool(&mut self, amount: U256) -> Result<(), ChainError>;
}

/// Balance-map implementation of [`DebtToken`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryDebtToken {
    balances: HashMap<Address, U256>,
    pool: U256,
    total_supply: U256,
}

impl InMemoryDebtToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Plain holder-to-holder transfer.
    pub fn transfer(&mut self, from: Address, to: Address, amount: U256) -> Result<(), ChainError> {
        self.debit(from, amount)?;
        self.credit(to, amount)
    }

    fn debit(&mut self, account: Address, amount: U256) -> Result<(), ChainError> {
        let available = self.balance_of(account);
        if available < amount {
            return Err(ChainError::InsufficientBalance {
                account,
                needed: amount,
                available,
            });
        }
        self.balances.insert(account, available - amount);
        Ok(())
    }

    fn credit(&mut self, account: Address, amount: U256) -> Result<(), ChainError> {
        let balance = self
            .balance_of(account)
            .checked_add(amount)
            .ok_or(ChainError::Overflow("debt token balance"))?;
        self.balances.insert(account, balance);
        Ok(())
    }

    fn take_from_pool(&mut self, amount: U256) -> Result<(), ChainError> {
        if self.pool < amount {
            return Err(ChainError::InsufficientPoolBalance {
                needed: amount,
                available: self.pool,
            });
        }
        self.pool -= amount;
        Ok(())
    }
}

impl DebtToken for InMemoryDebtToken {
    fn balance_of(&self, account: Address) -> U256 {
        self.balances.get(&account).copied().unwrap_or_default()
    }

    fn total_supply(&self) -> U256 {
        self.total_supply
    }

    fn pool_balance(&self) -> U256 {
        self.pool
    }

    fn mint(&mut self, to: Address, amount: U256) -> Result<(), ChainError> {
        self.total_supply = self
            .total_supply
            .checked_add(amount)
            .ok_or(ChainError::Overflow("debt token supply"))?;
        self.credit(to, amount)?;
        trace!(to = %to, amount = %amount, "Minted");
        Ok(())
    }

    fn burn_from(&mut self, from: Address, amount: U256) -> Result<(), ChainError> {
        self.debit(from, amount)?;
        self.total_supply -= amount;
        trace!(from = %from, amount = %amount, "Burned");
        Ok(())
    }

    fn send_to_pool(&mut self, from: Address, amount: U256) -> Result<(), ChainError> {
        self.debit(from, amount)?;
        self.pool += amount;
        Ok(())
    }

    fn return_from_pool(&mut self, to: Address, amount: U256) -> Result<(), ChainError> {
        self.take_from_pool(amount)?;
        self.credit(to, amount)
    }

    fn burn_from_pool(&mut self, amount: U256) -> Result<(), ChainError> {
        self.take_from_pool(amount)?;
        self.total_supply -= amount;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> Address {
        Address::repeat_byte(1)
    }

    #[test]
    fn test_mint_and_burn_track_supply() {
        let mut token = InMemoryDebtToken::new();
        token.mint(alice(), U256::from(100u64)).unwrap();
        token.burn_from(alice(), U256::from(40u64)).unwrap();

        assert_eq!(token.balance_of(alice()), U256::from(60u64));
        assert_eq!(token.total_supply(), U256::from(60u64));
    }

    #[test]
    fn test_burn_more_than_balance_fails() {
        let mut token = InMemoryDebtToken::new();
        token.mint(alice(), U256::from(10u64)).unwrap();
        let err = token.burn_from(alice(), U256::from(11u64)).unwrap_err();
        assert!(matches!(err, ChainError::InsufficientBalance { .. }));
        assert_eq!(token.total_supply(), U256::from(10u64));
    }

    #[test]
    fn test_pool_custody_round_trip() {
        let mut token = InMemoryDebtToken::new();
        token.mint(alice(), U256::from(50u64)).unwrap();
        token.send_to_pool(alice(), U256::from(30u64)).unwrap();
        assert_eq!(token.pool_balance(), U256::from(30u64));

        token.burn_from_pool(U256::from(10u64)).unwrap();
        token.return_from_pool(alice(), U256::from(20u64)).unwrap();

        assert_eq!(token.pool_balance(), U256::ZERO);
        assert_eq!(token.balance_of(alice()), U256::from(40u64));
        assert_eq!(token.total_supply(), U256::from(40u64));
        assert!(token.burn_from_pool(U256::from(1u64)).is_err());
    }
}
