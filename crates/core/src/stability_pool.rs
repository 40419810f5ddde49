//! Loss-absorption pool with scaled product/sum accounting.
//!
//! Depositors pool debt tokens. A liquidation offset burns pool debt and
//! credits the pool with the seized collateral. Instead of touching every
//! deposit, the pool tracks:
//!
//! - `P`, the running product of `(1 - loss per unit)` factors, so a
//!   deposit's current value is `amount * P / P_snapshot`
//! - `S[asset][epoch][scale]`, the running sum of `gain per unit * P`, so
//!   a deposit's collateral gain is `amount * ΔS / P_snapshot`
//!
//! When `P` would drop below [`SCALE_FACTOR`] it is multiplied back up,
//! as many times as needed, and `scale` increments once per
//! multiplication, so `P` never reaches zero. Only an offset that takes
//! every deposit starts a new epoch, and every older deposit is then worth
//! zero.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::collections::HashMap;
use thiserror::Error;

use crate::u256_math::{self, HIGH_PRECISION, SCALE_FACTOR, WAD};

/// Stability-pool failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PoolError {
    #[error("amount must be non-zero")]
    ZeroAmount,

    #[error("withdrawal of {requested} exceeds compounded deposit {available}")]
    InsufficientDeposit { requested: U256, available: U256 },

    #[error("stability pool holds no deposits")]
    NoPoolFunds,

    #[error("offset of {debt} exceeds pool deposits {deposits}")]
    OffsetExceedsDeposits { debt: U256, deposits: U256 },

    #[error("account {0} has no deposit")]
    NoDeposit(Address),

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),
}

/// Pool state captured when a deposit was last changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositSnapshot {
    pub p: U256,
    pub scale: u64,
    pub epoch: u64,
    /// `S[asset][epoch][scale]` per asset at snapshot time
    pub sums: HashMap<Address, U256>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    /// Value at the time of the snapshot
    pub amount: U256,
    pub snapshot: DepositSnapshot,
}

/// Per-asset collateral gains, one entry per asset with a non-zero gain.
pub type Gains = SmallVec<[(Address, U256); 4]>;

/// A deposit brought up to date against the current pool state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SettledDeposit {
    pub initial: U256,
    pub compounded: U256,
    pub gains: Gains,
}

impl SettledDeposit {
    /// Debt-token value lost to offsets since the last snapshot.
    pub fn debt_loss(&self) -> U256 {
        self.initial.saturating_sub(self.compounded)
    }
}

/// Result of absorbing one liquidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OffsetOutcome {
    pub debt_offset: U256,
    pub collateral_added: U256,
    pub p: U256,
    pub scale: u64,
    pub epoch: u64,
    /// The offset consumed every deposit
    pub depleted: bool,
}

/// Serializable pool summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolSummary {
    pub total_deposits: U256,
    pub p: U256,
    pub scale: u64,
    pub epoch: u64,
    pub depositors: usize,
    pub total_collateral: Vec<(Address, U256)>,
}

#[derive(Debug, Clone)]
pub struct StabilityPool {
    total_deposits: U256,
    p: U256,
    current_scale: u64,
    current_epoch: u64,
    /// (asset, epoch, scale) -> S
    sums: HashMap<(Address, u64, u64), U256>,
    total_collateral: HashMap<Address, U256>,
    last_collateral_error: HashMap<Address, U256>,
    last_debt_loss_error: U256,
    deposits: HashMap<Address, Deposit>,
}

impl Default for StabilityPool {
    fn default() -> Self {
        Self::new()
    }
}

impl StabilityPool {
    pub fn new() -> Self {
        Self {
            total_deposits: U256::ZERO,
            p: WAD,
            current_scale: 0,
            current_epoch: 0,
            sums: HashMap::new(),
            total_collateral: HashMap::new(),
            last_collateral_error: HashMap::new(),
            last_debt_loss_error: U256::ZERO,
            deposits: HashMap::new(),
        }
    }

    /// Start tracking gains in `asset`.
    pub fn register_asset(&mut self, asset: Address) {
        self.total_collateral.entry(asset).or_default();
    }

    pub fn total_deposits(&self) -> U256 {
        self.total_deposits
    }

    pub fn total_collateral(&self, asset: Address) -> U256 {
        self.total_collateral
            .get(&asset)
            .copied()
            .unwrap_or_default()
    }

    pub fn p(&self) -> U256 {
        self.p
    }

    pub fn current_scale(&self) -> u64 {
        self.current_scale
    }

    pub fn current_epoch(&self) -> u64 {
        self.current_epoch
    }

    pub fn sum(&self, asset: Address, epoch: u64, scale: u64) -> U256 {
        self.sums
            .get(&(asset, epoch, scale))
            .copied()
            .unwrap_or_default()
    }

    pub fn deposit(&self, depositor: Address) -> Option<&Deposit> {
        self.deposits.get(&depositor)
    }

    pub fn depositors(&self) -> impl Iterator<Item = Address> + '_ {
        self.deposits.keys().copied()
    }

    pub fn summary(&self) -> PoolSummary {
        let mut total_collateral: Vec<_> = self
            .total_collateral
            .iter()
            .map(|(a, c)| (*a, *c))
            .collect();
        total_collateral.sort_by_key(|(a, _)| *a);
        PoolSummary {
            total_deposits: self.total_deposits,
            p: self.p,
            scale: self.current_scale,
            epoch: self.current_epoch,
            depositors: self.deposits.len(),
            total_collateral,
        }
    }

    /// Current value of a deposit after all offsets since its snapshot.
    pub fn compounded_deposit(&self, depositor: Address) -> U256 {
        let Some(deposit) = self.deposits.get(&depositor) else {
            return U256::ZERO;
        };
        let initial = deposit.amount;
        let snap = &deposit.snapshot;
        if initial.is_zero() || snap.p.is_zero() || snap.epoch < self.current_epoch {
            return U256::ZERO;
        }

        let gap = self.current_scale.saturating_sub(snap.scale);
        let compounded = match scale_divisor(gap) {
            Some(divisor) => {
                u256_math::mul_div(initial, self.p, snap.p).unwrap_or_default() / divisor
            }
            None => U256::ZERO,
        };

        // Below a billionth of the initial value it is rounding noise
        if compounded < initial / SCALE_FACTOR {
            U256::ZERO
        } else {
            compounded
        }
    }

    /// Collateral earned in `asset` since the deposit's snapshot.
    pub fn collateral_gain(&self, depositor: Address, asset: Address) -> U256 {
        let Some(deposit) = self.deposits.get(&depositor) else {
            return U256::ZERO;
        };
        let snap = &deposit.snapshot;
        if deposit.amount.is_zero() || snap.p.is_zero() {
            return U256::ZERO;
        }

        // Each later scale's sum was accumulated against a P that is
        // SCALE_FACTOR larger than the one before it
        let s_snapshot = snap.sums.get(&asset).copied().unwrap_or_default();
        let mut total_sum = self
            .sum(asset, snap.epoch, snap.scale)
            .saturating_sub(s_snapshot);
        let mut gap = 1;
        while let Some(divisor) = scale_divisor(gap) {
            let term = self.sum(asset, snap.epoch, snap.scale + gap) / divisor;
            total_sum = total_sum.saturating_add(term);
            gap += 1;
        }

        let gain = u256_math::mul_div(deposit.amount, total_sum, snap.p)
            .map(|v| v / HIGH_PRECISION)
            .unwrap_or_default();
        u256_math::min(gain, self.total_collateral(asset))
    }

    /// Gains in every asset, skipping zeros.
    pub fn collateral_gains(&self, depositor: Address) -> Gains {
        let mut assets: Vec<_> = self.total_collateral.keys().copied().collect();
        assets.sort();
        assets
            .into_iter()
            .filter_map(|asset| {
                let gain = self.collateral_gain(depositor, asset);
                (!gain.is_zero()).then_some((asset, gain))
            })
            .collect()
    }

    /// Bring a deposit up to date without changing anything.
    pub fn settle(&self, depositor: Address) -> SettledDeposit {
        SettledDeposit {
            initial: self
                .deposits
                .get(&depositor)
                .map(|d| d.amount)
                .unwrap_or_default(),
            compounded: self.compounded_deposit(depositor),
            gains: self.collateral_gains(depositor),
        }
    }

    /// Add `amount` to a deposit. Accrued gains are settled and returned
    /// for payout; the new deposit is `compounded + amount`.
    pub fn provide(&mut self, depositor: Address, amount: U256) -> Result<SettledDeposit, PoolError> {
        if amount.is_zero() {
            return Err(PoolError::ZeroAmount);
        }
        let settled = self.settle(depositor);
        let new_amount = settled
            .compounded
            .checked_add(amount)
            .ok_or(PoolError::Overflow("deposit"))?;

        self.pay_out_gains(&settled.gains);
        self.total_deposits += amount;
        self.set_deposit(depositor, new_amount);
        Ok(settled)
    }

    /// Take `amount` out of a deposit. `amount == 0` only claims gains.
    pub fn withdraw(&mut self, depositor: Address, amount: U256) -> Result<SettledDeposit, PoolError> {
        let initial = self
            .deposits
            .get(&depositor)
            .map(|d| d.amount)
            .unwrap_or_default();
        if initial.is_zero() {
            return Err(PoolError::NoDeposit(depositor));
        }
        let settled = self.settle(depositor);
        if amount > settled.compounded {
            return Err(PoolError::InsufficientDeposit {
                requested: amount,
                available: settled.compounded,
            });
        }

        self.pay_out_gains(&settled.gains);
        self.total_deposits = self.total_deposits.saturating_sub(amount);
        self.set_deposit(depositor, settled.compounded - amount);
        Ok(settled)
    }

    /// Absorb `debt` of liquidated debt and credit `collateral` of `asset`.
    pub fn offset(
        &mut self,
        asset: Address,
        debt: U256,
        collateral: U256,
    ) -> Result<OffsetOutcome, PoolError> {
        let total = self.total_deposits;
        if total.is_zero() {
            return Err(PoolError::NoPoolFunds);
        }
        if debt > total {
            return Err(PoolError::OffsetExceedsDeposits {
                debt,
                deposits: total,
            });
        }
        if debt.is_zero() {
            return Ok(self.outcome(debt, collateral, false));
        }

        let (gain_per_unit, coll_error) = self.collateral_gain_per_unit(asset, collateral, total)?;
        let (loss_per_unit, loss_error) = self.debt_loss_per_unit(debt, total)?;

        // S accumulates against P from before this offset
        let marginal = gain_per_unit
            .checked_mul(self.p)
            .ok_or(PoolError::Overflow("sum increment"))?;
        let key = (asset, self.current_epoch, self.current_scale);
        let new_sum = self
            .sum(asset, self.current_epoch, self.current_scale)
            .checked_add(marginal)
            .ok_or(PoolError::Overflow("sum"))?;

        let new_collateral = self
            .total_collateral(asset)
            .checked_add(collateral)
            .ok_or(PoolError::Overflow("pool collateral"))?;

        let depleted = loss_per_unit == WAD;
        let (p, scale) = if depleted {
            (WAD, 0)
        } else {
            self.next_product(WAD - loss_per_unit)?
        };

        self.sums.insert(key, new_sum);
        self.last_collateral_error.insert(asset, coll_error);
        self.last_debt_loss_error = loss_error;
        if depleted {
            self.current_epoch += 1;
        }
        self.p = p;
        self.current_scale = scale;

        self.total_deposits = total - debt;
        self.total_collateral.insert(asset, new_collateral);
        Ok(self.outcome(debt, collateral, depleted))
    }

    fn outcome(&self, debt: U256, collateral: U256, depleted: bool) -> OffsetOutcome {
        OffsetOutcome {
            debt_offset: debt,
            collateral_added: collateral,
            p: self.p,
            scale: self.current_scale,
            epoch: self.current_epoch,
            depleted,
        }
    }

    /// `(coll * 1e27 + carried) / total`, with the new remainder.
    fn collateral_gain_per_unit(
        &self,
        asset: Address,
        collateral: U256,
        total: U256,
    ) -> Result<(U256, U256), PoolError> {
        let carried = self
            .last_collateral_error
            .get(&asset)
            .copied()
            .unwrap_or_default();
        let numerator = collateral
            .checked_mul(HIGH_PRECISION)
            .and_then(|v| v.checked_add(carried))
            .ok_or(PoolError::Overflow("collateral gain"))?;
        let per_unit = numerator / total;
        Ok((per_unit, numerator - per_unit * total))
    }

    /// Loss per unit deposit, rounded up so the pool never overstates
    /// what depositors still hold. Only an offset of the whole pool reaches
    /// a full unit; anything less stops one below it and keeps the epoch.
    fn debt_loss_per_unit(&self, debt: U256, total: U256) -> Result<(U256, U256), PoolError> {
        if debt == total {
            return Ok((WAD, U256::ZERO));
        }
        let numerator = debt
            .checked_mul(WAD)
            .ok_or(PoolError::Overflow("debt loss"))?
            .saturating_sub(self.last_debt_loss_error);
        let per_unit = u256_math::min(numerator / total + U256::from(1u64), WAD - U256::from(1u64));
        Ok((per_unit, (per_unit * total).saturating_sub(numerator)))
    }

    /// `P * factor`, rescaled by [`SCALE_FACTOR`] until it is back at or
    /// above it. `P >= SCALE_FACTOR` and `factor >= 1` keep the product
    /// non-zero, so the loop ends within two rounds.
    fn next_product(&self, factor: U256) -> Result<(U256, u64), PoolError> {
        let mut product = self
            .p
            .checked_mul(factor)
            .ok_or(PoolError::Overflow("product"))?;
        let mut scale = self.current_scale;
        while product / WAD < SCALE_FACTOR {
            product = product
                .checked_mul(SCALE_FACTOR)
                .ok_or(PoolError::Overflow("product"))?;
            scale += 1;
        }
        Ok((product / WAD, scale))
    }

    fn pay_out_gains(&mut self, gains: &Gains) {
        for (asset, gain) in gains {
            let held = self.total_collateral.entry(*asset).or_default();
            *held = held.saturating_sub(*gain);
        }
    }

    fn set_deposit(&mut self, depositor: Address, amount: U256) {
        if amount.is_zero() {
            self.deposits.remove(&depositor);
            return;
        }
        let sums = self
            .total_collateral
            .keys()
            .map(|asset| {
                (
                    *asset,
                    self.sum(*asset, self.current_epoch, self.current_scale),
                )
            })
            .collect();
        self.deposits.insert(
            depositor,
            Deposit {
                amount,
                snapshot: DepositSnapshot {
                    p: self.p,
                    scale: self.current_scale,
                    epoch: self.current_epoch,
                    sums,
                },
            },
        );
    }
}

/// `SCALE_FACTOR^gap`, or `None` once it no longer fits in 256 bits and
/// anything divided by it is zero.
fn scale_divisor(gap: u64) -> Option<U256> {
    SCALE_FACTOR.checked_pow(U256::from(gap))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::u256_math::wad;

    fn asset() -> Address {
        Address::repeat_byte(0xAA)
    }

    fn user(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    fn pool_with(deposits: &[(u8, u64)]) -> StabilityPool {
        let mut pool = StabilityPool::new();
        pool.register_asset(asset());
        for (n, amount) in deposits {
            pool.provide(user(*n), wad(*amount)).unwrap();
        }
        pool
    }

    #[test]
    fn test_full_depletion_zeroes_deposits_and_splits_gains() {
        let mut pool = pool_with(&[(1, 1_000), (2, 2_000), (3, 3_000)]);

        let outcome = pool.offset(asset(), wad(6_000), wad(3)).unwrap();
        assert!(outcome.depleted);
        assert_eq!(pool.current_epoch(), 1);
        assert_eq!(pool.p(), WAD);
        assert!(pool.total_deposits().is_zero());

        for n in 1..=3 {
            assert!(pool.compounded_deposit(user(n)).is_zero());
        }
        assert_eq!(pool.collateral_gain(user(1), asset()), WAD / U256::from(2u64));
        assert_eq!(pool.collateral_gain(user(2), asset()), wad(1));
        assert_eq!(
            pool.collateral_gain(user(3), asset()),
            wad(3) / U256::from(2u64)
        );
    }

    #[test]
    fn test_partial_offset_compounds_pro_rata() {
        let mut pool = pool_with(&[(1, 1_000), (2, 3_000)]);
        pool.offset(asset(), wad(2_000), wad(1)).unwrap();

        // Each deposit keeps half its value, rounded down by the loss error
        let c1 = pool.compounded_deposit(user(1));
        let c2 = pool.compounded_deposit(user(2));
        assert!(c1 <= wad(500) && wad(500) - c1 < U256::from(1_000_000u64));
        assert!(c2 <= wad(1_500) && wad(1_500) - c2 < U256::from(1_000_000u64));

        let g1 = pool.collateral_gain(user(1), asset());
        let g2 = pool.collateral_gain(user(2), asset());
        assert!(g1 + g2 <= wad(1));
        assert_eq!(g1, wad(1) / U256::from(4u64));
    }

    #[test]
    fn test_deposit_after_offset_gets_no_old_gains() {
        let mut pool = pool_with(&[(1, 1_000)]);
        pool.offset(asset(), wad(500), wad(1)).unwrap();
        pool.provide(user(2), wad(1_000)).unwrap();

        assert!(pool.collateral_gain(user(2), asset()).is_zero());
        assert_eq!(pool.compounded_deposit(user(2)), wad(1_000));
    }

    #[test]
    fn test_provide_settles_gains() {
        let mut pool = pool_with(&[(1, 1_000)]);
        pool.offset(asset(), wad(500), wad(1)).unwrap();

        let settled = pool.provide(user(1), wad(100)).unwrap();
        assert_eq!(settled.gains.as_slice(), &[(asset(), wad(1))]);
        assert!(settled.debt_loss() >= wad(500));
        assert!(pool.collateral_gain(user(1), asset()).is_zero());
        assert!(pool.total_collateral(asset()).is_zero());
    }

    #[test]
    fn test_withdraw_rules() {
        let mut pool = pool_with(&[(1, 1_000)]);
        assert_eq!(
            pool.withdraw(user(2), wad(1)),
            Err(PoolError::NoDeposit(user(2)))
        );
        assert!(matches!(
            pool.withdraw(user(1), wad(1_001)),
            Err(PoolError::InsufficientDeposit { .. })
        ));

        // Zero withdrawal only claims gains
        let settled = pool.withdraw(user(1), U256::ZERO).unwrap();
        assert_eq!(settled.compounded, wad(1_000));
        assert_eq!(pool.compounded_deposit(user(1)), wad(1_000));

        pool.withdraw(user(1), wad(1_000)).unwrap();
        assert!(pool.deposit(user(1)).is_none());
        assert!(pool.total_deposits().is_zero());
    }

    #[test]
    fn test_offset_guards() {
        let mut pool = pool_with(&[]);
        assert_eq!(
            pool.offset(asset(), wad(1), wad(1)),
            Err(PoolError::NoPoolFunds)
        );

        let mut pool = pool_with(&[(1, 10)]);
        assert!(matches!(
            pool.offset(asset(), wad(11), wad(1)),
            Err(PoolError::OffsetExceedsDeposits { .. })
        ));
        assert_eq!(pool.provide(user(1), U256::ZERO), Err(PoolError::ZeroAmount));
    }

    #[test]
    fn test_scale_change_keeps_value() {
        let mut pool = pool_with(&[(1, 1_000)]);
        let leftover = wad(1) / U256::from(100u64);

        // Shrink P to ~1e-5, then a fresh deposit at that P
        pool.offset(asset(), wad(1_000) - leftover, wad(1)).unwrap();
        assert_eq!(pool.current_scale(), 0);
        pool.provide(user(2), wad(1_000)).unwrap();

        // Another ~1e-5 factor pushes P under the scale boundary
        pool.offset(asset(), wad(1_000), wad(1)).unwrap();
        assert_eq!(pool.current_scale(), 1);
        assert_eq!(pool.current_epoch(), 0);

        // The old deposit is below a billionth of its value
        assert!(pool.compounded_deposit(user(1)).is_zero());

        let c2 = pool.compounded_deposit(user(2));
        assert!(c2 <= pool.total_deposits());
        assert!(c2 >= pool.total_deposits() * U256::from(99u64) / U256::from(100u64));

        // Gains from the next scale still reach the older snapshot
        pool.offset(asset(), leftover / U256::from(10u64), wad(1)).unwrap();
        let gain = pool.collateral_gain(user(2), asset());
        assert!(gain > wad(19) / U256::from(10u64));
        assert!(gain <= wad(2));
    }

    #[test]
    fn test_product_stays_positive_through_near_total_offsets() {
        let mut pool = pool_with(&[]);
        let mut last_scale = 0;
        for n in 1..=5 {
            pool.provide(user(n), wad(1)).unwrap();
            // Leave a single wei behind every time
            let debt = pool.total_deposits() - U256::from(1u64);
            let outcome = pool.offset(asset(), debt, wad(1)).unwrap();

            assert!(!outcome.depleted);
            assert_eq!(pool.current_epoch(), 0);
            assert_eq!(pool.total_deposits(), U256::from(1u64));
            assert!(pool.p() >= SCALE_FACTOR && pool.p() <= WAD);
            assert!(pool.current_scale() > last_scale);
            last_scale = pool.current_scale();
        }

        // A fresh deposit still compounds and earns normally
        pool.provide(user(10), wad(100)).unwrap();
        pool.offset(asset(), wad(10), wad(5)).unwrap();
        assert!(pool.p() > U256::ZERO);

        let compounded = pool.compounded_deposit(user(10));
        assert!(compounded <= wad(90) && compounded > wad(89));
        let gain = pool.collateral_gain(user(10), asset());
        assert!(gain <= wad(5) && gain > wad(5) - U256::from(1_000_000u64));
    }

    #[test]
    fn test_offset_short_of_total_keeps_epoch() {
        let mut pool = pool_with(&[(1, 1_000)]);
        let outcome = pool
            .offset(asset(), wad(1_000) - U256::from(1u64), wad(1))
            .unwrap();

        assert!(!outcome.depleted);
        assert_eq!(pool.current_epoch(), 0);
        assert_eq!(pool.total_deposits(), U256::from(1u64));
        assert!(pool.p() >= SCALE_FACTOR);

        // The only depositor keeps the whole gain
        let gain = pool.collateral_gain(user(1), asset());
        assert!(gain <= wad(1) && gain > wad(1) - U256::from(1_000u64));
    }

    #[test]
    fn test_no_dilution_above_principal() {
        let mut pool = pool_with(&[(1, 700), (2, 300)]);
        pool.offset(asset(), wad(123), wad(1)).unwrap();
        pool.offset(asset(), wad(77), wad(1)).unwrap();

        let c1 = pool.compounded_deposit(user(1));
        let c2 = pool.compounded_deposit(user(2));
        assert!(c1 <= wad(700));
        assert!(c2 <= wad(300));
        assert!(c1 + c2 <= pool.total_deposits());
    }
}
