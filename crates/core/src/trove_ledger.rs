//! Trove records and per-asset reward accumulators.
//!
//! Redistributed debt and collateral are not pushed into every trove.
//! Instead each asset carries running per-stake totals `L_collateral` and
//! `L_debt`; a trove's share is `stake * (L - snapshot) / WAD`, applied
//! lazily the next time the trove is touched.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::u256_math::{self, WAD};

/// Ledger failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("asset {0} is not registered")]
    UnknownAsset(Address),

    #[error("cannot redistribute over zero stakes for asset {0}")]
    NoStakes(Address),

    #[error("arithmetic overflow in {0}")]
    Overflow(&'static str),
}

/// Lifecycle of a trove.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TroveStatus {
    #[default]
    NonExistent,
    Active,
    ClosedByOwner,
    ClosedByLiquidation,
    ClosedByRedemption,
}

impl TroveStatus {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }
}

/// `L_collateral` / `L_debt` as seen by a trove at its last update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardSnapshot {
    pub collateral: U256,
    pub debt: U256,
}

/// One account's position in one collateral asset.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trove {
    pub debt: U256,
    pub collateral: U256,
    pub stake: U256,
    pub status: TroveStatus,
    pub snapshot: RewardSnapshot,
}

impl Trove {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    /// Nominal collateral ratio, the ordered-index key.
    pub fn nicr(&self) -> U256 {
        u256_math::compute_nominal_cr(self.collateral, self.debt)
    }

    /// Collateral ratio at `price`.
    pub fn icr(&self, price: U256) -> U256 {
        u256_math::compute_cr(self.collateral, self.debt, price)
    }
}

/// Redistribution rewards not yet applied to a trove.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingRewards {
    pub collateral: U256,
    pub debt: U256,
}

impl PendingRewards {
    pub fn is_zero(&self) -> bool {
        self.collateral.is_zero() && self.debt.is_zero()
    }
}

/// Per-asset accumulators and pool totals.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetState {
    pub total_stakes: U256,
    /// `total_stakes` right after the last liquidation
    pub total_stakes_snapshot: U256,
    /// Collateral in the system right after the last liquidation
    pub total_collateral_snapshot: U256,
    pub l_collateral: U256,
    pub l_debt: U256,
    pub last_collateral_error: U256,
    pub last_debt_error: U256,
    /// Owned by open troves, including applied rewards
    pub active_collateral: U256,
    pub active_debt: U256,
    /// Redistributed but not yet applied to any trove
    pub default_collateral: U256,
    pub default_debt: U256,
    /// Claimable surplus held for closed troves
    pub surplus_collateral: U256,
}

impl AssetState {
    /// Collateral backing open troves (active + pending).
    pub fn entire_collateral(&self) -> U256 {
        self.active_collateral + self.default_collateral
    }

    pub fn entire_debt(&self) -> U256 {
        self.active_debt + self.default_debt
    }
}

/// Rewards a trove would receive if touched now.
pub fn pending_rewards(trove: &Trove, state: &AssetState) -> PendingRewards {
    if !trove.is_active() || trove.stake.is_zero() {
        return PendingRewards::default();
    }
    let share = |l: U256, snap: U256| {
        u256_math::mul_div(trove.stake, l.saturating_sub(snap), WAD).unwrap_or_default()
    };
    PendingRewards {
        collateral: share(state.l_collateral, trove.snapshot.collateral),
        debt: share(state.l_debt, trove.snapshot.debt),
    }
}

/// The trove with its pending rewards folded in and the snapshot brought
/// up to date. Applying twice gives the same result.
pub fn apply_pending(trove: &Trove, state: &AssetState) -> Trove {
    if !trove.is_active() {
        return *trove;
    }
    let pending = pending_rewards(trove, state);
    Trove {
        debt: trove.debt + pending.debt,
        collateral: trove.collateral + pending.collateral,
        snapshot: RewardSnapshot {
            collateral: state.l_collateral,
            debt: state.l_debt,
        },
        ..*trove
    }
}

/// Store of troves, accumulators and surplus balances.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TroveLedger {
    troves: HashMap<(Address, Address), Trove>,
    assets: HashMap<Address, AssetState>,
    surplus: HashMap<(Address, Address), U256>,
}

impl TroveLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_asset(&mut self, asset: Address) {
        self.assets.entry(asset).or_default();
    }

    pub fn is_registered(&self, asset: Address) -> bool {
        self.assets.contains_key(&asset)
    }

    pub fn assets(&self) -> impl Iterator<Item = (&Address, &AssetState)> {
        self.assets.iter()
    }

    pub fn asset_state(&self, asset: Address) -> Result<&AssetState, LedgerError> {
        self.assets.get(&asset).ok_or(LedgerError::UnknownAsset(asset))
    }

    fn asset_state_mut(&mut self, asset: Address) -> Result<&mut AssetState, LedgerError> {
        self.assets
            .get_mut(&asset)
            .ok_or(LedgerError::UnknownAsset(asset))
    }

    /// Stored record, `NonExistent` if the account never opened one.
    pub fn trove(&self, account: Address, asset: Address) -> Trove {
        self.troves
            .get(&(account, asset))
            .copied()
            .unwrap_or_default()
    }

    pub fn pending_rewards(&self, account: Address, asset: Address) -> PendingRewards {
        match self.assets.get(&asset) {
            Some(state) => pending_rewards(&self.trove(account, asset), state),
            None => PendingRewards::default(),
        }
    }

    /// The trove as it would look with pending rewards applied.
    pub fn entire_trove(&self, account: Address, asset: Address) -> Result<Trove, LedgerError> {
        let state = self.asset_state(asset)?;
        Ok(apply_pending(&self.trove(account, asset), state))
    }

    /// Stake for a trove holding `collateral`.
    pub fn compute_new_stake(&self, asset: Address, collateral: U256) -> Result<U256, LedgerError> {
        let state = self.asset_state(asset)?;
        if state.total_collateral_snapshot.is_zero() {
            return Ok(collateral);
        }
        u256_math::mul_div(
            collateral,
            state.total_stakes_snapshot,
            state.total_collateral_snapshot,
        )
        .ok_or(LedgerError::Overflow("stake"))
    }

    /// Fold pending rewards into the stored trove, moving them from the
    /// default totals to the active ones.
    pub fn apply_pending_rewards(
        &mut self,
        account: Address,
        asset: Address,
    ) -> Result<PendingRewards, LedgerError> {
        let trove = self.trove(account, asset);
        let state = self.asset_state_mut(asset)?;
        if !trove.is_active() {
            return Ok(PendingRewards::default());
        }

        let pending = pending_rewards(&trove, state);
        let updated = apply_pending(&trove, state);
        state.default_collateral = state.default_collateral.saturating_sub(pending.collateral);
        state.default_debt = state.default_debt.saturating_sub(pending.debt);
        state.active_collateral += pending.collateral;
        state.active_debt += pending.debt;
        self.troves.insert((account, asset), updated);
        Ok(pending)
    }

    /// Create an active trove. Returns the assigned stake.
    pub fn open(
        &mut self,
        account: Address,
        asset: Address,
        collateral: U256,
        debt: U256,
    ) -> Result<U256, LedgerError> {
        let stake = self.compute_new_stake(asset, collateral)?;
        let state = self.asset_state_mut(asset)?;
        state.total_stakes += stake;
        state.active_collateral += collateral;
        state.active_debt += debt;
        let snapshot = RewardSnapshot {
            collateral: state.l_collateral,
            debt: state.l_debt,
        };
        self.troves.insert(
            (account, asset),
            Trove {
                debt,
                collateral,
                stake,
                status: TroveStatus::Active,
                snapshot,
            },
        );
        Ok(stake)
    }

    /// Set new collateral/debt for an active trove whose rewards are
    /// already applied, recomputing its stake.
    pub fn update(
        &mut self,
        account: Address,
        asset: Address,
        collateral: U256,
        debt: U256,
    ) -> Result<Trove, LedgerError> {
        let old = self.trove(account, asset);
        let stake = self.compute_new_stake(asset, collateral)?;
        let state = self.asset_state_mut(asset)?;

        state.total_stakes = state.total_stakes.saturating_sub(old.stake) + stake;
        state.active_collateral = state.active_collateral.saturating_sub(old.collateral) + collateral;
        state.active_debt = state.active_debt.saturating_sub(old.debt) + debt;

        let trove = Trove {
            debt,
            collateral,
            stake,
            ..old
        };
        self.troves.insert((account, asset), trove);
        Ok(trove)
    }

    /// Close a trove with a terminal status, removing its stake and its
    /// amounts from the active totals. Returns the trove as it was.
    pub fn close(
        &mut self,
        account: Address,
        asset: Address,
        status: TroveStatus,
    ) -> Result<Trove, LedgerError> {
        let old = self.trove(account, asset);
        let state = self.asset_state_mut(asset)?;
        state.total_stakes = state.total_stakes.saturating_sub(old.stake);
        state.active_collateral = state.active_collateral.saturating_sub(old.collateral);
        state.active_debt = state.active_debt.saturating_sub(old.debt);

        self.troves.insert(
            (account, asset),
            Trove {
                status,
                ..Trove::default()
            },
        );
        Ok(old)
    }

    /// Spread `debt` and `collateral` over all remaining stakes of `asset`.
    ///
    /// Division remainders are carried into the next redistribution.
    pub fn redistribute(
        &mut self,
        asset: Address,
        debt: U256,
        collateral: U256,
    ) -> Result<(), LedgerError> {
        if debt.is_zero() {
            return Ok(());
        }
        let state = self.asset_state_mut(asset)?;
        if state.total_stakes.is_zero() {
            return Err(LedgerError::NoStakes(asset));
        }

        let coll_numerator = collateral
            .checked_mul(WAD)
            .and_then(|v| v.checked_add(state.last_collateral_error))
            .ok_or(LedgerError::Overflow("collateral redistribution"))?;
        let debt_numerator = debt
            .checked_mul(WAD)
            .and_then(|v| v.checked_add(state.last_debt_error))
            .ok_or(LedgerError::Overflow("debt redistribution"))?;

        let coll_per_stake = coll_numerator / state.total_stakes;
        let debt_per_stake = debt_numerator / state.total_stakes;

        state.last_collateral_error = coll_numerator - coll_per_stake * state.total_stakes;
        state.last_debt_error = debt_numerator - debt_per_stake * state.total_stakes;
        state.l_collateral += coll_per_stake;
        state.l_debt += debt_per_stake;
        state.default_collateral += collateral;
        state.default_debt += debt;
        Ok(())
    }

    /// Record the stake/collateral ratio used for stakes of later troves.
    pub fn update_system_snapshots(&mut self, asset: Address) -> Result<(), LedgerError> {
        let state = self.asset_state_mut(asset)?;
        state.total_stakes_snapshot = state.total_stakes;
        state.total_collateral_snapshot = state.entire_collateral();
        Ok(())
    }

    pub fn surplus_of(&self, account: Address, asset: Address) -> U256 {
        self.surplus
            .get(&(account, asset))
            .copied()
            .unwrap_or_default()
    }

    pub fn add_surplus(
        &mut self,
        account: Address,
        asset: Address,
        amount: U256,
    ) -> Result<(), LedgerError> {
        if amount.is_zero() {
            return Ok(());
        }
        self.asset_state_mut(asset)?.surplus_collateral += amount;
        *self.surplus.entry((account, asset)).or_default() += amount;
        Ok(())
    }

    /// Remove and return the account's surplus for `asset`.
    pub fn take_surplus(&mut self, account: Address, asset: Address) -> Result<U256, LedgerError> {
        let amount = self.surplus.remove(&(account, asset)).unwrap_or_default();
        let state = self.asset_state_mut(asset)?;
        state.surplus_collateral = state.surplus_collateral.saturating_sub(amount);
        Ok(amount)
    }
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

    #[test]
    fn test_open_and_close() {
        let mut ledger = TroveLedger::new();
        ledger.register_asset(asset());

        let stake = ledger.open(user(1), asset(), wad(10), wad(5_000)).unwrap();
        assert_eq!(stake, wad(10));

        let trove = ledger.trove(user(1), asset());
        assert!(trove.is_active());
        assert_eq!(trove.nicr(), wad(10) * WAD / wad(5_000));

        let state = ledger.asset_state(asset()).unwrap();
        assert_eq!(state.total_stakes, wad(10));
        assert_eq!(state.active_debt, wad(5_000));

        let old = ledger.close(user(1), asset(), TroveStatus::ClosedByOwner).unwrap();
        assert_eq!(old.collateral, wad(10));
        let closed = ledger.trove(user(1), asset());
        assert_eq!(closed.status, TroveStatus::ClosedByOwner);
        assert!(closed.collateral.is_zero() && closed.debt.is_zero() && closed.stake.is_zero());

        let state = ledger.asset_state(asset()).unwrap();
        assert!(state.total_stakes.is_zero());
        assert!(state.active_collateral.is_zero());
    }

    #[test]
    fn test_redistribution_is_pro_rata() {
        let mut ledger = TroveLedger::new();
        ledger.register_asset(asset());
        ledger.open(user(1), asset(), wad(10), wad(1_000)).unwrap();
        ledger.open(user(2), asset(), wad(30), wad(1_000)).unwrap();

        ledger.redistribute(asset(), wad(400), wad(4)).unwrap();

        let p1 = ledger.pending_rewards(user(1), asset());
        let p2 = ledger.pending_rewards(user(2), asset());
        assert_eq!(p1.debt, wad(100));
        assert_eq!(p1.collateral, wad(1));
        assert_eq!(p2.debt, wad(300));
        assert_eq!(p2.collateral, wad(3));

        let state = ledger.asset_state(asset()).unwrap();
        assert_eq!(state.default_debt, wad(400));
        assert_eq!(state.entire_debt(), wad(2_400));
    }

    #[test]
    fn test_apply_pending_is_idempotent() {
        let mut ledger = TroveLedger::new();
        ledger.register_asset(asset());
        ledger.open(user(1), asset(), wad(10), wad(1_000)).unwrap();
        ledger.open(user(2), asset(), wad(10), wad(1_000)).unwrap();
        ledger.redistribute(asset(), wad(200), wad(2)).unwrap();

        let state = ledger.asset_state(asset()).unwrap().clone();
        let once = apply_pending(&ledger.trove(user(1), asset()), &state);
        let twice = apply_pending(&once, &state);
        assert_eq!(once, twice);
        assert_eq!(once.debt, wad(1_100));

        let applied = ledger.apply_pending_rewards(user(1), asset()).unwrap();
        assert_eq!(applied.debt, wad(100));
        assert!(ledger
            .apply_pending_rewards(user(1), asset())
            .unwrap()
            .is_zero());

        let state = ledger.asset_state(asset()).unwrap();
        assert_eq!(state.default_debt, wad(100));
        assert_eq!(state.active_debt, wad(2_100));
    }

    #[test]
    fn test_redistribution_error_is_carried() {
        let mut ledger = TroveLedger::new();
        ledger.register_asset(asset());
        for n in 1..=3 {
            ledger.open(user(n), asset(), U256::from(1u64), U256::from(1u64)).unwrap();
        }

        // 1 wei * 1e18 / 3 stakes leaves a remainder of 1
        ledger
            .redistribute(asset(), U256::from(1u64), U256::from(1u64))
            .unwrap();
        let state = ledger.asset_state(asset()).unwrap();
        assert_eq!(state.last_debt_error, U256::from(1u64));
        assert_eq!(state.l_debt, WAD / U256::from(3u64));
    }

    #[test]
    fn test_redistribution_without_stakes_fails() {
        let mut ledger = TroveLedger::new();
        ledger.register_asset(asset());
        assert_eq!(
            ledger.redistribute(asset(), wad(1), wad(1)),
            Err(LedgerError::NoStakes(asset()))
        );
        // Nothing to spread is a no-op
        assert!(ledger.redistribute(asset(), U256::ZERO, U256::ZERO).is_ok());
    }

    #[test]
    fn test_stake_uses_system_snapshots() {
        let mut ledger = TroveLedger::new();
        ledger.register_asset(asset());
        ledger.open(user(1), asset(), wad(10), wad(1_000)).unwrap();
        ledger.open(user(2), asset(), wad(10), wad(1_000)).unwrap();

        // Liquidate user 2 by redistribution, then refresh snapshots
        let gone = ledger.close(user(2), asset(), TroveStatus::ClosedByLiquidation).unwrap();
        ledger.redistribute(asset(), gone.debt, gone.collateral).unwrap();
        ledger.update_system_snapshots(asset()).unwrap();

        // 10 stakes now stand for 20 collateral
        assert_eq!(ledger.compute_new_stake(asset(), wad(10)).unwrap(), wad(5));
    }

    #[test]
    fn test_surplus_round_trip() {
        let mut ledger = TroveLedger::new();
        ledger.register_asset(asset());
        ledger.add_surplus(user(1), asset(), wad(2)).unwrap();
        assert_eq!(ledger.surplus_of(user(1), asset()), wad(2));
        assert_eq!(ledger.asset_state(asset()).unwrap().surplus_collateral, wad(2));

        assert_eq!(ledger.take_surplus(user(1), asset()).unwrap(), wad(2));
        assert!(ledger.take_surplus(user(1), asset()).unwrap().is_zero());
        assert!(ledger.asset_state(asset()).unwrap().surplus_collateral.is_zero());
    }

    #[test]
    fn test_unknown_asset() {
        let ledger = TroveLedger::new();
        assert_eq!(
            ledger.compute_new_stake(asset(), wad(1)),
            Err(LedgerError::UnknownAsset(asset()))
        );
    }
}
