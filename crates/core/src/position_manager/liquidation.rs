//! Liquidation: single, batch and sequential from the head of the index.
//!
//! Each trove is planned against the state left by the previous one and
//! committed immediately. A call that aborts part way rolls all of its
//! commits back. Debt-token burns and the liquidator's gas compensation
//! are paid once, after the last trove.

use alloy::primitives::{Address, U256};
use cdp_chain::{Clock, CollateralVault, DebtToken, PriceFeed};
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, info, instrument, warn};

use super::PositionManager;
use crate::error::{EngineError, Result};
use crate::events::{Event, LiquidationMode};
use crate::trove_ledger::{Trove, TroveStatus};
use crate::u256_math;

/// Aggregate of one liquidation call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LiquidationTotals {
    pub liquidated: SmallVec<[Address; 8]>,
    /// Debt of the liquidated troves, pending rewards included
    pub debt: U256,
    /// Collateral seized, gas compensation included
    pub collateral: U256,
    pub debt_offset: U256,
    pub collateral_offset: U256,
    pub debt_redistributed: U256,
    pub collateral_redistributed: U256,
    pub gas_compensation: U256,
    /// Collateral left to owners of capped troves
    pub surplus: U256,
}

impl LiquidationTotals {
    fn add(&mut self, account: Address, plan: &LiquidationPlan) {
        self.liquidated.push(account);
        self.debt += plan.trove.debt;
        self.collateral += plan.trove.collateral - plan.surplus;
        self.debt_offset += plan.debt_to_offset;
        self.collateral_offset += plan.collateral_to_offset;
        self.debt_redistributed += plan.debt_to_redistribute;
        self.collateral_redistributed += plan.collateral_to_redistribute;
        self.gas_compensation += plan.gas_compensation;
        self.surplus += plan.surplus;
    }

    pub fn is_empty(&self) -> bool {
        self.liquidated.is_empty()
    }
}

/// How one trove's debt and collateral are disposed of.
#[derive(Debug, Clone, Copy)]
struct LiquidationPlan {
    trove: Trove,
    mode: LiquidationMode,
    recovery_mode: bool,
    icr: U256,
    gas_compensation: U256,
    debt_to_offset: U256,
    collateral_to_offset: U256,
    debt_to_redistribute: U256,
    collateral_to_redistribute: U256,
    surplus: U256,
}

impl<F, T, V, C> PositionManager<F, T, V, C>
where
    F: PriceFeed,
    T: DebtToken,
    V: CollateralVault,
    C: Clock,
{
    /// Liquidate one trove.
    #[instrument(skip(self), fields(account = %account, asset = %asset))]
    pub fn liquidate(
        &mut self,
        liquidator: Address,
        account: Address,
        asset: Address,
    ) -> Result<LiquidationTotals> {
        self.guarded(|engine| {
            engine.require_asset(asset)?;
            let price = engine.fetch_price(asset)?;
            let plan = engine.plan_liquidation(account, asset, price)?;

            let totals = engine.atomic(|engine| {
                engine.commit_liquidation(account, asset, &plan)?;
                let mut totals = LiquidationTotals::default();
                totals.add(account, &plan);
                Ok(totals)
            })?;

            engine.finish_liquidation(liquidator, asset, price, &totals)?;
            Ok(totals)
        })
    }

    /// Liquidate every liquidatable trove among `candidates`, skipping the
    /// rest. `max_iterations == 0` tries them all.
    #[instrument(skip(self, candidates), fields(asset = %asset, candidates = candidates.len()))]
    pub fn batch_liquidate(
        &mut self,
        liquidator: Address,
        asset: Address,
        candidates: &[Address],
        max_iterations: usize,
    ) -> Result<LiquidationTotals> {
        self.guarded(|engine| {
            engine.require_asset(asset)?;
            if candidates.is_empty() {
                return Err(EngineError::EmptyCandidates);
            }
            let max = engine.config.limits.max_batch_size;
            if candidates.len() > max {
                return Err(EngineError::BatchTooLarge {
                    size: candidates.len(),
                    max,
                });
            }
            let price = engine.fetch_price(asset)?;

            let limit = if max_iterations == 0 {
                candidates.len()
            } else {
                max_iterations
            };
            let totals = engine.atomic(|engine| {
                let mut totals = LiquidationTotals::default();
                for &account in candidates.iter().take(limit) {
                    let plan = match engine.plan_liquidation(account, asset, price) {
                        Ok(plan) => plan,
                        Err(e) if e.kind().is_recoverable() => {
                            debug!(account = %account, error = %e, "Skipping candidate");
                            continue;
                        }
                        Err(e) => return Err(e),
                    };
                    engine.commit_liquidation(account, asset, &plan)?;
                    totals.add(account, &plan);
                }
                if totals.is_empty() {
                    return Err(EngineError::NothingLiquidated);
                }
                Ok(totals)
            })?;

            engine.finish_liquidation(liquidator, asset, price, &totals)?;
            Ok(totals)
        })
    }

    /// Liquidate up to `n` troves starting from the head of the index,
    /// stopping at the first one that is not liquidatable.
    #[instrument(skip(self), fields(asset = %asset))]
    pub fn liquidate_sequential(
        &mut self,
        liquidator: Address,
        asset: Address,
        n: usize,
    ) -> Result<LiquidationTotals> {
        self.guarded(|engine| {
            engine.require_asset(asset)?;
            if n == 0 {
                return Err(EngineError::ZeroIterations);
            }
            let price = engine.fetch_price(asset)?;

            let totals = engine.atomic(|engine| {
                let mut totals = LiquidationTotals::default();
                for _ in 0..n {
                    if engine.sorted.len(asset) <= 1 {
                        break;
                    }
                    let Some(account) = engine.sorted.first(asset) else {
                        break;
                    };
                    let plan = match engine.plan_liquidation(account, asset, price) {
                        Ok(plan) => plan,
                        Err(e) if e.kind().is_recoverable() => {
                            debug!(account = %account, error = %e, "Sequential walk stopped");
                            break;
                        }
                        Err(e) => return Err(e),
                    };
                    engine.commit_liquidation(account, asset, &plan)?;
                    totals.add(account, &plan);
                }
                if totals.is_empty() {
                    return Err(EngineError::NothingLiquidated);
                }
                Ok(totals)
            })?;

            engine.finish_liquidation(liquidator, asset, price, &totals)?;
            Ok(totals)
        })
    }

    /// Whether `account`'s trove could be liquidated right now.
    pub fn is_liquidatable(&self, account: Address, asset: Address) -> Result<bool> {
        let price = self.fetch_price(asset)?;
        match self.plan_liquidation(account, asset, price) {
            Ok(_) => Ok(true),
            Err(e) if e.kind().is_recoverable() => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn plan_liquidation(&self, account: Address, asset: Address, price: U256) -> Result<LiquidationPlan> {
        let trove = self.ledger.entire_trove(account, asset)?;
        if !trove.is_active() {
            return Err(EngineError::TroveNotActive { account });
        }
        if self.sorted.len(asset) <= 1 {
            return Err(EngineError::OnlyOneTroveInSystem);
        }

        let totals = self.system_totals(asset)?;
        let recovery_mode = self.recovery_policy.is_recovery_mode(&totals, price);
        let icr = trove.icr(price);
        let mcr = self.config.mcr();
        let deposits = self.pool.total_deposits();

        let plan = if icr < mcr {
            self.plan_normal(trove, icr, recovery_mode, deposits)?
        } else if recovery_mode && icr < totals.tcr(price) && trove.debt <= deposits {
            self.plan_capped(trove, icr, price)?
        } else {
            return Err(EngineError::NotLiquidatable { icr });
        };

        if !plan.debt_to_redistribute.is_zero() {
            let remaining = self
                .ledger
                .asset_state(asset)?
                .total_stakes
                .saturating_sub(trove.stake);
            if remaining.is_zero() {
                return Err(EngineError::RedistributionWithoutStakes);
            }
        }
        Ok(plan)
    }

    /// All collateral seized; offset what the pool can absorb, redistribute
    /// the rest.
    fn plan_normal(
        &self,
        trove: Trove,
        icr: U256,
        recovery_mode: bool,
        deposits: U256,
    ) -> Result<LiquidationPlan> {
        let gas_compensation = self.gas_compensation(trove.collateral);
        let collateral = trove.collateral - gas_compensation;

        let debt_to_offset = u256_math::min(trove.debt, deposits);
        let collateral_to_offset = if debt_to_offset == trove.debt {
            collateral
        } else {
            u256_math::mul_div(collateral, debt_to_offset, trove.debt)
                .ok_or(EngineError::Overflow("collateral offset"))?
        };

        Ok(LiquidationPlan {
            trove,
            mode: LiquidationMode::Normal,
            recovery_mode,
            icr,
            gas_compensation,
            debt_to_offset,
            collateral_to_offset,
            debt_to_redistribute: trove.debt - debt_to_offset,
            collateral_to_redistribute: collateral - collateral_to_offset,
            surplus: U256::ZERO,
        })
    }

    /// Recovery mode with `MCR <= ICR < TCR`: seize `debt * MCR / price`,
    /// offset the whole debt, leave the rest to the owner.
    fn plan_capped(&self, trove: Trove, icr: U256, price: U256) -> Result<LiquidationPlan> {
        let seized = u256_math::mul_div(trove.debt, self.config.mcr(), price)
            .ok_or(EngineError::Overflow("capped collateral"))?;
        let seized = u256_math::min(seized, trove.collateral);
        let gas_compensation = self.gas_compensation(seized);

        Ok(LiquidationPlan {
            trove,
            mode: LiquidationMode::Capped,
            recovery_mode: true,
            icr,
            gas_compensation,
            debt_to_offset: trove.debt,
            collateral_to_offset: seized - gas_compensation,
            debt_to_redistribute: U256::ZERO,
            collateral_to_redistribute: U256::ZERO,
            surplus: trove.collateral - seized,
        })
    }

    fn gas_compensation(&self, collateral: U256) -> U256 {
        u256_math::apply_basis_points(collateral, self.config.collateral.gas_compensation_bps)
    }

    fn commit_liquidation(&mut self, account: Address, asset: Address, plan: &LiquidationPlan) -> Result<()> {
        self.ledger.apply_pending_rewards(account, asset)?;
        self.ledger
            .close(account, asset, TroveStatus::ClosedByLiquidation)?;
        self.sorted.remove(asset, account)?;

        if !plan.debt_to_offset.is_zero() {
            let outcome = self
                .pool
                .offset(asset, plan.debt_to_offset, plan.collateral_to_offset)?;
            if outcome.depleted {
                warn!(asset = %asset, epoch = outcome.epoch, "Stability pool depleted");
            }
            self.emit(Event::StabilityPoolOffset {
                asset,
                debt: outcome.debt_offset,
                collateral: outcome.collateral_added,
                p: outcome.p,
                scale: outcome.scale,
                epoch: outcome.epoch,
            });
        }

        if !plan.debt_to_redistribute.is_zero() {
            self.ledger.redistribute(
                asset,
                plan.debt_to_redistribute,
                plan.collateral_to_redistribute,
            )?;
            let state = self.ledger.asset_state(asset)?;
            let (l_debt, l_collateral) = (state.l_debt, state.l_collateral);
            self.emit(Event::Redistribution {
                asset,
                debt: plan.debt_to_redistribute,
                collateral: plan.collateral_to_redistribute,
                l_debt,
                l_collateral,
            });
        }

        if !plan.surplus.is_zero() {
            self.ledger.add_surplus(account, asset, plan.surplus)?;
            self.emit(Event::SurplusCollateral {
                account,
                asset,
                amount: plan.surplus,
            });
        }
        self.ledger.update_system_snapshots(asset)?;

        self.emit(Event::TroveLiquidated {
            account,
            asset,
            debt: plan.trove.debt,
            collateral: plan.trove.collateral,
            mode: plan.mode,
            recovery_mode: plan.recovery_mode,
        });
        info!(
            account = %account,
            icr = u256_math::wad_to_f64(plan.icr),
            debt = %plan.trove.debt,
            collateral = %plan.trove.collateral,
            mode = ?plan.mode,
            "Trove liquidated"
        );
        Ok(())
    }

    fn finish_liquidation(
        &mut self,
        liquidator: Address,
        asset: Address,
        price: U256,
        totals: &LiquidationTotals,
    ) -> Result<()> {
        if !totals.debt_offset.is_zero() {
            self.debt_token.burn_from_pool(totals.debt_offset)?;
        }
        if !totals.gas_compensation.is_zero() {
            self.vault
                .transfer(asset, liquidator, totals.gas_compensation)?;
        }

        self.emit(Event::LiquidationSummary {
            asset,
            liquidator,
            liquidated: totals.liquidated.clone(),
            debt: totals.debt,
            collateral: totals.collateral,
            gas_compensation: totals.gas_compensation,
            price,
        });
        info!(
            liquidator = %liquidator,
            count = totals.liquidated.len(),
            debt = %totals.debt,
            gas_compensation = %totals.gas_compensation,
            "Liquidation complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolConfig;
    use crate::error::ErrorKind;
    use crate::position_manager::OpenTrove;
    use crate::u256_math::wad;
    use cdp_chain::{InMemoryCollateralVault, InMemoryDebtToken, ManualClock, PriceCache};
    use std::sync::Arc;

    const NOW: u64 = 1_700_000_000;

    type Engine = PositionManager<Arc<PriceCache>, InMemoryDebtToken, InMemoryCollateralVault, ManualClock>;

    fn weth() -> Address {
        Address::repeat_byte(0xEE)
    }

    fn user(n: u8) -> Address {
        Address::repeat_byte(n)
    }

    /// Two weak troves, two healthy ones and a 10k pool funded by user 3.
    fn engine() -> Engine {
        let prices = Arc::new(PriceCache::new());
        prices.set_price(weth(), wad(2_000), NOW);
        let mut vault = InMemoryCollateralVault::new();
        for n in 1..=4 {
            vault.fund(weth(), user(n), wad(1_000));
        }
        let mut engine = PositionManager::new(
            ProtocolConfig::testing(),
            prices,
            InMemoryDebtToken::new(),
            vault,
            ManualClock::new(NOW),
        );
        engine.register_asset(weth(), None).unwrap();
        for (n, collateral, debt) in [(1, 10, 5_000), (2, 12, 5_000), (3, 200, 10_000), (4, 300, 10_000)] {
            engine
                .open_trove(user(n), weth(), OpenTrove::new(wad(collateral), wad(debt)))
                .unwrap();
        }
        engine
            .provide_to_stability_pool(user(3), wad(10_000))
            .unwrap();
        engine
    }

    #[test]
    fn test_failed_batch_rolls_back_earlier_liquidations() {
        let mut engine = engine();
        engine.price_feed().set_price(weth(), wad(200), NOW);

        // Index and ledger disagree on user 2, so its commit fails after
        // user 1 has already been liquidated
        engine.sorted.remove(weth(), user(2)).unwrap();

        let trove = engine.trove(user(1), weth());
        let pool = engine.pool_summary();
        let stakes = engine.ledger.asset_state(weth()).unwrap().total_stakes;
        let events = engine.events().len();

        let err = engine
            .batch_liquidate(user(9), weth(), &[user(1), user(2)], 0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Consistency);

        assert_eq!(engine.trove(user(1), weth()), trove);
        assert!(engine.sorted.contains(weth(), user(1)));
        assert_eq!(engine.pool_summary(), pool);
        assert_eq!(engine.ledger.asset_state(weth()).unwrap().total_stakes, stakes);
        assert_eq!(engine.events().len(), events);
        assert_eq!(
            engine.debt_token().pool_balance(),
            engine.stability_pool().total_deposits()
        );
        assert!(engine.vault().balance_of(weth(), user(9)).is_zero());

        // Without the broken candidate the same batch goes through
        let totals = engine
            .batch_liquidate(user(9), weth(), &[user(1)], 0)
            .unwrap();
        assert_eq!(totals.liquidated.as_slice(), &[user(1)]);
    }

    #[test]
    fn test_successful_batch_keeps_every_commit() {
        let mut engine = engine();
        engine.price_feed().set_price(weth(), wad(200), NOW);

        let totals = engine
            .batch_liquidate(user(9), weth(), &[user(1), user(2)], 0)
            .unwrap();
        assert_eq!(totals.liquidated.as_slice(), &[user(1), user(2)]);
        for n in [1, 2] {
            assert_eq!(
                engine.trove(user(n), weth()).status,
                TroveStatus::ClosedByLiquidation
            );
            assert!(!engine.sorted.contains(weth(), user(n)));
        }
        assert_eq!(
            engine.debt_token().pool_balance(),
            engine.stability_pool().total_deposits()
        );
        assert_eq!(
            engine.vault().balance_of(weth(), user(9)),
            totals.gas_compensation
        );
    }
}
