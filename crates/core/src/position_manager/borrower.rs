//! Borrower entry points: open, adjust, close, claim surplus.

use alloy::primitives::{Address, U256};
use cdp_chain::{Clock, CollateralVault, DebtToken, PriceFeed};
use tracing::{info, instrument};

use super::PositionManager;
use crate::error::{EngineError, Result};
use crate::events::{Event, TroveOperation};
use crate::fees::{FeeKind, FeeQuote};
use crate::sorted_troves::Slot;
use crate::trove_ledger::{Trove, TroveStatus};
use crate::u256_math::{self, WAD};

/// Parameters for opening a trove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenTrove {
    pub collateral: U256,
    /// Debt minted to the borrower, before the borrowing fee
    pub debt: U256,
    pub max_fee_percentage: U256,
    pub hint: Slot,
}

impl OpenTrove {
    /// Accepts any fee up to 100%, no hint.
    pub fn new(collateral: U256, debt: U256) -> Self {
        Self {
            collateral,
            debt,
            max_fee_percentage: WAD,
            hint: Slot::default(),
        }
    }

    pub fn with_max_fee(mut self, max_fee_percentage: U256) -> Self {
        self.max_fee_percentage = max_fee_percentage;
        self
    }

    pub fn with_hint(mut self, hint: Slot) -> Self {
        self.hint = hint;
        self
    }
}

/// Parameters for changing an open trove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdjustTrove {
    pub collateral_change: U256,
    pub collateral_increase: bool,
    pub debt_change: U256,
    pub debt_increase: bool,
    pub max_fee_percentage: U256,
    pub hint: Slot,
}

impl Default for AdjustTrove {
    fn default() -> Self {
        Self {
            collateral_change: U256::ZERO,
            collateral_increase: false,
            debt_change: U256::ZERO,
            debt_increase: false,
            max_fee_percentage: WAD,
            hint: Slot::default(),
        }
    }
}

impl AdjustTrove {
    pub fn add_collateral(amount: U256) -> Self {
        Self {
            collateral_change: amount,
            collateral_increase: true,
            ..Default::default()
        }
    }

    pub fn withdraw_collateral(amount: U256) -> Self {
        Self {
            collateral_change: amount,
            ..Default::default()
        }
    }

    pub fn borrow(amount: U256) -> Self {
        Self {
            debt_change: amount,
            debt_increase: true,
            ..Default::default()
        }
    }

    pub fn repay(amount: U256) -> Self {
        Self {
            debt_change: amount,
            ..Default::default()
        }
    }

    pub fn with_max_fee(mut self, max_fee_percentage: U256) -> Self {
        self.max_fee_percentage = max_fee_percentage;
        self
    }

    pub fn with_hint(mut self, hint: Slot) -> Self {
        self.hint = hint;
        self
    }

    fn is_borrowing(&self) -> bool {
        self.debt_increase && !self.debt_change.is_zero()
    }

    fn is_withdrawing(&self) -> bool {
        !self.collateral_increase && !self.collateral_change.is_zero()
    }
}

struct TroveChange {
    collateral: U256,
    debt: U256,
    nicr: U256,
    slot: Slot,
    fee: Option<(FeeQuote, U256)>,
}

impl<F, T, V, C> PositionManager<F, T, V, C>
where
    F: PriceFeed,
    T: DebtToken,
    V: CollateralVault,
    C: Clock,
{
    /// Open a trove for `account` in `asset`.
    #[instrument(skip(self, request), fields(account = %account, asset = %asset))]
    pub fn open_trove(&mut self, account: Address, asset: Address, request: OpenTrove) -> Result<Trove> {
        self.guarded(|engine| {
            let change = engine.plan_open(account, asset, &request)?;

            // Commit
            let fee = change.fee.map(|(quote, fee)| {
                engine.base_rate.apply(&quote, engine.clock.now());
                fee
            });
            if fee.is_some() {
                engine.emit_base_rate();
            }
            engine.ledger.open(account, asset, change.collateral, change.debt)?;
            engine
                .sorted
                .list_mut(asset)?
                .insert_at(account, change.nicr, change.slot);
            let trove = engine.ledger.trove(account, asset);
            engine.emit(Event::TroveUpdated {
                account,
                asset,
                debt: trove.debt,
                collateral: trove.collateral,
                stake: trove.stake,
                operation: TroveOperation::Open,
            });

            // Interactions
            engine.vault.pull(asset, account, request.collateral)?;
            engine.debt_token.mint(account, request.debt)?;
            engine.pay_borrowing_fee(account, fee.unwrap_or_default())?;

            info!(
                account = %account,
                collateral = %trove.collateral,
                debt = %trove.debt,
                "Trove opened"
            );
            Ok(trove)
        })
    }

    fn plan_open(&self, account: Address, asset: Address, request: &OpenTrove) -> Result<TroveChange> {
        self.require_asset(asset)?;
        if request.collateral.is_zero() || request.debt.is_zero() {
            return Err(EngineError::ZeroAmount);
        }
        if self.ledger.trove(account, asset).status != TroveStatus::NonExistent {
            return Err(EngineError::TroveAlreadyExists { account });
        }

        let price = self.fetch_price(asset)?;
        let totals = self.system_totals(asset)?;
        let recovery = self.recovery_policy.is_recovery_mode(&totals, price);

        let fee = self.plan_borrowing_fee(request.debt, request.max_fee_percentage, recovery)?;
        let fee_amount = fee.map(|(_, f)| f).unwrap_or_default();
        let debt = request
            .debt
            .checked_add(fee_amount)
            .ok_or(EngineError::Overflow("trove debt"))?;
        self.require_min_debt(debt)?;

        let icr = u256_math::compute_cr(request.collateral, debt, price);
        if recovery {
            self.require_icr_at_least(icr, self.config.ccr())?;
        } else {
            self.require_icr_at_least(icr, self.config.mcr())?;
            let new_totals = totals.adjusted(request.collateral, true, debt, true);
            self.require_tcr_at_least_ccr(new_totals.tcr(price))?;
        }
        self.require_collateral_balance(asset, account, request.collateral)?;

        let nicr = u256_math::compute_nominal_cr(request.collateral, debt);
        let slot = self.sorted.list(asset)?.plan_insert(
            account,
            nicr,
            request.hint,
            self.config.limits.max_scan_steps,
            &[],
        )?;

        Ok(TroveChange {
            collateral: request.collateral,
            debt,
            nicr,
            slot,
            fee,
        })
    }

    /// Add or withdraw collateral and borrow or repay debt in one call.
    #[instrument(skip(self, request), fields(account = %account, asset = %asset))]
    pub fn adjust_trove(&mut self, account: Address, asset: Address, request: AdjustTrove) -> Result<Trove> {
        self.guarded(|engine| {
            let change = engine.plan_adjust(account, asset, &request)?;

            // Commit
            let fee = change.fee.map(|(quote, fee)| {
                engine.base_rate.apply(&quote, engine.clock.now());
                fee
            });
            if fee.is_some() {
                engine.emit_base_rate();
            }
            engine.ledger.apply_pending_rewards(account, asset)?;
            let trove = engine
                .ledger
                .update(account, asset, change.collateral, change.debt)?;
            let list = engine.sorted.list_mut(asset)?;
            list.remove(account)?;
            list.insert_at(account, change.nicr, change.slot);
            engine.emit(Event::TroveUpdated {
                account,
                asset,
                debt: trove.debt,
                collateral: trove.collateral,
                stake: trove.stake,
                operation: TroveOperation::Adjust,
            });

            // Interactions
            if !request.collateral_change.is_zero() {
                if request.collateral_increase {
                    engine.vault.pull(asset, account, request.collateral_change)?;
                } else {
                    engine
                        .vault
                        .transfer(asset, account, request.collateral_change)?;
                }
            }
            if !request.debt_change.is_zero() {
                if request.debt_increase {
                    engine.debt_token.mint(account, request.debt_change)?;
                    engine.pay_borrowing_fee(account, fee.unwrap_or_default())?;
                } else {
                    engine.debt_token.burn_from(account, request.debt_change)?;
                }
            }

            info!(
                account = %account,
                collateral = %trove.collateral,
                debt = %trove.debt,
                "Trove adjusted"
            );
            Ok(trove)
        })
    }

    fn plan_adjust(&self, account: Address, asset: Address, request: &AdjustTrove) -> Result<TroveChange> {
        self.require_asset(asset)?;
        if request.collateral_change.is_zero() && request.debt_change.is_zero() {
            return Err(EngineError::NothingToAdjust);
        }
        let current = self.ledger.entire_trove(account, asset)?;
        if !current.is_active() {
            return Err(EngineError::TroveNotActive { account });
        }

        let price = self.fetch_price(asset)?;
        let totals = self.system_totals(asset)?;
        let recovery = self.recovery_policy.is_recovery_mode(&totals, price);

        let fee = if request.is_borrowing() {
            self.plan_borrowing_fee(request.debt_change, request.max_fee_percentage, recovery)?
        } else {
            None
        };
        let fee_amount = fee.map(|(_, f)| f).unwrap_or_default();

        let collateral = if request.collateral_increase {
            self.require_collateral_balance(asset, account, request.collateral_change)?;
            current
                .collateral
                .checked_add(request.collateral_change)
                .ok_or(EngineError::Overflow("trove collateral"))?
        } else {
            if request.collateral_change > current.collateral {
                return Err(EngineError::WithdrawalExceedsCollateral {
                    requested: request.collateral_change,
                    available: current.collateral,
                });
            }
            current.collateral - request.collateral_change
        };

        let debt_delta = request.debt_change + fee_amount;
        let debt = if request.debt_increase {
            current
                .debt
                .checked_add(debt_delta)
                .ok_or(EngineError::Overflow("trove debt"))?
        } else {
            if request.debt_change > current.debt {
                return Err(EngineError::RepaymentExceedsDebt {
                    repayment: request.debt_change,
                    net_debt: current.debt,
                });
            }
            self.require_token_balance(account, request.debt_change)?;
            current.debt - request.debt_change
        };
        self.require_min_debt(debt)?;

        let old_icr = current.icr(price);
        let new_icr = u256_math::compute_cr(collateral, debt, price);
        if recovery {
            if request.is_withdrawing() {
                return Err(EngineError::RecoveryModeRestriction("collateral withdrawal"));
            }
            if request.is_borrowing() {
                self.require_icr_at_least(new_icr, self.config.ccr())?;
                if new_icr < old_icr {
                    return Err(EngineError::RecoveryModeRestriction("ICR may not decrease"));
                }
            }
        } else {
            self.require_icr_at_least(new_icr, self.config.mcr())?;
            let new_totals = totals.adjusted(
                request.collateral_change,
                request.collateral_increase,
                debt_delta,
                request.debt_increase,
            );
            self.require_tcr_at_least_ccr(new_totals.tcr(price))?;
        }

        let nicr = u256_math::compute_nominal_cr(collateral, debt);
        let slot = self.sorted.list(asset)?.plan_insert(
            account,
            nicr,
            request.hint,
            self.config.limits.max_scan_steps,
            &[account],
        )?;

        Ok(TroveChange {
            collateral,
            debt,
            nicr,
            slot,
            fee,
        })
    }

    /// Repay all debt and take back all collateral.
    #[instrument(skip(self), fields(account = %account, asset = %asset))]
    pub fn close_trove(&mut self, account: Address, asset: Address) -> Result<Trove> {
        self.guarded(|engine| {
            // Plan
            engine.require_asset(asset)?;
            let current = engine.ledger.entire_trove(account, asset)?;
            if !current.is_active() {
                return Err(EngineError::TroveNotActive { account });
            }
            if engine.sorted.len(asset) <= 1 {
                return Err(EngineError::OnlyOneTroveInSystem);
            }
            let price = engine.fetch_price(asset)?;
            let totals = engine.system_totals(asset)?;
            if engine.recovery_policy.is_recovery_mode(&totals, price) {
                return Err(EngineError::RecoveryModeRestriction("close trove"));
            }
            let new_totals = totals.adjusted(current.collateral, false, current.debt, false);
            engine.require_tcr_at_least_ccr(new_totals.tcr(price))?;
            engine.require_token_balance(account, current.debt)?;

            // Commit
            engine.ledger.apply_pending_rewards(account, asset)?;
            let closed = engine
                .ledger
                .close(account, asset, TroveStatus::ClosedByOwner)?;
            engine.sorted.remove(asset, account)?;
            engine.emit(Event::TroveClosed {
                account,
                asset,
                status: TroveStatus::ClosedByOwner,
            });

            // Interactions
            engine.debt_token.burn_from(account, closed.debt)?;
            engine.vault.transfer(asset, account, closed.collateral)?;

            info!(
                account = %account,
                collateral = %closed.collateral,
                debt = %closed.debt,
                "Trove closed"
            );
            Ok(closed)
        })
    }

    /// Withdraw collateral left over from a redemption or a capped
    /// liquidation.
    #[instrument(skip(self), fields(account = %account, asset = %asset))]
    pub fn claim_collateral_surplus(&mut self, account: Address, asset: Address) -> Result<U256> {
        self.guarded(|engine| {
            engine.require_asset(asset)?;
            if engine.ledger.surplus_of(account, asset).is_zero() {
                return Err(EngineError::NoSurplus { account });
            }

            let amount = engine.ledger.take_surplus(account, asset)?;
            engine.emit(Event::SurplusClaimed {
                account,
                asset,
                amount,
            });

            engine.vault.transfer(asset, account, amount)?;
            info!(account = %account, amount = %amount, "Collateral surplus claimed");
            Ok(amount)
        })
    }

    // ============ CHECKS ============

    /// Borrowing fee quote and amount, `None` in recovery mode.
    fn plan_borrowing_fee(
        &self,
        amount: U256,
        max_fee: U256,
        recovery: bool,
    ) -> Result<Option<(FeeQuote, U256)>> {
        let schedule = self.config.borrowing_schedule();
        if recovery {
            self.require_max_fee(max_fee, U256::ZERO)?;
            return Ok(None);
        }
        self.require_max_fee(max_fee, schedule.floor)?;

        let quote = self.base_rate.quote(
            FeeKind::Borrowing,
            &schedule,
            amount,
            self.debt_token.total_supply(),
            self.clock.now(),
        );
        if quote.rate > max_fee {
            return Err(EngineError::FeeExceedsMaximum {
                rate: quote.rate,
                max_fee,
            });
        }
        Ok(Some((quote, quote.fee_on(amount))))
    }

    fn pay_borrowing_fee(&mut self, account: Address, fee: U256) -> Result<()> {
        if fee.is_zero() {
            return Ok(());
        }
        let recipient = self.config.fee_recipient;
        self.debt_token.mint(recipient, fee)?;
        self.emit(Event::FeePaid {
            account,
            kind: FeeKind::Borrowing,
            amount: fee,
        });
        Ok(())
    }

    fn require_min_debt(&self, debt: U256) -> Result<()> {
        let minimum = self.config.min_net_debt();
        if debt < minimum {
            return Err(EngineError::DebtBelowMinimum {
                net_debt: debt,
                minimum,
            });
        }
        Ok(())
    }

    fn require_icr_at_least(&self, icr: U256, minimum: U256) -> Result<()> {
        if icr < minimum {
            return Err(EngineError::IcrBelowMinimum { icr, minimum });
        }
        Ok(())
    }

    fn require_tcr_at_least_ccr(&self, tcr: U256) -> Result<()> {
        let ccr = self.config.ccr();
        if tcr < ccr {
            return Err(EngineError::TcrBelowCritical { tcr, ccr });
        }
        Ok(())
    }
}
