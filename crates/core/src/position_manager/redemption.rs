//! Redemption of debt tokens for collateral at face value.

use alloy::primitives::{Address, U256};
use cdp_chain::{Clock, CollateralVault, DebtToken, PriceFeed};
use serde::Serialize;
use smallvec::SmallVec;
use tracing::{debug, info, instrument};

use super::PositionManager;
use crate::error::{EngineError, Result};
use crate::events::{Event, TroveOperation};
use crate::fees::{FeeKind, FeeQuote};
use crate::sorted_troves::{self, Search, Slot, SortedList};
use crate::trove_ledger::TroveStatus;
use crate::u256_math::{self, WAD};

/// Parameters of a redemption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RedeemRequest {
    /// Debt tokens to redeem
    pub amount: U256,
    /// Expected first trove with ICR >= MCR
    pub start_hint: Option<Address>,
    /// Slot hint for the trove left partially redeemed
    pub partial_hint: Slot,
    /// Troves to visit; 0 visits as many as needed
    pub max_iterations: usize,
    pub max_fee_percentage: U256,
}

impl RedeemRequest {
    pub fn new(amount: U256) -> Self {
        Self {
            amount,
            start_hint: None,
            partial_hint: Slot::default(),
            max_iterations: 0,
            max_fee_percentage: WAD,
        }
    }

    pub fn with_max_fee(mut self, max_fee_percentage: U256) -> Self {
        self.max_fee_percentage = max_fee_percentage;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_hints(mut self, start_hint: Option<Address>, partial_hint: Slot) -> Self {
        self.start_hint = start_hint;
        self.partial_hint = partial_hint;
        self
    }
}

/// Aggregate of one redemption.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RedemptionTotals {
    pub attempted: U256,
    pub redeemed: U256,
    /// Collateral taken from troves, fee included
    pub collateral_drawn: U256,
    pub fee: U256,
    /// Troves redeemed in full
    pub closed: SmallVec<[Address; 8]>,
    /// Trove left with reduced debt, if any
    pub partial: Option<Address>,
}

impl RedemptionTotals {
    /// Collateral the redeemer receives.
    pub fn collateral_sent(&self) -> U256 {
        self.collateral_drawn - self.fee
    }
}

/// One trove's share of a redemption.
#[derive(Debug, Clone, Copy)]
enum Lot {
    Full { account: Address, surplus: U256 },
    Partial {
        account: Address,
        debt: U256,
        collateral: U256,
        new_debt: U256,
        new_collateral: U256,
        nicr: U256,
        slot: Slot,
    },
}

struct RedemptionPlan {
    lots: Vec<Lot>,
    totals: RedemptionTotals,
    quote: FeeQuote,
}

impl<F, T, V, C> PositionManager<F, T, V, C>
where
    F: PriceFeed,
    T: DebtToken,
    V: CollateralVault,
    C: Clock,
{
    /// Burn `request.amount` debt tokens from `redeemer` and pay out the
    /// matching collateral, taken from the least healthy troves with
    /// ICR >= MCR.
    #[instrument(skip(self, request), fields(redeemer = %redeemer, asset = %asset, amount = %request.amount))]
    pub fn redeem(
        &mut self,
        redeemer: Address,
        asset: Address,
        request: RedeemRequest,
    ) -> Result<RedemptionTotals> {
        self.guarded(|engine| {
            let price = engine.check_redemption(asset, &request)?;
            let plan = engine.plan_redemption(redeemer, asset, &request, price)?;

            // Commit
            engine.base_rate.apply(&plan.quote, engine.clock.now());
            engine.emit_base_rate();
            for lot in &plan.lots {
                engine.commit_lot(asset, lot)?;
            }
            let totals = plan.totals;
            engine.emit(Event::Redemption {
                asset,
                redeemer,
                attempted: totals.attempted,
                redeemed: totals.redeemed,
                collateral_sent: totals.collateral_sent(),
                fee: totals.fee,
            });

            // Interactions
            engine.debt_token.burn_from(redeemer, totals.redeemed)?;
            engine
                .vault
                .transfer(asset, redeemer, totals.collateral_sent())?;
            if !totals.fee.is_zero() {
                let recipient = engine.config.fee_recipient;
                engine.vault.transfer(asset, recipient, totals.fee)?;
                engine.emit(Event::FeePaid {
                    account: redeemer,
                    kind: FeeKind::Redemption,
                    amount: totals.fee,
                });
            }

            info!(
                redeemed = %totals.redeemed,
                collateral = %totals.collateral_drawn,
                fee = %totals.fee,
                closed = totals.closed.len(),
                "Redemption complete"
            );
            Ok(totals)
        })
    }

    /// Input checks that do not depend on the troves.
    fn check_redemption(&self, asset: Address, request: &RedeemRequest) -> Result<U256> {
        self.require_asset(asset)?;
        if request.amount.is_zero() {
            return Err(EngineError::ZeroAmount);
        }
        self.require_max_fee(
            request.max_fee_percentage,
            self.config.redemption_schedule().floor,
        )?;
        let price = self.fetch_price(asset)?;
        let tcr = self.system_totals(asset)?.tcr(price);
        if tcr < self.config.mcr() {
            return Err(EngineError::RedemptionBelowMcr { tcr });
        }
        Ok(price)
    }

    fn plan_redemption(
        &self,
        redeemer: Address,
        asset: Address,
        request: &RedeemRequest,
        price: U256,
    ) -> Result<RedemptionPlan> {
        self.require_token_balance(redeemer, request.amount)?;
        let list = self.sorted.list(asset)?;
        let mcr = self.config.mcr();
        let min_debt = self.config.min_net_debt();

        let mut lots = Vec::new();
        let mut closed: Vec<Address> = Vec::new();
        let mut totals = RedemptionTotals {
            attempted: request.amount,
            ..Default::default()
        };
        let mut remaining = request.amount;
        let mut current = self.first_redeemable(asset, list, request.start_hint, price)?;
        let mut iterations = 0usize;

        while let Some(account) = current {
            if remaining.is_zero() {
                break;
            }
            if request.max_iterations != 0 && iterations >= request.max_iterations {
                break;
            }
            iterations += 1;

            let trove = self.ledger.entire_trove(account, asset)?;
            if trove.icr(price) < mcr {
                break;
            }
            let next = list.next(account);
            let debt_lot = u256_math::min(remaining, trove.debt);
            let collateral_lot = u256_math::mul_div(debt_lot, WAD, price)
                .ok_or(EngineError::Overflow("redeemed collateral"))?;
            let collateral_lot = u256_math::min(collateral_lot, trove.collateral);

            if debt_lot == trove.debt {
                if list.len() - closed.len() <= 1 {
                    debug!(account = %account, "Last trove left open");
                    break;
                }
                lots.push(Lot::Full {
                    account,
                    surplus: trove.collateral - collateral_lot,
                });
                closed.push(account);
                totals.closed.push(account);
            } else {
                let new_debt = trove.debt - debt_lot;
                if new_debt < min_debt {
                    debug!(account = %account, new_debt = %new_debt, "Partial redemption cancelled");
                    break;
                }
                let new_collateral = trove.collateral - collateral_lot;
                let nicr = u256_math::compute_nominal_cr(new_collateral, new_debt);
                let mut excluded = closed.clone();
                excluded.push(account);
                let slot = match sorted_troves::search(
                    list,
                    nicr,
                    request.partial_hint,
                    self.config.limits.max_scan_steps,
                    &excluded,
                ) {
                    Search::Found(slot) => slot,
                    Search::Exhausted { steps } => {
                        debug!(account = %account, steps, "Partial redemption hint exhausted");
                        break;
                    }
                };
                lots.push(Lot::Partial {
                    account,
                    debt: debt_lot,
                    collateral: collateral_lot,
                    new_debt,
                    new_collateral,
                    nicr,
                    slot,
                });
                totals.partial = Some(account);
            }

            totals.redeemed += debt_lot;
            totals.collateral_drawn += collateral_lot;
            remaining -= debt_lot;
            current = next;
        }

        if totals.collateral_drawn.is_zero() {
            return Err(EngineError::NoRedemptionOccurred);
        }

        let quote = self.base_rate.quote(
            FeeKind::Redemption,
            &self.config.redemption_schedule(),
            totals.redeemed,
            self.debt_token.total_supply(),
            self.clock.now(),
        );
        if quote.rate > request.max_fee_percentage {
            return Err(EngineError::FeeExceedsMaximum {
                rate: quote.rate,
                max_fee: request.max_fee_percentage,
            });
        }
        totals.fee = quote.fee_on(totals.collateral_drawn);
        if totals.fee >= totals.collateral_drawn {
            return Err(EngineError::FeeExceedsMaximum {
                rate: quote.rate,
                max_fee: request.max_fee_percentage,
            });
        }

        Ok(RedemptionPlan {
            lots,
            totals,
            quote,
        })
    }

    /// The start hint when it is the first trove with ICR >= MCR, otherwise
    /// found by walking from the head.
    fn first_redeemable(
        &self,
        asset: Address,
        list: &SortedList,
        hint: Option<Address>,
        price: U256,
    ) -> Result<Option<Address>> {
        let mcr = self.config.mcr();
        let icr_of = |id: Address| -> Result<U256> {
            Ok(self.ledger.entire_trove(id, asset)?.icr(price))
        };

        if let Some(hint) = hint.filter(|h| list.contains(*h)) {
            let prev_below = match list.prev(hint) {
                Some(prev) => icr_of(prev)? < mcr,
                None => true,
            };
            if prev_below && icr_of(hint)? >= mcr {
                return Ok(Some(hint));
            }
        }

        let mut current = list.first();
        while let Some(id) = current {
            if icr_of(id)? >= mcr {
                return Ok(Some(id));
            }
            current = list.next(id);
        }
        Ok(None)
    }

    fn commit_lot(&mut self, asset: Address, lot: &Lot) -> Result<()> {
        match *lot {
            Lot::Full { account, surplus } => {
                self.ledger.apply_pending_rewards(account, asset)?;
                self.ledger
                    .close(account, asset, TroveStatus::ClosedByRedemption)?;
                self.ledger.add_surplus(account, asset, surplus)?;
                self.sorted.remove(asset, account)?;
                self.emit(Event::TroveClosed {
                    account,
                    asset,
                    status: TroveStatus::ClosedByRedemption,
                });
                if !surplus.is_zero() {
                    self.emit(Event::SurplusCollateral {
                        account,
                        asset,
                        amount: surplus,
                    });
                }
            }
            Lot::Partial {
                account,
                debt,
                collateral,
                new_debt,
                new_collateral,
                nicr,
                slot,
            } => {
                self.ledger.apply_pending_rewards(account, asset)?;
                let trove = self
                    .ledger
                    .update(account, asset, new_collateral, new_debt)?;
                let list = self.sorted.list_mut(asset)?;
                list.remove(account)?;
                list.insert_at(account, nicr, slot);
                debug!(account = %account, debt = %debt, collateral = %collateral, "Partial redemption");
                self.emit(Event::TroveUpdated {
                    account,
                    asset,
                    debt: trove.debt,
                    collateral: trove.collateral,
                    stake: trove.stake,
                    operation: TroveOperation::Redeem,
                });
            }
        }
        Ok(())
    }
}
