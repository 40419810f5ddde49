//! Stability pool deposits and withdrawals.

use alloy::primitives::{Address, U256};
use cdp_chain::{Clock, CollateralVault, DebtToken, PriceFeed};
use tracing::{info, instrument};

use super::PositionManager;
use crate::error::{EngineError, Result};
use crate::events::Event;
use crate::stability_pool::{PoolError, SettledDeposit};

impl<F, T, V, C> PositionManager<F, T, V, C>
where
    F: PriceFeed,
    T: DebtToken,
    V: CollateralVault,
    C: Clock,
{
    /// Deposit debt tokens into the stability pool. Accrued collateral
    /// gains are paid out first.
    #[instrument(skip(self), fields(depositor = %depositor, amount = %amount))]
    pub fn provide_to_stability_pool(&mut self, depositor: Address, amount: U256) -> Result<SettledDeposit> {
        self.guarded(|engine| {
            if amount.is_zero() {
                return Err(EngineError::ZeroAmount);
            }
            engine.require_token_balance(depositor, amount)?;

            let settled = engine.pool.provide(depositor, amount)?;
            engine.emit_settlement(depositor, &settled);

            engine.debt_token.send_to_pool(depositor, amount)?;
            engine.pay_gains(depositor, &settled)?;

            info!(
                deposit = %engine.pool.compounded_deposit(depositor),
                total_deposits = %engine.pool.total_deposits(),
                "Stability deposit provided"
            );
            Ok(settled)
        })
    }

    /// Withdraw up to the compounded deposit. `amount == 0` claims
    /// collateral gains only.
    #[instrument(skip(self), fields(depositor = %depositor, amount = %amount))]
    pub fn withdraw_from_stability_pool(&mut self, depositor: Address, amount: U256) -> Result<SettledDeposit> {
        self.guarded(|engine| {
            // Plan
            let has_deposit = engine
                .pool
                .deposit(depositor)
                .is_some_and(|d| !d.amount.is_zero());
            if !has_deposit {
                return Err(PoolError::NoDeposit(depositor).into());
            }
            if !amount.is_zero() {
                engine.require_no_undercollateralized_troves()?;
            }
            let compounded = engine.pool.compounded_deposit(depositor);
            if amount > compounded {
                return Err(PoolError::InsufficientDeposit {
                    requested: amount,
                    available: compounded,
                }
                .into());
            }

            // Commit
            let settled = engine.pool.withdraw(depositor, amount)?;
            engine.emit_settlement(depositor, &settled);

            // Interactions
            if !amount.is_zero() {
                engine.debt_token.return_from_pool(depositor, amount)?;
            }
            engine.pay_gains(depositor, &settled)?;

            info!(
                deposit = %engine.pool.compounded_deposit(depositor),
                total_deposits = %engine.pool.total_deposits(),
                "Stability deposit withdrawn"
            );
            Ok(settled)
        })
    }

    /// Withdrawals wait until every asset's least healthy trove is back
    /// above MCR, so depositors cannot dodge a pending liquidation.
    fn require_no_undercollateralized_troves(&self) -> Result<()> {
        let mcr = self.config.mcr();
        for asset in self.sorted.assets() {
            let Some(head) = self.sorted.first(asset) else {
                continue;
            };
            let price = self.fetch_price(asset)?;
            if self.ledger.entire_trove(head, asset)?.icr(price) < mcr {
                return Err(EngineError::UndercollateralizedTroves);
            }
        }
        Ok(())
    }

    fn emit_settlement(&mut self, depositor: Address, settled: &SettledDeposit) {
        let debt_loss = settled.debt_loss();
        for &(asset, amount) in &settled.gains {
            self.emit(Event::CollateralGainPaid {
                depositor,
                asset,
                amount,
                debt_loss,
            });
        }
        let amount = self.pool.compounded_deposit(depositor);
        self.emit(Event::DepositUpdated { depositor, amount });
    }

    fn pay_gains(&mut self, depositor: Address, settled: &SettledDeposit) -> Result<()> {
        for &(asset, amount) in &settled.gains {
            self.vault.transfer(asset, depositor, amount)?;
        }
        Ok(())
    }
}
