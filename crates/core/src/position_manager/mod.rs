//! Trove lifecycle, liquidation and redemption engine.
//!
//! [`PositionManager`] owns the ordered index, the trove ledger, the
//! stability pool and the base rate, and reaches everything outside the
//! core through the collaborator traits of `cdp-chain`.
//!
//! Every mutating entry point runs in three phases:
//!
//! 1. **plan**: read-only validation and computation, including the
//!    balances the interactions will debit. Any error here leaves state
//!    untouched.
//! 2. **commit**: ledger, index and pool updates derived from the plan.
//!    Liquidation commits several troves in a row and rolls all of them
//!    back if one fails.
//! 3. **interactions**: token and collateral movements. A failure here
//!    surfaces as [`ErrorKind::Collaborator`](crate::ErrorKind).

mod borrower;
mod liquidation;
mod redemption;
mod stability;

pub use borrower::{AdjustTrove, OpenTrove};
pub use liquidation::LiquidationTotals;
pub use redemption::{RedeemRequest, RedemptionTotals};

use alloy::primitives::{Address, U256};
use cdp_chain::{ChainError, Clock, CollateralVault, DebtToken, PriceFeed};
use tracing::{debug, info};

use crate::config::ProtocolConfig;
use crate::error::{EngineError, Result};
use crate::events::Event;
use crate::fees::BaseRate;
use crate::guard::NonReentrant;
use crate::recovery::{CriticalRatioPolicy, RecoveryModePolicy, SystemTotals};
use crate::sorted_troves::{Slot, SortedTroves};
use crate::stability_pool::{PoolSummary, StabilityPool};
use crate::trove_ledger::{PendingRewards, Trove, TroveLedger};
use crate::u256_math::WAD;

/// In-memory state captured by [`PositionManager::atomic`].
struct Checkpoint {
    sorted: SortedTroves,
    ledger: TroveLedger,
    pool: StabilityPool,
    events: usize,
}

/// The CDP engine.
pub struct PositionManager<F, T, V, C> {
    config: ProtocolConfig,
    sorted: SortedTroves,
    ledger: TroveLedger,
    pool: StabilityPool,
    base_rate: BaseRate,
    price_feed: F,
    debt_token: T,
    vault: V,
    clock: C,
    recovery_policy: Box<dyn RecoveryModePolicy>,
    guard: NonReentrant,
    events: Vec<Event>,
}

impl<F, T, V, C> PositionManager<F, T, V, C>
where
    F: PriceFeed,
    T: DebtToken,
    V: CollateralVault,
    C: Clock,
{
    /// Create an engine with no registered assets.
    pub fn new(config: ProtocolConfig, price_feed: F, debt_token: T, vault: V, clock: C) -> Self {
        let base_rate = BaseRate::new(config.minute_decay_factor(), clock.now());
        let recovery_policy = Box::new(CriticalRatioPolicy::new(config.ccr()));
        Self {
            config,
            sorted: SortedTroves::new(),
            ledger: TroveLedger::new(),
            pool: StabilityPool::new(),
            base_rate,
            price_feed,
            debt_token,
            vault,
            clock,
            recovery_policy,
            guard: NonReentrant::new(),
            events: Vec::new(),
        }
    }

    /// Replace the recovery-mode predicate.
    pub fn with_recovery_policy(mut self, policy: Box<dyn RecoveryModePolicy>) -> Self {
        self.recovery_policy = policy;
        self
    }

    /// Accept `asset` as collateral. `max_troves` overrides the configured
    /// index capacity. Registering twice keeps existing state.
    pub fn register_asset(&mut self, asset: Address, max_troves: Option<usize>) -> Result<()> {
        self.guarded(|engine| {
            let max = max_troves.unwrap_or(engine.config.limits.max_troves_per_asset);
            engine.sorted.register(asset, max);
            engine.ledger.register_asset(asset);
            engine.pool.register_asset(asset);
            info!(asset = %asset, max_troves = max, "Collateral asset registered");
            Ok(())
        })
    }

    // ============ QUERIES ============

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn ledger(&self) -> &TroveLedger {
        &self.ledger
    }

    pub fn sorted_troves(&self) -> &SortedTroves {
        &self.sorted
    }

    pub fn stability_pool(&self) -> &StabilityPool {
        &self.pool
    }

    pub fn pool_summary(&self) -> PoolSummary {
        self.pool.summary()
    }

    pub fn base_rate(&self) -> &BaseRate {
        &self.base_rate
    }

    pub fn price_feed(&self) -> &F {
        &self.price_feed
    }

    pub fn debt_token(&self) -> &T {
        &self.debt_token
    }

    pub fn debt_token_mut(&mut self) -> &mut T {
        &mut self.debt_token
    }

    pub fn vault(&self) -> &V {
        &self.vault
    }

    pub fn vault_mut(&mut self) -> &mut V {
        &mut self.vault
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn reentrancy_guard(&self) -> &NonReentrant {
        &self.guard
    }

    /// Events emitted so far, oldest first.
    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    /// Stored trove record.
    pub fn trove(&self, account: Address, asset: Address) -> Trove {
        self.ledger.trove(account, asset)
    }

    /// Trove with pending redistribution rewards applied, and those rewards.
    pub fn entire_debt_and_coll(
        &self,
        account: Address,
        asset: Address,
    ) -> Result<(Trove, PendingRewards)> {
        let trove = self.ledger.entire_trove(account, asset)?;
        Ok((trove, self.ledger.pending_rewards(account, asset)))
    }

    pub fn pending_rewards(&self, account: Address, asset: Address) -> PendingRewards {
        self.ledger.pending_rewards(account, asset)
    }

    pub fn current_icr(&self, account: Address, asset: Address) -> Result<U256> {
        let price = self.fetch_price(asset)?;
        Ok(self.ledger.entire_trove(account, asset)?.icr(price))
    }

    pub fn nominal_icr(&self, account: Address, asset: Address) -> Result<U256> {
        Ok(self.ledger.entire_trove(account, asset)?.nicr())
    }

    pub fn system_totals(&self, asset: Address) -> Result<SystemTotals> {
        let state = self.ledger.asset_state(asset)?;
        Ok(SystemTotals::new(state.entire_collateral(), state.entire_debt()))
    }

    pub fn tcr(&self, asset: Address) -> Result<U256> {
        let price = self.fetch_price(asset)?;
        Ok(self.system_totals(asset)?.tcr(price))
    }

    pub fn is_recovery_mode(&self, asset: Address) -> Result<bool> {
        let price = self.fetch_price(asset)?;
        self.recovery_mode_at(asset, price)
    }

    pub fn surplus_of(&self, account: Address, asset: Address) -> U256 {
        self.ledger.surplus_of(account, asset)
    }

    pub fn compounded_deposit(&self, depositor: Address) -> U256 {
        self.pool.compounded_deposit(depositor)
    }

    pub fn collateral_gain(&self, depositor: Address, asset: Address) -> U256 {
        self.pool.collateral_gain(depositor, asset)
    }

    /// Exact index slot for a trove with the given collateral and debt.
    pub fn find_insert_hint(&self, asset: Address, collateral: U256, debt: U256) -> Result<Slot> {
        let nicr = crate::u256_math::compute_nominal_cr(collateral, debt);
        Ok(self
            .sorted
            .find_insert_position(asset, nicr, Slot::default())?)
    }

    // ============ SHARED HELPERS ============

    /// Run `f` under the non-reentrancy guard.
    fn guarded<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let _token = self.guard.enter().ok_or(EngineError::Reentrancy)?;
        f(self)
    }

    /// Run a multi-step commit. If it fails, the index, ledger, pool and
    /// event log go back to where they were before the call.
    fn atomic<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        let checkpoint = Checkpoint {
            sorted: self.sorted.clone(),
            ledger: self.ledger.clone(),
            pool: self.pool.clone(),
            events: self.events.len(),
        };
        let result = f(self);
        if let Err(e) = &result {
            debug!(error = %e, "Rolling back uncommitted changes");
            self.sorted = checkpoint.sorted;
            self.ledger = checkpoint.ledger;
            self.pool = checkpoint.pool;
            self.events.truncate(checkpoint.events);
        }
        result
    }

    fn require_asset(&self, asset: Address) -> Result<()> {
        if self.ledger.is_registered(asset) {
            Ok(())
        } else {
            Err(EngineError::UnknownAsset(asset))
        }
    }

    /// Current price as WAD, rejecting zero and stale observations.
    fn fetch_price(&self, asset: Address) -> Result<U256> {
        let data = self.price_feed.price(asset).map_err(|e| match e {
            ChainError::NoPrice { asset } => EngineError::NoPrice { asset },
            other => EngineError::Collaborator(other),
        })?;
        let now = self.clock.now();
        if data.is_stale(self.config.oracle.max_price_age_secs, now) {
            return Err(EngineError::StalePrice {
                asset,
                age_secs: data.age_secs(now),
            });
        }
        let price = data.normalize_to_18();
        if price.is_zero() {
            return Err(EngineError::InvalidPrice { asset });
        }
        Ok(price)
    }

    fn recovery_mode_at(&self, asset: Address, price: U256) -> Result<bool> {
        let totals = self.system_totals(asset)?;
        Ok(self.recovery_policy.is_recovery_mode(&totals, price))
    }

    fn require_max_fee(&self, max_fee: U256, floor: U256) -> Result<()> {
        if max_fee < floor || max_fee > WAD {
            return Err(EngineError::InvalidMaxFee {
                max_fee,
                floor,
                cap: WAD,
            });
        }
        Ok(())
    }

    fn require_token_balance(&self, account: Address, needed: U256) -> Result<()> {
        let available = self.debt_token.balance_of(account);
        if available < needed {
            return Err(EngineError::InsufficientBalance {
                account,
                needed,
                available,
            });
        }
        Ok(())
    }

    fn require_collateral_balance(&self, asset: Address, account: Address, needed: U256) -> Result<()> {
        let available = self.vault.balance_of(asset, account);
        if available < needed {
            return Err(EngineError::InsufficientBalance {
                account,
                needed,
                available,
            });
        }
        Ok(())
    }

    fn emit(&mut self, event: Event) {
        debug!(event = event.name(), "Event emitted");
        self.events.push(event);
    }

    fn emit_base_rate(&mut self) {
        let base_rate = self.base_rate.rate;
        self.emit(Event::BaseRateUpdated { base_rate });
    }
}
