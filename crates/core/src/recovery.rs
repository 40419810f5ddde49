//! System-wide collateralization and the recovery-mode predicate.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use crate::u256_math;

/// Entire collateral and debt of one asset (active + pending).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemTotals {
    pub collateral: U256,
    pub debt: U256,
}

impl SystemTotals {
    pub fn new(collateral: U256, debt: U256) -> Self {
        Self { collateral, debt }
    }

    /// Total collateral ratio at `price`; `U256::MAX` with no debt.
    pub fn tcr(&self, price: U256) -> U256 {
        u256_math::compute_cr(self.collateral, self.debt, price)
    }

    /// Totals after a trove change.
    pub fn adjusted(
        &self,
        collateral_change: U256,
        collateral_increase: bool,
        debt_change: U256,
        debt_increase: bool,
    ) -> Self {
        let collateral = if collateral_increase {
            self.collateral.saturating_add(collateral_change)
        } else {
            self.collateral.saturating_sub(collateral_change)
        };
        let debt = if debt_increase {
            self.debt.saturating_add(debt_change)
        } else {
            self.debt.saturating_sub(debt_change)
        };
        Self { collateral, debt }
    }
}

/// Decides whether the system is in recovery mode.
pub trait RecoveryModePolicy: Send + Sync {
    fn is_recovery_mode(&self, totals: &SystemTotals, price: U256) -> bool;
}

/// Recovery mode while TCR is below the critical ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CriticalRatioPolicy {
    pub ccr: U256,
}

impl CriticalRatioPolicy {
    pub fn new(ccr: U256) -> Self {
        Self { ccr }
    }
}

impl RecoveryModePolicy for CriticalRatioPolicy {
    fn is_recovery_mode(&self, totals: &SystemTotals, price: U256) -> bool {
        totals.tcr(price) < self.ccr
    }
}
