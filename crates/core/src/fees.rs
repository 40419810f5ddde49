//! Decaying base-rate fee model.
//!
//! The base rate jumps with every fee-generating operation in proportion
//! to the redeemed or borrowed share of the debt supply, then decays back
//! toward zero with a fixed per-minute factor.

use alloy::primitives::U256;
use serde::{Deserialize, Serialize};

use crate::u256_math::{self, WAD};

const SECONDS_IN_ONE_MINUTE: u64 = 60;

/// Which fee a quote is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeKind {
    Borrowing,
    Redemption,
}

/// Floor, cap and sensitivity of one fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeSchedule {
    /// Minimum rate (WAD)
    pub floor: U256,
    /// Maximum rate (WAD)
    pub cap: U256,
    /// Divisor on the supply share added to the base rate; 0 adds nothing
    pub beta: u64,
}

/// Rates a fee-generating operation would set and pay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeeQuote {
    pub kind: FeeKind,
    /// Base rate after decay and increment
    pub base_rate: U256,
    /// Rate charged, `min(max(floor, base_rate), cap)`
    pub rate: U256,
}

impl FeeQuote {
    /// Fee on `amount` at the quoted rate.
    pub fn fee_on(&self, amount: U256) -> U256 {
        u256_math::wad_mul(amount, self.rate).unwrap_or(U256::MAX)
    }
}

/// The shared base rate and its last update time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseRate {
    pub rate: U256,
    pub last_fee_operation_time: u64,
    pub minute_decay_factor: U256,
}

impl BaseRate {
    pub fn new(minute_decay_factor: U256, now: u64) -> Self {
        Self {
            rate: U256::ZERO,
            last_fee_operation_time: now,
            minute_decay_factor,
        }
    }

    pub fn minutes_passed(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_fee_operation_time) / SECONDS_IN_ONE_MINUTE
    }

    /// Base rate after decay up to `now`.
    pub fn decayed(&self, now: u64) -> U256 {
        let factor = u256_math::dec_pow(self.minute_decay_factor, self.minutes_passed(now));
        u256_math::wad_mul(self.rate, factor).unwrap_or_default()
    }

    /// Quote a fee without changing state.
    ///
    /// `amount` is the debt borrowed or redeemed and `supply` the debt
    /// token supply before the operation.
    pub fn quote(
        &self,
        kind: FeeKind,
        schedule: &FeeSchedule,
        amount: U256,
        supply: U256,
        now: u64,
    ) -> FeeQuote {
        let decayed = self.decayed(now);
        let increment = if schedule.beta == 0 || supply.is_zero() {
            U256::ZERO
        } else {
            u256_math::wad_div(amount, supply).unwrap_or(WAD) / U256::from(schedule.beta)
        };
        let base_rate = u256_math::min(decayed.saturating_add(increment), WAD);
        let rate = u256_math::min(u256_math::max(schedule.floor, base_rate), schedule.cap);
        FeeQuote {
            kind,
            base_rate,
            rate,
        }
    }

    /// Store a quoted base rate. The fee-operation time only moves when at
    /// least a minute has passed, so frequent calls cannot stall decay.
    pub fn apply(&mut self, quote: &FeeQuote, now: u64) {
        self.rate = quote.base_rate;
        if self.minutes_passed(now) >= 1 {
            self.last_fee_operation_time = now;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::u256_math::{bps_to_wad, wad};

    const DECAY: u64 = 999_037_758_833_783_000;

    fn redemption() -> FeeSchedule {
        FeeSchedule {
            floor: bps_to_wad(50),
            cap: WAD,
            beta: 2,
        }
    }

    #[test]
    fn test_first_redemption_rate() {
        let base = BaseRate::new(U256::from(DECAY), 0);
        // 1000 of 10000 supply: base += 0.1 / 2 = 5%
        let quote = base.quote(FeeKind::Redemption, &redemption(), wad(1_000), wad(10_000), 0);
        assert_eq!(quote.base_rate, bps_to_wad(500));
        assert_eq!(quote.rate, bps_to_wad(500));
        assert_eq!(quote.fee_on(wad(10)), wad(1) / U256::from(2u64));
    }

    #[test]
    fn test_floor_and_cap() {
        let base = BaseRate::new(U256::from(DECAY), 0);
        let quote = base.quote(FeeKind::Redemption, &redemption(), wad(1), wad(1_000_000), 0);
        assert_eq!(quote.rate, bps_to_wad(50));

        let borrowing = FeeSchedule {
            floor: bps_to_wad(50),
            cap: bps_to_wad(500),
            beta: 2,
        };
        let quote = base.quote(FeeKind::Borrowing, &borrowing, wad(5_000), wad(1_000), 0);
        assert_eq!(quote.base_rate, WAD);
        assert_eq!(quote.rate, bps_to_wad(500));
    }

    #[test]
    fn test_zero_beta_or_supply_adds_nothing() {
        let base = BaseRate::new(U256::from(DECAY), 0);
        let schedule = FeeSchedule {
            floor: U256::ZERO,
            cap: WAD,
            beta: 0,
        };
        let quote = base.quote(FeeKind::Borrowing, &schedule, wad(5_000), wad(1_000), 0);
        assert!(quote.rate.is_zero());
        let quote = base.quote(FeeKind::Redemption, &redemption(), wad(5_000), U256::ZERO, 0);
        assert!(quote.base_rate.is_zero());
    }

    #[test]
    fn test_decay_halves_in_twelve_hours() {
        let mut base = BaseRate::new(U256::from(DECAY), 0);
        base.rate = bps_to_wad(1_000);

        let decayed = base.decayed(12 * 3600);
        let half = bps_to_wad(500);
        let diff = if decayed > half { decayed - half } else { half - decayed };
        assert!(diff < bps_to_wad(1));
    }

    #[test]
    fn test_fee_time_needs_a_full_minute() {
        let mut base = BaseRate::new(U256::from(DECAY), 1_000);
        let quote = base.quote(FeeKind::Redemption, &redemption(), wad(1), wad(100), 1_030);
        base.apply(&quote, 1_030);
        assert_eq!(base.last_fee_operation_time, 1_000);
        assert_eq!(base.rate, quote.base_rate);

        base.apply(&quote, 1_060);
        assert_eq!(base.last_fee_operation_time, 1_060);
    }
}
