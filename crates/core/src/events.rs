//! Events emitted by the engine, one per state transition.

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::fees::FeeKind;
use crate::trove_ledger::TroveStatus;

/// Operation that produced a [`Event::TroveUpdated`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TroveOperation {
    Open,
    Adjust,
    Redeem,
}

/// How a trove was liquidated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LiquidationMode {
    /// All collateral seized
    Normal,
    /// Recovery mode: collateral seized up to `debt * MCR / price`, the
    /// rest left as owner surplus
    Capped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    TroveUpdated {
        account: Address,
        asset: Address,
        debt: U256,
        collateral: U256,
        stake: U256,
        operation: TroveOperation,
    },
    TroveClosed {
        account: Address,
        asset: Address,
        status: TroveStatus,
    },
    TroveLiquidated {
        account: Address,
        asset: Address,
        debt: U256,
        collateral: U256,
        mode: LiquidationMode,
        recovery_mode: bool,
    },
    StabilityPoolOffset {
        asset: Address,
        debt: U256,
        collateral: U256,
        p: U256,
        scale: u64,
        epoch: u64,
    },
    Redistribution {
        asset: Address,
        debt: U256,
        collateral: U256,
        l_debt: U256,
        l_collateral: U256,
    },
    LiquidationSummary {
        asset: Address,
        liquidator: Address,
        liquidated: SmallVec<[Address; 8]>,
        debt: U256,
        collateral: U256,
        gas_compensation: U256,
        price: U256,
    },
    Redemption {
        asset: Address,
        redeemer: Address,
        attempted: U256,
        redeemed: U256,
        collateral_sent: U256,
        fee: U256,
    },
    DepositUpdated {
        depositor: Address,
        amount: U256,
    },
    CollateralGainPaid {
        depositor: Address,
        asset: Address,
        amount: U256,
        debt_loss: U256,
    },
    BaseRateUpdated {
        base_rate: U256,
    },
    FeePaid {
        account: Address,
        kind: FeeKind,
        amount: U256,
    },
    SurplusCollateral {
        account: Address,
        asset: Address,
        amount: U256,
    },
    SurplusClaimed {
        account: Address,
        asset: Address,
        amount: U256,
    },
}

impl Event {
    /// Snake-case event name, as used in the serialized `event` tag.
    pub fn name(&self) -> &'static str {
        match self {
            Self::TroveUpdated { .. } => "trove_updated",
            Self::TroveClosed { .. } => "trove_closed",
            Self::TroveLiquidated { .. } => "trove_liquidated",
            Self::StabilityPoolOffset { .. } => "stability_pool_offset",
            Self::Redistribution { .. } => "redistribution",
            Self::LiquidationSummary { .. } => "liquidation_summary",
            Self::Redemption { .. } => "redemption",
            Self::DepositUpdated { .. } => "deposit_updated",
            Self::CollateralGainPaid { .. } => "collateral_gain_paid",
            Self::BaseRateUpdated { .. } => "base_rate_updated",
            Self::FeePaid { .. } => "fee_paid",
            Self::SurplusCollateral { .. } => "surplus_collateral",
            Self::SurplusClaimed { .. } => "surplus_claimed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serialized_tag_matches_name() {
        let event = Event::TroveClosed {
            account: Address::repeat_byte(1),
            asset: Address::repeat_byte(2),
            status: TroveStatus::ClosedByLiquidation,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], event.name());
        assert_eq!(json["status"], "closed_by_liquidation");
    }
}
