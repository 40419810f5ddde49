//! TOML scenario files replayed against an in-memory engine.

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use alloy::primitives::{Address, U256};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use cdp_chain::{
    Clock, InMemoryCollateralVault, InMemoryDebtToken, ManualClock, OraclesConfig, PriceCache,
};
use cdp_core::u256_math::parse_wad;
use cdp_core::{
    AdjustTrove, AssetsConfig, EngineError, OpenTrove, PositionManager, ProtocolConfig,
    RedeemRequest,
};

pub type Engine =
    PositionManager<Arc<PriceCache>, InMemoryDebtToken, InMemoryCollateralVault, ManualClock>;

/// Scenario file: assets, initial prices and the steps to replay.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    /// Unix time the simulated clock starts at
    #[serde(default = "default_start_time")]
    pub start_time: u64,
    #[serde(flatten)]
    pub assets: AssetsConfig,
    #[serde(flatten)]
    pub oracles: OraclesConfig,
    #[serde(default)]
    pub steps: Vec<Step>,
}

fn default_start_time() -> u64 {
    1_700_000_000
}

impl Scenario {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {:?}", path))
    }
}

/// One scenario action. Amounts are decimal strings in whole tokens
/// ("9.95"); assets are referenced by symbol.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Step {
    Fund {
        account: Address,
        asset: String,
        amount: String,
    },
    SetPrice {
        asset: String,
        price: String,
    },
    Advance {
        secs: u64,
    },
    Open {
        account: Address,
        asset: String,
        collateral: String,
        debt: String,
        #[serde(default)]
        max_fee: Option<String>,
    },
    Adjust {
        account: Address,
        asset: String,
        #[serde(default)]
        add_collateral: Option<String>,
        #[serde(default)]
        withdraw_collateral: Option<String>,
        #[serde(default)]
        borrow: Option<String>,
        #[serde(default)]
        repay: Option<String>,
        #[serde(default)]
        max_fee: Option<String>,
    },
    Close {
        account: Address,
        asset: String,
    },
    Provide {
        account: Address,
        amount: String,
    },
    Withdraw {
        account: Address,
        #[serde(default)]
        amount: Option<String>,
    },
    Liquidate {
        liquidator: Address,
        account: Address,
        asset: String,
    },
    LiquidateSequential {
        liquidator: Address,
        asset: String,
        count: usize,
    },
    BatchLiquidate {
        liquidator: Address,
        asset: String,
        accounts: Vec<Address>,
        #[serde(default)]
        max_iterations: usize,
    },
    Redeem {
        account: Address,
        asset: String,
        amount: String,
        #[serde(default)]
        max_fee: Option<String>,
        #[serde(default)]
        max_iterations: usize,
    },
    ClaimSurplus {
        account: Address,
        asset: String,
    },
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Fund { .. } => "fund",
            Self::SetPrice { .. } => "set_price",
            Self::Advance { .. } => "advance",
            Self::Open { .. } => "open",
            Self::Adjust { .. } => "adjust",
            Self::Close { .. } => "close",
            Self::Provide { .. } => "provide",
            Self::Withdraw { .. } => "withdraw",
            Self::Liquidate { .. } => "liquidate",
            Self::LiquidateSequential { .. } => "liquidate_sequential",
            Self::BatchLiquidate { .. } => "batch_liquidate",
            Self::Redeem { .. } => "redeem",
            Self::ClaimSurplus { .. } => "claim_surplus",
        }
    }
}

fn amount(value: &str) -> Result<U256> {
    parse_wad(value).with_context(|| format!("Invalid amount '{}'", value))
}

fn optional_amount(value: &Option<String>) -> Result<Option<U256>> {
    value.as_deref().map(amount).transpose()
}

/// Engine plus the handles the scenario drives directly.
pub struct Simulation {
    engine: Engine,
    prices: Arc<PriceCache>,
    clock: ManualClock,
    assets: HashMap<String, Address>,
}

/// Outcome counts of a run.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunSummary {
    pub steps: usize,
    pub failed: usize,
    pub events: usize,
}

impl Simulation {
    pub fn new(config: ProtocolConfig, scenario: &Scenario) -> Result<Self> {
        let clock = ManualClock::new(scenario.start_time);
        let prices = Arc::new(PriceCache::new());
        let seeded = scenario.oracles.seed(&prices, scenario.start_time)?;
        debug!(count = seeded, "Prices seeded");

        let mut engine = PositionManager::new(
            config,
            prices.clone(),
            InMemoryDebtToken::new(),
            InMemoryCollateralVault::new(),
            clock.clone(),
        );

        let mut assets = HashMap::new();
        for asset in scenario.assets.active_assets() {
            let address = asset.token_address()?;
            engine.register_asset(address, asset.max_troves)?;
            assets.insert(asset.symbol.to_uppercase(), address);
        }
        if assets.is_empty() {
            bail!("Scenario defines no active assets");
        }
        info!(assets = assets.len(), "Simulation ready");

        Ok(Self {
            engine,
            prices,
            clock,
            assets,
        })
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    fn asset(&self, symbol: &str) -> Result<Address> {
        self.assets
            .get(&symbol.to_uppercase())
            .copied()
            .with_context(|| format!("Unknown asset symbol '{}'", symbol))
    }

    /// Replay `steps`, writing every event and failed step as a JSON line.
    /// Failed steps are reported and skipped.
    pub fn run(&mut self, steps: &[Step], mut out: impl Write) -> Result<RunSummary> {
        let mut summary = RunSummary::default();
        for (index, step) in steps.iter().enumerate() {
            summary.steps += 1;
            if let Err(e) = self.apply(step) {
                summary.failed += 1;
                let kind = e.downcast_ref::<EngineError>().map(|err| err.kind());
                warn!(step = index, action = step.name(), error = %e, "Step failed");
                let line = json!({
                    "step": index,
                    "action": step.name(),
                    "error": format!("{:#}", e),
                    "kind": kind,
                });
                writeln!(out, "{}", line)?;
            }

            for event in self.engine.take_events() {
                summary.events += 1;
                let mut line = serde_json::to_value(&event)?;
                line["step"] = json!(index);
                writeln!(out, "{}", line)?;
            }
        }

        let mut totals = serde_json::Map::new();
        for (symbol, address) in &self.assets {
            let system = self.engine.system_totals(*address)?;
            totals.insert(
                symbol.clone(),
                json!({
                    "troves": self.engine.sorted_troves().len(*address),
                    "collateral": system.collateral,
                    "debt": system.debt,
                }),
            );
        }
        let line = json!({
            "summary": {
                "assets": totals,
                "stability_pool": self.engine.pool_summary(),
                "base_rate": self.engine.base_rate().rate,
            }
        });
        writeln!(out, "{}", line)?;
        Ok(summary)
    }

    fn apply(&mut self, step: &Step) -> Result<()> {
        match step {
            Step::Fund {
                account,
                asset,
                amount: value,
            } => {
                let asset = self.asset(asset)?;
                let value = amount(value)?;
                self.engine.vault_mut().fund(asset, *account, value);
            }
            Step::SetPrice { asset, price } => {
                let asset = self.asset(asset)?;
                self.prices
                    .set_price(asset, amount(price)?, self.clock.now());
            }
            Step::Advance { secs } => self.clock.advance(*secs),
            Step::Open {
                account,
                asset,
                collateral,
                debt,
                max_fee,
            } => {
                let asset = self.asset(asset)?;
                let mut request = OpenTrove::new(amount(collateral)?, amount(debt)?);
                if let Some(max_fee) = optional_amount(max_fee)? {
                    request = request.with_max_fee(max_fee);
                }
                let hint = self.engine.find_insert_hint(
                    asset,
                    request.collateral,
                    request.debt,
                )?;
                self.engine
                    .open_trove(*account, asset, request.with_hint(hint))?;
            }
            Step::Adjust {
                account,
                asset,
                add_collateral,
                withdraw_collateral,
                borrow,
                repay,
                max_fee,
            } => {
                let asset = self.asset(asset)?;
                let mut request = AdjustTrove::default();
                match (optional_amount(add_collateral)?, optional_amount(withdraw_collateral)?) {
                    (Some(_), Some(_)) => bail!("add_collateral and withdraw_collateral both set"),
                    (Some(value), None) => {
                        request.collateral_change = value;
                        request.collateral_increase = true;
                    }
                    (None, Some(value)) => request.collateral_change = value,
                    (None, None) => {}
                }
                match (optional_amount(borrow)?, optional_amount(repay)?) {
                    (Some(_), Some(_)) => bail!("borrow and repay both set"),
                    (Some(value), None) => {
                        request.debt_change = value;
                        request.debt_increase = true;
                    }
                    (None, Some(value)) => request.debt_change = value,
                    (None, None) => {}
                }
                if let Some(max_fee) = optional_amount(max_fee)? {
                    request = request.with_max_fee(max_fee);
                }
                self.engine.adjust_trove(*account, asset, request)?;
            }
            Step::Close { account, asset } => {
                let asset = self.asset(asset)?;
                self.engine.close_trove(*account, asset)?;
            }
            Step::Provide {
                account,
                amount: value,
            } => {
                self.engine
                    .provide_to_stability_pool(*account, amount(value)?)?;
            }
            Step::Withdraw {
                account,
                amount: value,
            } => {
                let value = optional_amount(value)?.unwrap_or_default();
                self.engine.withdraw_from_stability_pool(*account, value)?;
            }
            Step::Liquidate {
                liquidator,
                account,
                asset,
            } => {
                let asset = self.asset(asset)?;
                self.engine.liquidate(*liquidator, *account, asset)?;
            }
            Step::LiquidateSequential {
                liquidator,
                asset,
                count,
            } => {
                let asset = self.asset(asset)?;
                self.engine
                    .liquidate_sequential(*liquidator, asset, *count)?;
            }
            Step::BatchLiquidate {
                liquidator,
                asset,
                accounts,
                max_iterations,
            } => {
                let asset = self.asset(asset)?;
                self.engine
                    .batch_liquidate(*liquidator, asset, accounts, *max_iterations)?;
            }
            Step::Redeem {
                account,
                asset,
                amount: value,
                max_fee,
                max_iterations,
            } => {
                let asset = self.asset(asset)?;
                let mut request =
                    RedeemRequest::new(amount(value)?).with_max_iterations(*max_iterations);
                if let Some(max_fee) = optional_amount(max_fee)? {
                    request = request.with_max_fee(max_fee);
                }
                self.engine.redeem(*account, asset, request)?;
            }
            Step::ClaimSurplus { account, asset } => {
                let asset = self.asset(asset)?;
                self.engine.claim_collateral_surplus(*account, asset)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cdp_chain::DebtToken;
    use cdp_core::u256_math::wad;
    use cdp_core::TroveStatus;

    const SCENARIO: &str = r#"
        [[assets]]
        symbol = "WETH"
        address = "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee"

        [[oracles]]
        asset = "0xeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee"
        answer = "200000000000"

        [[steps]]
        action = "fund"
        account = "0x0101010101010101010101010101010101010101"
        asset = "WETH"
        amount = "100"

        [[steps]]
        action = "fund"
        account = "0x0202020202020202020202020202020202020202"
        asset = "weth"
        amount = "100"

        [[steps]]
        action = "open"
        account = "0x0101010101010101010101010101010101010101"
        asset = "WETH"
        collateral = "10"
        debt = "5000"

        [[steps]]
        action = "open"
        account = "0x0202020202020202020202020202020202020202"
        asset = "WETH"
        collateral = "100"
        debt = "5000"

        [[steps]]
        action = "provide"
        account = "0x0202020202020202020202020202020202020202"
        amount = "5000"

        [[steps]]
        action = "set_price"
        asset = "WETH"
        price = "200"

        [[steps]]
        action = "liquidate"
        liquidator = "0x0404040404040404040404040404040404040404"
        account = "0x0202020202020202020202020202020202020202"
        asset = "WETH"

        [[steps]]
        action = "liquidate_sequential"
        liquidator = "0x0404040404040404040404040404040404040404"
        asset = "WETH"
        count = 5
    "#;

    #[test]
    fn test_parse_scenario() {
        let scenario: Scenario = toml::from_str(SCENARIO).unwrap();
        assert_eq!(scenario.start_time, 1_700_000_000);
        assert_eq!(scenario.assets.assets.len(), 1);
        assert_eq!(scenario.oracles.oracles.len(), 1);
        assert_eq!(scenario.steps.len(), 8);
        assert_eq!(scenario.steps[6].name(), "liquidate");
    }

    #[test]
    fn test_run_reports_failures_and_events() {
        let scenario: Scenario = toml::from_str(SCENARIO).unwrap();
        let mut sim = Simulation::new(ProtocolConfig::testing(), &scenario).unwrap();

        let mut out = Vec::new();
        let summary = sim.run(&scenario.steps, &mut out).unwrap();
        assert_eq!(summary.steps, 8);
        // the healthy trove cannot be liquidated
        assert_eq!(summary.failed, 1);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert!(lines
            .iter()
            .any(|l| l["action"] == "liquidate" && l["kind"] == "Solvency"));
        assert!(lines.iter().any(|l| l["event"] == "liquidation_summary"));
        assert!(lines.last().unwrap().get("summary").is_some());

        let alice = Address::repeat_byte(0x01);
        let weth = Address::repeat_byte(0xEE);
        assert_eq!(
            sim.engine().trove(alice, weth).status,
            TroveStatus::ClosedByLiquidation
        );
        assert_eq!(sim.engine().sorted_troves().len(weth), 1);
        assert_eq!(sim.engine().stability_pool().total_deposits(), U256::ZERO);
        assert_eq!(sim.engine().debt_token().total_supply(), wad(5_000));
    }
}
