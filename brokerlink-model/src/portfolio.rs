//! Holdings as extracted from broker pages, and their combination across brokers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::broker::BrokerIdentity;

/// A single position as reported by one broker, or merged across brokers.
///
/// Percentages are ratios (`0.05` is five percent).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Holding {
    /// Ticker, or the broker's label for cash and money market lines.
    pub symbol: String,
    /// Security name as the broker shows it.
    pub description: String,
    /// Shares or units held.
    pub quantity: Decimal,
    /// Last price per unit.
    pub price: Decimal,
    /// Average cost per unit.
    pub unit_cost: Decimal,
    /// Total amount paid for the position.
    pub cost_basis: Decimal,
    /// Market value at `price`.
    pub current_value: Decimal,
    /// Change since the previous close, as a ratio.
    pub day_change_percent: Decimal,
    /// Change in value since the previous close.
    pub day_change_dollars: Decimal,
    /// `current_value - cost_basis`.
    pub unrealized_gain_loss: Decimal,
    /// `unrealized_gain_loss / cost_basis`.
    pub unrealized_gain_loss_percent: Decimal,
    /// Share of the combined portfolio; set by [`Portfolio::combine`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub portfolio_percentage: Option<Decimal>,
    /// Current value held at each broker.
    #[serde(default)]
    pub brokers: BTreeMap<BrokerIdentity, Decimal>,
}

/// Everything one broker reported during a single extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    /// Broker the holdings came from.
    pub broker: BrokerIdentity,
    /// Positions in page order.
    pub holdings: Vec<Holding>,
    /// When extraction finished.
    pub captured_at: DateTime<Utc>,
}

impl PortfolioSnapshot {
    /// Snapshot stamped with the current time.
    pub fn new(broker: BrokerIdentity, holdings: Vec<Holding>) -> Self {
        Self {
            broker,
            holdings,
            captured_at: Utc::now(),
        }
    }
}

/// Holdings merged by symbol across every broker that reported successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    /// One entry per symbol, sorted by symbol.
    pub holdings: Vec<Holding>,
    /// Sum of holding values.
    pub total_value: Decimal,
    /// Sum of holding cost bases.
    pub total_cost_basis: Decimal,
    /// Sum of unrealized gains and losses.
    pub total_unrealized_gain_loss: Decimal,
    /// Unrealized gain or loss over the total cost basis.
    pub total_unrealized_gain_loss_percent: Decimal,
    /// Sum of day changes across holdings.
    pub day_change_dollars: Decimal,
    /// Day change relative to the previous close of the whole portfolio.
    pub day_change_percent: Decimal,
    /// When the portfolio was combined.
    pub last_updated: DateTime<Utc>,
    /// Brokers whose snapshots went into this portfolio.
    pub brokers_updated: Vec<BrokerIdentity>,
}

fn ratio(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator.is_zero() {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

impl Portfolio {
    /// Merge broker snapshots into a single portfolio, grouping by symbol.
    pub fn combine<'a, I>(snapshots: I) -> Self
    where
        I: IntoIterator<Item = &'a PortfolioSnapshot>,
    {
        let mut grouped: BTreeMap<String, Vec<Holding>> = BTreeMap::new();
        let mut brokers_updated = Vec::new();

        for snapshot in snapshots {
            if !brokers_updated.contains(&snapshot.broker) {
                brokers_updated.push(snapshot.broker);
            }
            for holding in &snapshot.holdings {
                let mut holding = holding.clone();
                if holding.brokers.is_empty() {
                    holding.brokers.insert(snapshot.broker, holding.current_value);
                }
                grouped.entry(holding.symbol.clone()).or_default().push(holding);
            }
        }

        let mut holdings: Vec<Holding> = grouped
            .into_iter()
            .filter_map(|(symbol, group)| combine_symbol_group(symbol, group))
            .collect();

        let total_value: Decimal = holdings.iter().map(|h| h.current_value).sum();
        if !total_value.is_zero() {
            for holding in &mut holdings {
                holding.portfolio_percentage = Some(holding.current_value / total_value);
            }
        }

        let total_cost_basis: Decimal = holdings.iter().map(|h| h.cost_basis).sum();
        let total_unrealized: Decimal = holdings.iter().map(|h| h.unrealized_gain_loss).sum();
        let day_change_dollars: Decimal = holdings.iter().map(|h| h.day_change_dollars).sum();

        Self {
            total_unrealized_gain_loss_percent: ratio(total_unrealized, total_cost_basis),
            day_change_percent: ratio(day_change_dollars, total_value - day_change_dollars),
            holdings,
            total_value,
            total_cost_basis,
            total_unrealized_gain_loss: total_unrealized,
            day_change_dollars,
            last_updated: Utc::now(),
            brokers_updated,
        }
    }
}

fn combine_symbol_group(symbol: String, group: Vec<Holding>) -> Option<Holding> {
    let base = group.first()?;

    let quantity: Decimal = group.iter().map(|h| h.quantity).sum();
    let cost_basis: Decimal = group.iter().map(|h| h.cost_basis).sum();
    let current_value: Decimal = group.iter().map(|h| h.current_value).sum();
    let day_change_dollars: Decimal = group.iter().map(|h| h.day_change_dollars).sum();
    let unrealized: Decimal = group.iter().map(|h| h.unrealized_gain_loss).sum();

    let mut brokers = BTreeMap::new();
    for holding in &group {
        for (broker, value) in &holding.brokers {
            *brokers.entry(*broker).or_insert(Decimal::ZERO) += *value;
        }
    }

    Some(Holding {
        description: base.description.clone(),
        symbol,
        quantity,
        price: ratio(current_value, quantity),
        unit_cost: ratio(cost_basis, quantity),
        cost_basis,
        current_value,
        day_change_percent: ratio(day_change_dollars, current_value - day_change_dollars),
        day_change_dollars,
        unrealized_gain_loss: unrealized,
        unrealized_gain_loss_percent: ratio(unrealized, cost_basis),
        portfolio_percentage: None,
        brokers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn holding(symbol: &str, quantity: Decimal, value: Decimal, cost: Decimal) -> Holding {
        Holding {
            symbol: symbol.to_string(),
            description: format!("{symbol} Inc"),
            quantity,
            price: value / quantity,
            unit_cost: cost / quantity,
            cost_basis: cost,
            current_value: value,
            day_change_percent: Decimal::ZERO,
            day_change_dollars: dec!(10),
            unrealized_gain_loss: value - cost,
            unrealized_gain_loss_percent: (value - cost) / cost,
            portfolio_percentage: None,
            brokers: BTreeMap::new(),
        }
    }

    #[test]
    fn merges_same_symbol_across_brokers() {
        let chase = PortfolioSnapshot::new(
            BrokerIdentity::Chase,
            vec![holding("VTI", dec!(10), dec!(2000), dec!(1500))],
        );
        let etrade = PortfolioSnapshot::new(
            BrokerIdentity::ETrade,
            vec![
                holding("VTI", dec!(30), dec!(6000), dec!(4500)),
                holding("AAPL", dec!(10), dec!(2000), dec!(1000)),
            ],
        );

        let portfolio = Portfolio::combine([&chase, &etrade]);

        assert_eq!(portfolio.holdings.len(), 2);
        assert_eq!(portfolio.total_value, dec!(10000));
        assert_eq!(portfolio.brokers_updated, vec![BrokerIdentity::Chase, BrokerIdentity::ETrade]);

        let vti = portfolio.holdings.iter().find(|h| h.symbol == "VTI").unwrap();
        assert_eq!(vti.quantity, dec!(40));
        assert_eq!(vti.price, dec!(200));
        assert_eq!(vti.unit_cost, dec!(150));
        assert_eq!(vti.portfolio_percentage, Some(dec!(0.8)));
        assert_eq!(vti.brokers.get(&BrokerIdentity::Chase), Some(&dec!(2000)));
        assert_eq!(vti.brokers.get(&BrokerIdentity::ETrade), Some(&dec!(6000)));
    }

    #[test]
    fn empty_input_produces_zero_totals() {
        let portfolio = Portfolio::combine(std::iter::empty());
        assert!(portfolio.holdings.is_empty());
        assert_eq!(portfolio.total_value, Decimal::ZERO);
        assert_eq!(portfolio.day_change_percent, Decimal::ZERO);
    }
}
