use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::AnalysisError;

/// Tickers the offline demo dataset can serve. Also quoted back to users
/// whenever a symbol cannot be resolved.
pub const DEMO_TICKERS: &[&str] = &[
    "AAPL", "MSFT", "GOOGL", "AMZN", "NVDA", "TSLA", "META", "JPM", "V", "SPY",
];

/// Normalized ticker symbol (trimmed, uppercase)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticker(String);

impl Ticker {
    pub fn parse(raw: &str) -> Result<Self, AnalysisError> {
        let normalized = raw.trim().to_uppercase();
        if normalized.is_empty() {
            return Err(AnalysisError::InvalidData(
                "Ticker symbol is required".to_string(),
            ));
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ticker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Ticker {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskTolerance {
    Conservative,
    Moderate,
    Aggressive,
}

impl RiskTolerance {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTolerance::Conservative => "conservative",
            RiskTolerance::Moderate => "moderate",
            RiskTolerance::Aggressive => "aggressive",
        }
    }
}

impl FromStr for RiskTolerance {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "conservative" => Ok(RiskTolerance::Conservative),
            "moderate" => Ok(RiskTolerance::Moderate),
            "aggressive" => Ok(RiskTolerance::Aggressive),
            other => Err(AnalysisError::InvalidData(format!(
                "unknown risk tolerance '{}' (expected conservative, moderate or aggressive)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestmentHorizon {
    Short,
    Medium,
    Long,
}

impl InvestmentHorizon {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestmentHorizon::Short => "short",
            InvestmentHorizon::Medium => "medium",
            InvestmentHorizon::Long => "long",
        }
    }
}

impl FromStr for InvestmentHorizon {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "short" => Ok(InvestmentHorizon::Short),
            "medium" => Ok(InvestmentHorizon::Medium),
            "long" => Ok(InvestmentHorizon::Long),
            other => Err(AnalysisError::InvalidData(format!(
                "unknown horizon '{}' (expected short, medium or long)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvestmentObjective {
    Income,
    Balanced,
    Growth,
}

impl InvestmentObjective {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvestmentObjective::Income => "income",
            InvestmentObjective::Balanced => "balanced",
            InvestmentObjective::Growth => "growth",
        }
    }
}

impl FromStr for InvestmentObjective {
    type Err = AnalysisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "income" => Ok(InvestmentObjective::Income),
            "balanced" => Ok(InvestmentObjective::Balanced),
            "growth" => Ok(InvestmentObjective::Growth),
            other => Err(AnalysisError::InvalidData(format!(
                "unknown objective '{}' (expected income, balanced or growth)",
                other
            ))),
        }
    }
}

/// The user's risk profile. All three fields influence the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserProfile {
    pub risk_tolerance: RiskTolerance,
    pub horizon: InvestmentHorizon,
    pub objective: InvestmentObjective,
}

impl UserProfile {
    pub fn new(
        risk_tolerance: RiskTolerance,
        horizon: InvestmentHorizon,
        objective: InvestmentObjective,
    ) -> Self {
        Self {
            risk_tolerance,
            horizon,
            objective,
        }
    }
}

impl Default for UserProfile {
    fn default() -> Self {
        Self::new(
            RiskTolerance::Moderate,
            InvestmentHorizon::Medium,
            InvestmentObjective::Balanced,
        )
    }
}

/// OHLCV bar data
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bar {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Point-in-time quote for a ticker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockSnapshot {
    pub ticker: Ticker,
    #[serde(default)]
    pub name: Option<String>,
    pub price: f64,
    pub previous_close: Option<f64>,
    pub change_percent: Option<f64>,
    pub volume: Option<f64>,
    pub as_of: DateTime<Utc>,
}

/// Historical lookback window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Period {
    #[serde(rename = "1M")]
    OneMonth,
    #[serde(rename = "3M")]
    ThreeMonths,
    #[serde(rename = "6M")]
    SixMonths,
    #[serde(rename = "1Y")]
    OneYear,
    #[serde(rename = "5Y")]
    FiveYears,
}

impl Period {
    pub const ALL: [Period; 5] = [
        Period::OneMonth,
        Period::ThreeMonths,
        Period::SixMonths,
        Period::OneYear,
        Period::FiveYears,
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Period::OneMonth => "1M",
            Period::ThreeMonths => "3M",
            Period::SixMonths => "6M",
            Period::OneYear => "1Y",
            Period::FiveYears => "5Y",
        }
    }

    /// Calendar days covered by the period
    pub fn days(&self) -> i64 {
        match self {
            Period::OneMonth => 30,
            Period::ThreeMonths => 91,
            Period::SixMonths => 182,
            Period::OneYear => 365,
            Period::FiveYears => 1826,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Price history for one ticker over one period
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceSeries {
    pub ticker: Ticker,
    pub period: Period,
    pub bars: Vec<Bar>,
}

impl PriceSeries {
    /// Percent change from the first to the last close
    pub fn total_return(&self) -> Option<f64> {
        let first = self.bars.first()?.close;
        let last = self.bars.last()?.close;
        if first == 0.0 {
            return None;
        }
        Some((last - first) / first * 100.0)
    }
}

/// Signal strength
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SignalStrength {
    StrongBuy,
    Buy,
    WeakBuy,
    Neutral,
    WeakSell,
    Sell,
    StrongSell,
}

impl SignalStrength {
    /// Convert to numeric score (-100 to 100)
    pub fn to_score(&self) -> i32 {
        match self {
            SignalStrength::StrongBuy => 100,
            SignalStrength::Buy => 60,
            SignalStrength::WeakBuy => 30,
            SignalStrength::Neutral => 0,
            SignalStrength::WeakSell => -30,
            SignalStrength::Sell => -60,
            SignalStrength::StrongSell => -100,
        }
    }

    pub fn from_score(score: i32) -> Self {
        match score {
            s if s >= 70 => SignalStrength::StrongBuy,
            s if s >= 30 => SignalStrength::Buy,
            s if s >= 5 => SignalStrength::WeakBuy,
            s if s >= -5 => SignalStrength::Neutral,
            s if s >= -30 => SignalStrength::WeakSell,
            s if s >= -70 => SignalStrength::Sell,
            _ => SignalStrength::StrongSell,
        }
    }

    /// Human-readable label for the signal
    pub fn to_label(&self) -> &'static str {
        match self {
            SignalStrength::StrongBuy => "Strong Buy",
            SignalStrength::Buy => "Buy",
            SignalStrength::WeakBuy => "Weak Buy",
            SignalStrength::Neutral => "Neutral",
            SignalStrength::WeakSell => "Weak Sell",
            SignalStrength::Sell => "Sell",
            SignalStrength::StrongSell => "Strong Sell",
        }
    }
}

/// Output of the profile analysis function
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub symbol: String,
    pub timestamp: DateTime<Utc>,
    pub signal: SignalStrength,
    pub confidence: f64, // 0.0 to 1.0
    pub reason: String,
    pub metrics: serde_json::Value,
}
