use analysis_core::{
    AnalysisError, AnalysisResult, InvestmentHorizon, InvestmentObjective, ProfileAnalyzer,
    RiskTolerance, SignalStrength, StockSnapshot, UserProfile,
};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;

/// Daily moves beyond this are treated as noise rather than momentum
const MAX_DAILY_MOVE: f64 = 10.0;

/// Scores a quote against the investor's profile.
///
/// Deterministic for the same inputs. Works from the snapshot alone: the daily move is
/// the momentum signal and its magnitude stands in for volatility.
#[derive(Debug, Clone, Default)]
pub struct ProfileScorer;

impl ProfileScorer {
    pub fn new() -> Self {
        Self
    }

    fn daily_move(snapshot: &StockSnapshot) -> Option<f64> {
        snapshot.change_percent.or_else(|| {
            let previous = snapshot.previous_close?;
            (previous > 0.0).then(|| (snapshot.price - previous) / previous * 100.0)
        })
    }

    fn score(profile: &UserProfile, change: f64) -> (f64, Vec<String>) {
        let change = change.clamp(-MAX_DAILY_MOVE, MAX_DAILY_MOVE);
        let mut notes = Vec::new();

        let horizon_weight = match profile.horizon {
            InvestmentHorizon::Short => 1.2,
            InvestmentHorizon::Medium => 0.9,
            InvestmentHorizon::Long => 0.6,
        };
        let risk_weight = match profile.risk_tolerance {
            RiskTolerance::Conservative => 0.8,
            RiskTolerance::Moderate => 1.0,
            RiskTolerance::Aggressive => 1.3,
        };
        let mut score = change * 6.0 * horizon_weight * risk_weight;

        let volatility_penalty = match profile.risk_tolerance {
            RiskTolerance::Conservative => 4.0,
            RiskTolerance::Moderate => 2.0,
            RiskTolerance::Aggressive => 0.0,
        } * change.abs();
        if volatility_penalty > 5.0 {
            notes.push(format!("{:.1}% daily swing is large for this risk tolerance", change.abs()));
        }
        score -= volatility_penalty;

        if profile.horizon == InvestmentHorizon::Long {
            score += 10.0;
            notes.push("long horizon smooths short-term moves".to_string());
        }

        match profile.objective {
            InvestmentObjective::Income if change > 3.0 => {
                score -= 10.0;
                notes.push("sharp rally is a poor entry for income".to_string());
            }
            InvestmentObjective::Growth if change > 0.0 => {
                score += 10.0;
                notes.push("positive momentum suits a growth objective".to_string());
            }
            _ => {}
        }

        (score.clamp(-100.0, 100.0), notes)
    }
}

#[async_trait]
impl ProfileAnalyzer for ProfileScorer {
    async fn analyze(
        &self,
        profile: &UserProfile,
        snapshot: &StockSnapshot,
    ) -> Result<Option<AnalysisResult>, AnalysisError> {
        if !snapshot.price.is_finite() || snapshot.price <= 0.0 {
            return Err(AnalysisError::InvalidData(format!(
                "{} has no usable price",
                snapshot.ticker
            )));
        }

        let Some(change) = Self::daily_move(snapshot) else {
            tracing::debug!("No previous close for {}, skipping scoring", snapshot.ticker);
            return Ok(None);
        };

        let (score, notes) = Self::score(profile, change);
        let signal = SignalStrength::from_score(score.round() as i32);
        let confidence = (0.5 + score.abs() / 200.0).min(0.9);

        let mut reason = format!(
            "{} for a {} / {} / {} investor ({:+.2}% today)",
            signal.to_label(),
            profile.risk_tolerance.as_str(),
            profile.horizon.as_str(),
            profile.objective.as_str(),
            change
        );
        if !notes.is_empty() {
            reason.push_str(": ");
            reason.push_str(&notes.join("; "));
        }

        Ok(Some(AnalysisResult {
            symbol: snapshot.ticker.to_string(),
            timestamp: Utc::now(),
            signal,
            confidence,
            reason,
            metrics: json!({
                "score": score,
                "daily_change_percent": change,
                "price": snapshot.price,
                "previous_close": snapshot.previous_close,
                "volume": snapshot.volume,
            }),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use analysis_core::Ticker;

    fn snapshot(change: Option<f64>, previous_close: Option<f64>) -> StockSnapshot {
        StockSnapshot {
            ticker: Ticker::parse("AAPL").unwrap(),
            name: None,
            price: 100.0,
            previous_close,
            change_percent: change,
            volume: None,
            as_of: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_same_inputs_same_signal() {
        let scorer = ProfileScorer::new();
        let profile = UserProfile::default();
        let snap = snapshot(Some(1.5), Some(98.5));

        let a = scorer.analyze(&profile, &snap).await.unwrap().unwrap();
        let b = scorer.analyze(&profile, &snap).await.unwrap().unwrap();
        assert_eq!(a.signal, b.signal);
        assert_eq!(a.confidence, b.confidence);
    }

    #[tokio::test]
    async fn test_conservative_penalises_volatility() {
        let scorer = ProfileScorer::new();
        let snap = snapshot(Some(6.0), Some(94.3));
        let conservative = UserProfile::new(
            RiskTolerance::Conservative,
            InvestmentHorizon::Short,
            InvestmentObjective::Income,
        );
        let aggressive = UserProfile::new(
            RiskTolerance::Aggressive,
            InvestmentHorizon::Short,
            InvestmentObjective::Growth,
        );

        let low = scorer.analyze(&conservative, &snap).await.unwrap().unwrap();
        let high = scorer.analyze(&aggressive, &snap).await.unwrap().unwrap();
        assert!(low.signal.to_score() < high.signal.to_score());
        assert_eq!(high.signal, SignalStrength::Buy);
        assert_eq!(low.signal, SignalStrength::Neutral);
    }

    #[tokio::test]
    async fn test_change_derived_from_previous_close() {
        let scorer = ProfileScorer::new();
        let result = scorer
            .analyze(&UserProfile::default(), &snapshot(None, Some(80.0)))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result.metrics["daily_change_percent"], json!(25.0));
    }

    #[tokio::test]
    async fn test_missing_reference_price_yields_nothing() {
        let scorer = ProfileScorer::new();
        let result = scorer
            .analyze(&UserProfile::default(), &snapshot(None, None))
            .await
            .unwrap();
        assert!(result.is_none());
    }
}
