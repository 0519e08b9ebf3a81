//! Scoring model and tier/route classification.
//!
//! The scoring model is a pure function: four weighted sub-scores in [0,1]
//! combine into an integer score in [0,100]. Classification walks an ordered
//! threshold table, highest floor first. Both the weight vector and the
//! table are validated once at startup; neither is a per-request concern.

use crate::errors::AppError;
use crate::models::{LeadTier, RoutingAction, SubScores};
use serde::{Deserialize, Serialize};

/// Tolerance for the weight-sum check.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;

/// Configurable scoring weights. Must be non-negative and sum to 1.0.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub company_fit: f64,
    pub intent_signal: f64,
    pub budget_indicator: f64,
    pub urgency: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            company_fit: 0.35,
            intent_signal: 0.30,
            budget_indicator: 0.20,
            urgency: 0.15,
        }
    }
}

impl ScoringWeights {
    /// Validates the weight vector. Called at startup; a failure here must
    /// prevent process start.
    pub fn validate(&self) -> Result<(), AppError> {
        let weights = [
            ("company_fit", self.company_fit),
            ("intent_signal", self.intent_signal),
            ("budget_indicator", self.budget_indicator),
            ("urgency", self.urgency),
        ];
        for (name, w) in weights {
            if !w.is_finite() || w < 0.0 {
                return Err(AppError::Configuration(format!(
                    "scoring weight '{}' must be a non-negative number, got {}",
                    name, w
                )));
            }
        }
        let total: f64 = weights.iter().map(|(_, w)| w).sum();
        if (total - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(AppError::Configuration(format!(
                "scoring weights must sum to 1.0 (got {})",
                total
            )));
        }
        Ok(())
    }

    /// Combines sub-scores into the final integer score:
    /// `round(Σ weight·subscore × 100)` clamped to [0,100].
    ///
    /// Sub-scores are clamped into [0,1] first so a misbehaving provider
    /// cannot push the result out of range.
    pub fn compose(&self, sub: &SubScores) -> u8 {
        let clamp = |v: f64| v.clamp(0.0, 1.0);
        let raw = clamp(sub.company_fit) * self.company_fit
            + clamp(sub.intent_signal) * self.intent_signal
            + clamp(sub.budget_indicator) * self.budget_indicator
            + clamp(sub.urgency) * self.urgency;
        (raw * 100.0).round().clamp(0.0, 100.0) as u8
    }
}

/// One row of the classification table: scores at or above `min_score`
/// (and below any higher rule's floor) land in `tier` with `action`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub min_score: u8,
    pub tier: LeadTier,
    pub action: RoutingAction,
}

/// Ordered threshold table, evaluated highest floor first. A tie at a
/// boundary belongs to the higher tier (score 80 is HOT, not WARM).
#[derive(Debug, Clone)]
pub struct ThresholdTable {
    rules: Vec<ThresholdRule>,
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self {
            rules: vec![
                ThresholdRule {
                    min_score: 80,
                    tier: LeadTier::Hot,
                    action: RoutingAction::RouteToAe,
                },
                ThresholdRule {
                    min_score: 50,
                    tier: LeadTier::Warm,
                    action: RoutingAction::AddToNurture,
                },
                ThresholdRule {
                    min_score: 0,
                    tier: LeadTier::Cold,
                    action: RoutingAction::AddToMarketing,
                },
            ],
        }
    }
}

impl ThresholdTable {
    /// Builds a table from configuration, validating it at load time.
    /// The rules must be strictly descending and end with a 0 floor so
    /// every score in [0,100] classifies.
    pub fn new(rules: Vec<ThresholdRule>) -> Result<Self, AppError> {
        if rules.is_empty() {
            return Err(AppError::Configuration(
                "threshold table must not be empty".to_string(),
            ));
        }
        for pair in rules.windows(2) {
            if pair[1].min_score >= pair[0].min_score {
                return Err(AppError::Configuration(format!(
                    "threshold table must be strictly descending (found {} after {})",
                    pair[1].min_score, pair[0].min_score
                )));
            }
        }
        match rules.last() {
            Some(last) if last.min_score == 0 => Ok(Self { rules }),
            _ => Err(AppError::Configuration(
                "threshold table must end with a 0-floor entry".to_string(),
            )),
        }
    }

    /// Maps a final score to its (tier, action). First satisfied floor wins.
    pub fn classify(&self, score: u8) -> Result<(LeadTier, RoutingAction), AppError> {
        self.rules
            .iter()
            .find(|r| score >= r.min_score)
            .map(|r| (r.tier, r.action))
            .ok_or_else(|| {
                AppError::Configuration(format!(
                    "no threshold rule matches score {} (malformed table)",
                    score
                ))
            })
    }

    pub fn rules(&self) -> &[ThresholdRule] {
        &self.rules
    }
}

/// Synthesizes a short reasoning string from the sub-score breakdown,
/// used when the scoring provider returns none.
pub fn fallback_reasoning(sub: &SubScores, tier: LeadTier) -> String {
    let mut parts: Vec<&str> = Vec::new();
    if sub.company_fit >= 0.6 {
        parts.push("strong company fit");
    } else if sub.company_fit >= 0.3 {
        parts.push("moderate company fit");
    }
    if sub.intent_signal >= 0.5 {
        parts.push("clear purchase intent");
    }
    if sub.budget_indicator >= 0.4 {
        parts.push("budget indicators present");
    }
    if sub.urgency >= 0.5 {
        parts.push("time-sensitive need");
    }
    if parts.is_empty() {
        parts.push("limited qualification signals");
    }
    let mut summary = parts.join(", ");
    if let Some(first) = summary.get_mut(0..1) {
        first.make_ascii_uppercase();
    }
    format!("{}. Classified as {}.", summary, tier.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sub(company_fit: f64, intent: f64, budget: f64, urgency: f64) -> SubScores {
        SubScores {
            company_fit,
            intent_signal: intent,
            budget_indicator: budget,
            urgency,
        }
    }

    #[test]
    fn default_weights_are_valid() {
        assert!(ScoringWeights::default().validate().is_ok());
    }

    #[test]
    fn weights_not_summing_to_one_rejected() {
        let w = ScoringWeights {
            company_fit: 0.5,
            intent_signal: 0.5,
            budget_indicator: 0.5,
            urgency: 0.5,
        };
        assert!(matches!(w.validate(), Err(AppError::Configuration(_))));
    }

    #[test]
    fn negative_weight_rejected() {
        let w = ScoringWeights {
            company_fit: -0.1,
            intent_signal: 0.5,
            budget_indicator: 0.4,
            urgency: 0.2,
        };
        assert!(matches!(w.validate(), Err(AppError::Configuration(_))));
    }

    #[test]
    fn weight_sum_within_tolerance_accepted() {
        let w = ScoringWeights {
            company_fit: 0.35,
            intent_signal: 0.30,
            budget_indicator: 0.20,
            urgency: 0.15 + 5e-7,
        };
        assert!(w.validate().is_ok());
    }

    #[test]
    fn worked_scoring_scenario() {
        // weights {0.35, 0.30, 0.20, 0.15}, sub-scores {0.92, 0.85, 0.78, 0.70}
        // -> round(83.8) = 84 -> HOT -> route_to_ae
        let weights = ScoringWeights::default();
        let score = weights.compose(&sub(0.92, 0.85, 0.78, 0.70));
        assert_eq!(score, 84);

        let (tier, action) = ThresholdTable::default().classify(score).unwrap();
        assert_eq!(tier, LeadTier::Hot);
        assert_eq!(action, RoutingAction::RouteToAe);
    }

    #[test]
    fn out_of_range_sub_scores_are_clamped() {
        let weights = ScoringWeights::default();
        assert_eq!(weights.compose(&sub(5.0, 5.0, 5.0, 5.0)), 100);
        assert_eq!(weights.compose(&sub(-1.0, -1.0, -1.0, -1.0)), 0);
    }

    #[test]
    fn tier_boundaries_belong_to_higher_tier() {
        let table = ThresholdTable::default();
        assert_eq!(table.classify(80).unwrap().0, LeadTier::Hot);
        assert_eq!(table.classify(79).unwrap().0, LeadTier::Warm);
        assert_eq!(table.classify(50).unwrap().0, LeadTier::Warm);
        assert_eq!(table.classify(49).unwrap().0, LeadTier::Cold);
        assert_eq!(table.classify(0).unwrap().0, LeadTier::Cold);
        assert_eq!(table.classify(100).unwrap().0, LeadTier::Hot);
    }

    #[test]
    fn table_without_zero_floor_rejected() {
        let rules = vec![ThresholdRule {
            min_score: 50,
            tier: LeadTier::Warm,
            action: RoutingAction::AddToNurture,
        }];
        assert!(matches!(
            ThresholdTable::new(rules),
            Err(AppError::Configuration(_))
        ));
    }

    #[test]
    fn non_descending_table_rejected() {
        let rules = vec![
            ThresholdRule {
                min_score: 50,
                tier: LeadTier::Warm,
                action: RoutingAction::AddToNurture,
            },
            ThresholdRule {
                min_score: 80,
                tier: LeadTier::Hot,
                action: RoutingAction::RouteToAe,
            },
            ThresholdRule {
                min_score: 0,
                tier: LeadTier::Cold,
                action: RoutingAction::AddToMarketing,
            },
        ];
        assert!(matches!(
            ThresholdTable::new(rules),
            Err(AppError::Configuration(_))
        ));
    }

    #[test]
    fn fallback_reasoning_mentions_tier() {
        let text = fallback_reasoning(&sub(0.9, 0.6, 0.5, 0.1), LeadTier::Hot);
        assert!(text.contains("strong company fit"));
        assert!(text.contains("HOT"));
    }
}
