//! Property-based tests for the scoring model and input validation.

use lead_qualifier_api::models::{LeadTier, SubScores};
use lead_qualifier_api::pipeline::is_valid_email;
use lead_qualifier_api::scoring::{ScoringWeights, ThresholdTable};
use proptest::prelude::*;

fn sub_scores() -> impl Strategy<Value = SubScores> {
    (
        -1.0f64..2.0,
        -1.0f64..2.0,
        -1.0f64..2.0,
        -1.0f64..2.0,
    )
        .prop_map(|(company_fit, intent_signal, budget_indicator, urgency)| SubScores {
            company_fit,
            intent_signal,
            budget_indicator,
            urgency,
        })
}

proptest! {
    #[test]
    fn composed_score_stays_in_range(sub in sub_scores()) {
        let score = ScoringWeights::default().compose(&sub);
        prop_assert!(score <= 100);
    }

    #[test]
    fn raising_a_sub_score_never_lowers_the_score(
        sub in sub_scores(),
        bump in 0.0f64..1.0,
    ) {
        let weights = ScoringWeights::default();
        let base = weights.compose(&sub);
        let raised = weights.compose(&SubScores {
            intent_signal: sub.intent_signal + bump,
            ..sub
        });
        prop_assert!(raised >= base);
    }

    #[test]
    fn every_score_classifies_with_the_default_table(score in 0u8..=100) {
        let (tier, _) = ThresholdTable::default().classify(score).unwrap();
        let expected = if score >= 80 {
            LeadTier::Hot
        } else if score >= 50 {
            LeadTier::Warm
        } else {
            LeadTier::Cold
        };
        prop_assert_eq!(tier, expected);
    }

    #[test]
    fn email_validation_never_panics(input in "\\PC*") {
        let _ = is_valid_email(&input);
    }

    #[test]
    fn valid_looking_business_emails_pass(
        local in "[a-z][a-z0-9.]{0,10}[0-9a-z]",
        domain in "[a-z]{3,12}",
        tld in "(com|io|dev|co)",
    ) {
        let email = format!("{}.x@{}corp.{}", local, domain, tld);
        prop_assert!(is_valid_email(&email));
    }
}
