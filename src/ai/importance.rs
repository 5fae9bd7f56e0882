//! Importance scoring for extracted memories.
//!
//! Six weighted sub-scores, each in [0, 1]; the aggregate is the weighted
//! sum (weights total 1.0). Scores are recomputed when a memory's access
//! count or age crosses a threshold.

use crate::ai::memory::ImportanceScores;

/// Signals from the source context that influence scoring.
#[derive(Debug, Clone, Default)]
pub struct ImportanceContext {
    /// Intensity/valence of emotion detected in the source turn, 0..1.
    pub emotion_intensity: f64,
    /// Count of similar memories already stored for the user.
    pub similar_prior_count: usize,
    /// Age of the memory in days (0 for new extractions).
    pub age_days: f64,
}

const EXPLICIT_MARKERS: &[&str] = &[
    "remember",
    "don't forget",
    "dont forget",
    "important",
    "keep in mind",
    "make sure",
    "never forget",
    "note that",
];

const FIRST_PERSON: &[&str] = &["i", "i'm", "i've", "my", "me", "mine", "myself", "we", "our"];

pub fn score(content: &str, ctx: &ImportanceContext) -> ImportanceScores {
    ImportanceScores {
        emotional_significance: ctx.emotion_intensity.clamp(0.0, 1.0),
        explicit_mention: explicit_mention(content),
        frequency: (ctx.similar_prior_count as f64 / 5.0).min(1.0),
        recency: 1.0 / (1.0 + ctx.age_days.max(0.0) / 30.0),
        specificity: specificity(content),
        personal_relevance: personal_relevance(content),
    }
}

/// A memory is rescored when its access count passes a power of two or its
/// age crosses a week boundary since the last score.
pub fn should_recompute(access_count: i64, age_days: f64, last_scored_age_days: f64) -> bool {
    let count_threshold = access_count > 0 && (access_count & (access_count - 1)) == 0;
    let age_threshold = (age_days / 7.0).floor() > (last_scored_age_days / 7.0).floor();
    count_threshold || age_threshold
}

fn explicit_mention(content: &str) -> f64 {
    let lower = content.to_lowercase();
    let hits = EXPLICIT_MARKERS.iter().filter(|m| lower.contains(*m)).count();
    match hits {
        0 => 0.0,
        1 => 0.7,
        _ => 1.0,
    }
}

/// Entity density plus concrete tokens (numbers, proper nouns, dates).
fn specificity(content: &str) -> f64 {
    let words: Vec<&str> = content.split_whitespace().collect();
    if words.is_empty() {
        return 0.0;
    }
    let concrete = words
        .iter()
        .enumerate()
        .filter(|(i, w)| {
            let has_digit = w.chars().any(|c| c.is_ascii_digit());
            // Capitalized mid-sentence is a proper-noun signal
            let capitalized = *i > 0 && w.chars().next().is_some_and(|c| c.is_uppercase());
            has_digit || capitalized
        })
        .count();
    (concrete as f64 * 2.0 / words.len() as f64).min(1.0)
}

fn personal_relevance(content: &str) -> f64 {
    let lower = content.to_lowercase();
    let words: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric() && c != '\'')
        .filter(|w| !w.is_empty())
        .collect();
    if words.is_empty() {
        return 0.0;
    }
    let first_person = words.iter().filter(|w| FIRST_PERSON.contains(w)).count();
    (first_person as f64 * 4.0 / words.len() as f64).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_is_weighted_sum_in_unit_range() {
        let scores = score(
            "Remember that I'm allergic to peanuts",
            &ImportanceContext { emotion_intensity: 0.8, similar_prior_count: 2, age_days: 0.0 },
        );
        let expected = 0.30 * scores.emotional_significance
            + 0.25 * scores.explicit_mention
            + 0.15 * scores.frequency
            + 0.10 * scores.recency
            + 0.10 * scores.specificity
            + 0.10 * scores.personal_relevance;
        let aggregate = scores.aggregate();
        assert!((aggregate - expected).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&aggregate));
    }

    #[test]
    fn explicit_markers_raise_the_mention_score() {
        let plain = score("the sky is blue", &ImportanceContext::default());
        let marked = score("please remember the sky is blue", &ImportanceContext::default());
        assert!(marked.explicit_mention > plain.explicit_mention);
    }

    #[test]
    fn first_person_text_scores_personal_relevance() {
        let impersonal = score("water boils at 100 degrees", &ImportanceContext::default());
        let personal = score("I love my dog and my garden", &ImportanceContext::default());
        assert!(personal.personal_relevance > impersonal.personal_relevance);
    }

    #[test]
    fn recency_decays_with_age() {
        let fresh = score("x", &ImportanceContext { age_days: 0.0, ..Default::default() });
        let old = score("x", &ImportanceContext { age_days: 90.0, ..Default::default() });
        assert!(fresh.recency > old.recency);
        assert!((fresh.recency - 1.0).abs() < 1e-9);
    }

    #[test]
    fn recompute_triggers_on_access_count_powers_of_two() {
        assert!(should_recompute(1, 0.0, 0.0));
        assert!(should_recompute(2, 0.0, 0.0));
        assert!(!should_recompute(3, 0.0, 0.0));
        assert!(should_recompute(4, 0.0, 0.0));
    }

    #[test]
    fn recompute_triggers_on_week_boundary() {
        assert!(should_recompute(0, 8.0, 6.0));
        assert!(!should_recompute(0, 6.5, 6.0));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn aggregate_equals_the_weighted_sum_and_stays_in_unit_range(
            a in 0.0f64..=1.0,
            b in 0.0f64..=1.0,
            c in 0.0f64..=1.0,
            d in 0.0f64..=1.0,
            e in 0.0f64..=1.0,
            f in 0.0f64..=1.0,
        ) {
            let scores = ImportanceScores {
                emotional_significance: a,
                explicit_mention: b,
                frequency: c,
                recency: d,
                specificity: e,
                personal_relevance: f,
            };
            let aggregate = scores.aggregate();
            prop_assert!((0.0..=1.0).contains(&aggregate));
            let expected = 0.30 * a + 0.25 * b + 0.15 * c + 0.10 * d + 0.10 * e + 0.10 * f;
            prop_assert!((aggregate - expected).abs() < 1e-9);
        }

        #[test]
        fn sub_scores_stay_in_unit_range_for_any_text(
            s in ".{0,200}",
            intensity in 0.0f64..=1.0,
            count in 0usize..20,
            age in 0.0f64..=1000.0,
        ) {
            let scores = score(&s, &ImportanceContext {
                emotion_intensity: intensity,
                similar_prior_count: count,
                age_days: age,
            });
            for value in [
                scores.emotional_significance,
                scores.explicit_mention,
                scores.frequency,
                scores.recency,
                scores.specificity,
                scores.personal_relevance,
            ] {
                prop_assert!((0.0..=1.0).contains(&value));
            }
        }
    }
}
