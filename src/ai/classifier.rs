//! Content safety classifier — a four-layer cascade.
//!
//! L1 normalizes the text, L2 applies hard-stop rules that short-circuit
//! the cascade, L3 scores weighted keyword patterns, and L4 (optional)
//! escalates ambiguous cases to an LLM judge. Layers produce tagged
//! results; blending the judge verdict with the pattern result is a pure
//! function so the full rule table is testable without a model.

use serde::{Deserialize, Serialize};

// ── Labels ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyLabel {
    Safe,
    Suggestive,
    ExplicitConsensualAdult,
    Fetish,
    MinorRisk,
    Nonconsensual,
    Refused,
}

impl SafetyLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyLabel::Safe => "SAFE",
            SafetyLabel::Suggestive => "SUGGESTIVE",
            SafetyLabel::ExplicitConsensualAdult => "EXPLICIT_CONSENSUAL_ADULT",
            SafetyLabel::Fetish => "FETISH",
            SafetyLabel::MinorRisk => "MINOR_RISK",
            SafetyLabel::Nonconsensual => "NONCONSENSUAL",
            SafetyLabel::Refused => "REFUSED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_uppercase().as_str() {
            "SAFE" => Some(SafetyLabel::Safe),
            "SUGGESTIVE" => Some(SafetyLabel::Suggestive),
            "EXPLICIT_CONSENSUAL_ADULT" | "EXPLICIT" => Some(SafetyLabel::ExplicitConsensualAdult),
            "FETISH" => Some(SafetyLabel::Fetish),
            "MINOR_RISK" => Some(SafetyLabel::MinorRisk),
            "NONCONSENSUAL" => Some(SafetyLabel::Nonconsensual),
            "REFUSED" => Some(SafetyLabel::Refused),
            _ => None,
        }
    }

    /// Risk ordering, strictest last. MINOR_RISK and NONCONSENSUAL share
    /// the top level.
    pub fn risk_level(&self) -> u8 {
        match self {
            SafetyLabel::Safe => 0,
            SafetyLabel::Suggestive => 1,
            SafetyLabel::ExplicitConsensualAdult => 2,
            SafetyLabel::Fetish => 3,
            SafetyLabel::MinorRisk | SafetyLabel::Nonconsensual | SafetyLabel::Refused => 4,
        }
    }
}

// ── Layer results ──────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PatternScores {
    pub anatomy: f32,
    pub acts: f32,
    pub fetish: f32,
    pub suggestive: f32,
}

impl PatternScores {
    /// Count of distinct pattern buckets that fired.
    pub fn signals(&self) -> usize {
        [self.anatomy, self.acts, self.fetish, self.suggestive]
            .iter()
            .filter(|s| **s > 0.0)
            .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "layer", rename_all = "snake_case")]
pub enum LayerOutcome {
    Normalized { text_len: usize },
    HardStop { label: SafetyLabel, rule: String },
    PatternScore { scores: PatternScores, label: SafetyLabel, confidence: f32 },
    Judge { label: SafetyLabel, confidence: f32, reasoning: String, cached: bool },
    RouteLocked { route: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub label: SafetyLabel,
    pub confidence: f32,
    pub reasoning: String,
    pub layer_results: Vec<LayerOutcome>,
}

// ── L1: normalization ──────────────────────────────────

/// Fold leetspeak digits/symbols, drop emoji modifiers, lowercase and
/// collapse whitespace. Pure.
pub fn normalize(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut last_was_space = true;
    for c in text.chars() {
        let folded = match c {
            '0' => 'o',
            '1' | '!' => 'i',
            '3' => 'e',
            '4' | '@' => 'a',
            '5' | '$' => 's',
            '7' => 't',
            // Emoji skin-tone modifiers, variation selectors, ZWJ
            '\u{1F3FB}'..='\u{1F3FF}' | '\u{FE0E}' | '\u{FE0F}' | '\u{200D}' => continue,
            other => other,
        };
        if folded.is_whitespace() {
            if !last_was_space {
                out.push(' ');
                last_was_space = true;
            }
        } else {
            for lower in folded.to_lowercase() {
                out.push(lower);
            }
            last_was_space = false;
        }
    }
    out.trim_end().to_string()
}

// ── L2: hard-stop rules ────────────────────────────────

const MINOR_PATTERNS: &[&str] = &[
    r"\bteen(?:s|ager|aged)?\b",
    r"\bunderage\b",
    r"\bminor(?:s)?\b",
    r"\bchild(?:ren)?\b",
    r"\b(?:1[0-7]|[1-9])[ -]?(?:yo|y/o|year[ -]old)s?\b",
    r"\bhigh[ -]?school(?:er)?\b",
    r"\bloli\b",
    r"\bshota\b",
    r"\bschool ?girl\b",
    r"\bschool ?boy\b",
];

/// Terms that are themselves sexual coercion; no further context needed.
const NONCONSENT_ALWAYS: &[&str] = &[
    r"\brapes?\b",
    r"\braping\b",
    r"\bnon[ -]?consen\w*",
];

/// Coercion phrasing that only matters in a sexual context.
const NONCONSENT_CONTEXTUAL: &[&str] = &[
    r"\bagainst (?:her|his|their) will\b",
    r"\bforc(?:e|es|ed|ing) (?:her|him|them)\b",
    r"\b(?:she|he|they) (?:doesn'?t|don'?t|didn'?t) want\b",
    r"\bdrugg?ed\b",
    r"\bwhile (?:she|he|they) (?:was|were) unconscious\b",
    r"\bcan'?t say no\b",
];

fn compile_rules(patterns: &[&str]) -> Vec<regex::Regex> {
    patterns
        .iter()
        .map(|p| regex::Regex::new(p).expect("hard-stop rule"))
        .collect()
}

fn minor_rules() -> &'static Vec<regex::Regex> {
    static RULES: std::sync::OnceLock<Vec<regex::Regex>> = std::sync::OnceLock::new();
    RULES.get_or_init(|| compile_rules(MINOR_PATTERNS))
}

fn nonconsent_always_rules() -> &'static Vec<regex::Regex> {
    static RULES: std::sync::OnceLock<Vec<regex::Regex>> = std::sync::OnceLock::new();
    RULES.get_or_init(|| compile_rules(NONCONSENT_ALWAYS))
}

fn nonconsent_contextual_rules() -> &'static Vec<regex::Regex> {
    static RULES: std::sync::OnceLock<Vec<regex::Regex>> = std::sync::OnceLock::new();
    RULES.get_or_init(|| compile_rules(NONCONSENT_CONTEXTUAL))
}

/// Terminal on match; the rest of the cascade is skipped.
pub fn hard_stop(normalized: &str) -> Option<(SafetyLabel, String)> {
    // Age-indicating rules only matter alongside a sexual signal; an
    // innocent mention of "my children" must not hard-stop on its own.
    let scores = pattern_scores(normalized);
    let explicit_coercion = nonconsent_always_rules()
        .iter()
        .find(|rule| rule.is_match(normalized));
    let sexual_context = scores.anatomy > 0.0
        || scores.acts > 0.0
        || scores.suggestive > 0.0
        || explicit_coercion.is_some();

    if sexual_context {
        for rule in minor_rules() {
            if rule.is_match(normalized) {
                return Some((SafetyLabel::MinorRisk, rule.as_str().to_string()));
            }
        }
    }
    if let Some(rule) = explicit_coercion {
        return Some((SafetyLabel::Nonconsensual, rule.as_str().to_string()));
    }
    if sexual_context {
        for rule in nonconsent_contextual_rules() {
            if rule.is_match(normalized) {
                return Some((SafetyLabel::Nonconsensual, rule.as_str().to_string()));
            }
        }
    }
    None
}

// ── L3: pattern scorer ─────────────────────────────────

const ANATOMY_TERMS: &[(&str, f32)] = &[
    ("breasts", 0.5),
    ("nipples", 0.6),
    ("genitals", 0.7),
    ("naked", 0.4),
    ("nude", 0.4),
];

const ACT_TERMS: &[(&str, f32)] = &[
    ("sex", 0.6),
    ("make love", 0.6),
    ("orgasm", 0.8),
    ("masturbat", 0.8),
    ("intercourse", 0.7),
    ("foreplay", 0.6),
];

const FETISH_TERMS: &[(&str, f32)] = &[
    ("bdsm", 0.8),
    ("bondage", 0.8),
    ("dominatrix", 0.8),
    ("fetish", 0.7),
    ("kink", 0.6),
    ("spanking", 0.6),
    ("roleplay as my", 0.3),
];

const SUGGESTIVE_TERMS: &[(&str, f32)] = &[
    ("sexy", 0.4),
    ("flirt", 0.3),
    ("seduce", 0.5),
    ("turn me on", 0.5),
    ("undress", 0.5),
    ("kiss me", 0.3),
    ("in bed together", 0.4),
];

fn bucket_score(normalized: &str, terms: &[(&str, f32)]) -> f32 {
    let mut score: f32 = 0.0;
    for (term, weight) in terms {
        if normalized.contains(term) {
            score += weight;
        }
    }
    score.min(1.0)
}

pub fn pattern_scores(normalized: &str) -> PatternScores {
    PatternScores {
        anatomy: bucket_score(normalized, ANATOMY_TERMS),
        acts: bucket_score(normalized, ACT_TERMS),
        fetish: bucket_score(normalized, FETISH_TERMS),
        suggestive: bucket_score(normalized, SUGGESTIVE_TERMS),
    }
}

/// Preliminary label + confidence from the bucket scores.
pub fn pattern_label(scores: &PatternScores) -> (SafetyLabel, f32) {
    let explicit = scores.acts.max(scores.anatomy);

    if scores.fetish >= 0.5 && scores.fetish >= explicit {
        let confidence = 0.5 + scores.fetish / 2.0;
        return (SafetyLabel::Fetish, confidence.min(0.95));
    }
    if explicit >= 0.5 {
        let confidence = 0.5 + explicit / 2.0;
        return (SafetyLabel::ExplicitConsensualAdult, confidence.min(0.95));
    }
    let soft = scores.suggestive.max(explicit).max(scores.fetish);
    if soft >= 0.25 {
        return (SafetyLabel::Suggestive, 0.4 + soft / 2.0);
    }
    if soft > 0.0 {
        // Weak single signal: lean safe but without much conviction
        return (SafetyLabel::Safe, 0.6);
    }
    (SafetyLabel::Safe, 0.95)
}

/// Whether L4 should be consulted: low confidence, many heterogeneous
/// signals, or bucket scores inside a narrow ambiguous band.
pub fn needs_judge(scores: &PatternScores, confidence: f32, threshold: f32) -> bool {
    if confidence < threshold {
        return true;
    }
    if scores.signals() >= 3 {
        return true;
    }
    let explicit = scores.acts.max(scores.anatomy);
    (explicit - scores.fetish).abs() < 0.1 && explicit > 0.0
}

// ── L4 blending ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct JudgeVerdict {
    pub label: SafetyLabel,
    pub confidence: f32,
    pub reasoning: String,
}

/// Deterministic blend of the pattern result and the judge verdict.
pub fn blend(
    pattern: (SafetyLabel, f32),
    judge: &JudgeVerdict,
) -> (SafetyLabel, f32, String) {
    let (p_label, p_conf) = pattern;

    if judge.confidence >= 0.85 {
        return (judge.label, judge.confidence, judge.reasoning.clone());
    }
    if judge.label == p_label {
        return (
            p_label,
            (p_conf + 0.2).min(1.0),
            format!("pattern and judge agree: {}", judge.reasoning),
        );
    }
    if judge.label.risk_level() > p_label.risk_level() {
        return (
            judge.label,
            judge.confidence,
            format!("judge escalated: {}", judge.reasoning),
        );
    }
    (p_label, p_conf, "pattern result retained".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_folds_leetspeak_and_whitespace() {
        assert_eq!(normalize("s3xy   t4lk"), "sexy talk");
        assert_eq!(normalize("  Hello  World "), "hello world");
    }

    #[test]
    fn normalize_is_idempotent() {
        let once = normalize("S3xy   T@LK!!");
        assert_eq!(normalize(&once), once);
    }

    #[test]
    fn minor_terms_with_sexual_context_hard_stop() {
        let text = normalize("sexy teen roleplay");
        let (label, _) = hard_stop(&text).expect("should hard-stop");
        assert_eq!(label, SafetyLabel::MinorRisk);
    }

    #[test]
    fn innocent_mention_of_children_does_not_hard_stop() {
        let text = normalize("I picked my children up from school today");
        assert!(hard_stop(&text).is_none());
    }

    #[test]
    fn nonconsent_terms_hard_stop() {
        let text = normalize("a story where he forces her into sex");
        let (label, _) = hard_stop(&text).expect("should hard-stop");
        assert_eq!(label, SafetyLabel::Nonconsensual);
    }

    #[test]
    fn benign_text_is_safe_with_high_confidence() {
        let text = normalize("What's the weather like tomorrow?");
        let scores = pattern_scores(&text);
        let (label, confidence) = pattern_label(&scores);
        assert_eq!(label, SafetyLabel::Safe);
        assert!(confidence > 0.9);
    }

    #[test]
    fn fetish_outranks_suggestive() {
        let text = normalize("let's try bondage and bdsm tonight");
        let scores = pattern_scores(&text);
        let (label, _) = pattern_label(&scores);
        assert_eq!(label, SafetyLabel::Fetish);
    }

    #[test]
    fn risk_ordering_is_monotone() {
        assert!(SafetyLabel::Safe.risk_level() < SafetyLabel::Suggestive.risk_level());
        assert!(
            SafetyLabel::Suggestive.risk_level()
                < SafetyLabel::ExplicitConsensualAdult.risk_level()
        );
        assert!(SafetyLabel::ExplicitConsensualAdult.risk_level() < SafetyLabel::Fetish.risk_level());
        assert!(SafetyLabel::Fetish.risk_level() < SafetyLabel::MinorRisk.risk_level());
        assert_eq!(
            SafetyLabel::MinorRisk.risk_level(),
            SafetyLabel::Nonconsensual.risk_level()
        );
    }

    // ── blending rules, exhaustively ──

    fn verdict(label: SafetyLabel, confidence: f32) -> JudgeVerdict {
        JudgeVerdict { label, confidence, reasoning: "r".to_string() }
    }

    #[test]
    fn confident_judge_wins() {
        let (label, confidence, _) = blend(
            (SafetyLabel::Safe, 0.9),
            &verdict(SafetyLabel::ExplicitConsensualAdult, 0.9),
        );
        assert_eq!(label, SafetyLabel::ExplicitConsensualAdult);
        assert!((confidence - 0.9).abs() < 1e-6);
    }

    #[test]
    fn agreement_boosts_confidence_capped_at_one() {
        let (label, confidence, _) = blend(
            (SafetyLabel::Suggestive, 0.6),
            &verdict(SafetyLabel::Suggestive, 0.5),
        );
        assert_eq!(label, SafetyLabel::Suggestive);
        assert!((confidence - 0.8).abs() < 1e-6);

        let (_, capped, _) = blend(
            (SafetyLabel::Suggestive, 0.95),
            &verdict(SafetyLabel::Suggestive, 0.5),
        );
        assert!((capped - 1.0).abs() < 1e-6);
    }

    #[test]
    fn higher_risk_judge_wins_even_when_unsure() {
        let (label, _, _) = blend(
            (SafetyLabel::Suggestive, 0.6),
            &verdict(SafetyLabel::Fetish, 0.5),
        );
        assert_eq!(label, SafetyLabel::Fetish);
    }

    #[test]
    fn lower_risk_unsure_judge_loses() {
        let (label, confidence, _) = blend(
            (SafetyLabel::Fetish, 0.6),
            &verdict(SafetyLabel::Safe, 0.5),
        );
        assert_eq!(label, SafetyLabel::Fetish);
        assert!((confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn judge_triggers_below_threshold_or_on_many_signals() {
        let quiet = PatternScores::default();
        assert!(needs_judge(&quiet, 0.5, 0.7));
        assert!(!needs_judge(&quiet, 0.95, 0.7));

        let noisy = PatternScores { anatomy: 0.3, acts: 0.3, suggestive: 0.3, fetish: 0.0 };
        assert!(needs_judge(&noisy, 0.95, 0.7));
    }
}

#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn normalize_is_idempotent_for_any_input(s in ".{0,200}") {
            let once = normalize(&s);
            prop_assert_eq!(normalize(&once), once.clone());
        }

        #[test]
        fn pattern_scores_and_confidence_stay_in_unit_range(s in ".{0,300}") {
            let scores = pattern_scores(&normalize(&s));
            for value in [scores.anatomy, scores.acts, scores.fetish, scores.suggestive] {
                prop_assert!((0.0..=1.0).contains(&value));
            }
            let (_, confidence) = pattern_label(&scores);
            prop_assert!((0.0..=1.0).contains(&confidence));
        }

        #[test]
        fn blend_picks_one_of_the_two_labels_and_never_drops_below_their_min_risk(
            p_idx in 0usize..4,
            p_conf in 0.0f32..=1.0,
            j_idx in 0usize..4,
            j_conf in 0.0f32..=1.0,
        ) {
            let labels = [
                SafetyLabel::Safe,
                SafetyLabel::Suggestive,
                SafetyLabel::ExplicitConsensualAdult,
                SafetyLabel::Fetish,
            ];
            let judge = JudgeVerdict {
                label: labels[j_idx],
                confidence: j_conf,
                reasoning: String::new(),
            };
            let (label, confidence, _) = blend((labels[p_idx], p_conf), &judge);
            prop_assert!(label == labels[p_idx] || label == labels[j_idx]);
            prop_assert!((0.0..=1.0).contains(&confidence));
            let min_risk = labels[p_idx].risk_level().min(labels[j_idx].risk_level());
            prop_assert!(label.risk_level() >= min_risk);
        }
    }
}
