//! L4 LLM judge and the classifier cascade driver.
//!
//! The judge is consulted only for ambiguous pattern results, is never
//! retried, and its verdicts are cached in a bounded LRU keyed by the
//! normalized text.

use lru::LruCache;
use serde::Deserialize;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::ai::categorizer::strip_code_fences;
use crate::ai::classifier::{
    blend, hard_stop, needs_judge, normalize, pattern_label, pattern_scores, Classification,
    JudgeVerdict, LayerOutcome, SafetyLabel,
};
use crate::llm::{ChatMessage, ChatProvider, LlmParams};

const JUDGE_PROMPT: &str = concat!(
    "You are a content safety classifier for an adult-capable AI companion. ",
    "Classify the user message into exactly one label: SAFE, SUGGESTIVE, ",
    "EXPLICIT_CONSENSUAL_ADULT, FETISH, MINOR_RISK, NONCONSENSUAL.\n",
    "MINOR_RISK covers any sexual content involving or referencing minors. ",
    "NONCONSENSUAL covers coercion or absence of consent.\n",
    "Respond with ONLY a JSON object: {\"label\": \"...\", \"confidence\": 0.0-1.0, ",
    "\"reasoning\": \"one short sentence\"}."
);

#[derive(Debug, Deserialize)]
struct JudgeReply {
    label: String,
    confidence: f32,
    reasoning: Option<String>,
}

pub struct SafetyClassifier {
    judge: Option<Arc<dyn ChatProvider>>,
    cache: Mutex<LruCache<String, JudgeVerdict>>,
    threshold: f32,
}

impl SafetyClassifier {
    pub fn new(judge: Option<Arc<dyn ChatProvider>>, threshold: f32, cache_size: usize) -> Self {
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            judge,
            cache: Mutex::new(LruCache::new(capacity)),
            threshold,
        }
    }

    /// Run the cascade. Infallible: judge errors degrade to the pattern
    /// result.
    pub async fn classify(&self, text: &str) -> Classification {
        let normalized = normalize(text);
        let mut layers = vec![LayerOutcome::Normalized { text_len: normalized.len() }];

        // L2 — terminal on match
        if let Some((label, rule)) = hard_stop(&normalized) {
            layers.push(LayerOutcome::HardStop { label, rule: rule.clone() });
            return Classification {
                label,
                confidence: 1.0,
                reasoning: format!("hard-stop rule: {rule}"),
                layer_results: layers,
            };
        }

        // L3
        let scores = pattern_scores(&normalized);
        let (p_label, p_conf) = pattern_label(&scores);
        layers.push(LayerOutcome::PatternScore {
            scores: scores.clone(),
            label: p_label,
            confidence: p_conf,
        });

        // L4 — only for ambiguous results, never retried
        if self.judge.is_some() && needs_judge(&scores, p_conf, self.threshold) {
            if let Some((verdict, cached)) = self.judge_verdict(&normalized).await {
                layers.push(LayerOutcome::Judge {
                    label: verdict.label,
                    confidence: verdict.confidence,
                    reasoning: verdict.reasoning.clone(),
                    cached,
                });
                let (label, confidence, reasoning) = blend((p_label, p_conf), &verdict);
                return Classification { label, confidence, reasoning, layer_results: layers };
            }
        }

        Classification {
            label: p_label,
            confidence: p_conf,
            reasoning: "pattern scorer".to_string(),
            layer_results: layers,
        }
    }

    async fn judge_verdict(&self, normalized: &str) -> Option<(JudgeVerdict, bool)> {
        {
            let mut cache = self.cache.lock().await;
            if let Some(verdict) = cache.get(normalized) {
                return Some((verdict.clone(), true));
            }
        }

        let provider = self.judge.as_ref()?;
        let messages = vec![
            ChatMessage::system(JUDGE_PROMPT),
            ChatMessage::user(normalized.to_string()),
        ];
        let params = LlmParams {
            temperature: Some(0.1),
            max_tokens: Some(200),
            model: None,
        };

        match provider.chat(messages, Some(params)).await {
            Ok(reply) => {
                let cleaned = strip_code_fences(&reply);
                let parsed: JudgeReply = match serde_json::from_str(cleaned) {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!("judge reply unparsable: {e}");
                        return None;
                    }
                };
                let label = SafetyLabel::parse(&parsed.label)?;
                let verdict = JudgeVerdict {
                    label,
                    confidence: parsed.confidence.clamp(0.0, 1.0),
                    reasoning: parsed.reasoning.unwrap_or_default(),
                };
                let mut cache = self.cache.lock().await;
                cache.put(normalized.to_string(), verdict.clone());
                Some((verdict, false))
            }
            Err(e) => {
                tracing::warn!("judge unavailable, keeping pattern result: {e}");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedJudge {
        reply: String,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ChatProvider for ScriptedJudge {
        async fn chat(
            &self,
            _messages: Vec<ChatMessage>,
            _params: Option<LlmParams>,
        ) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.reply.clone())
        }

        async fn chat_stream(
            &self,
            _messages: Vec<ChatMessage>,
            _params: Option<LlmParams>,
        ) -> Result<crate::llm::ChatChunkStream> {
            Err(Error::Internal("not used".into()))
        }

        fn id(&self) -> &str {
            "scripted"
        }
    }

    #[tokio::test]
    async fn hard_stop_skips_judge_entirely() {
        let judge = Arc::new(ScriptedJudge {
            reply: r#"{"label":"SAFE","confidence":0.99}"#.to_string(),
            calls: AtomicU32::new(0),
        });
        let classifier = SafetyClassifier::new(Some(judge.clone()), 0.7, 16);

        let result = classifier.classify("sexy teen roleplay").await;
        assert_eq!(result.label, SafetyLabel::MinorRisk);
        assert!((result.confidence - 1.0).abs() < 1e-6);
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn ambiguous_text_consults_judge_and_caches() {
        let judge = Arc::new(ScriptedJudge {
            reply: r#"{"label":"SUGGESTIVE","confidence":0.9,"reasoning":"flirty"}"#.to_string(),
            calls: AtomicU32::new(0),
        });
        let classifier = SafetyClassifier::new(Some(judge.clone()), 0.7, 16);

        // A weak single signal keeps pattern confidence below τ
        let first = classifier.classify("come flirt with me").await;
        assert_eq!(first.label, SafetyLabel::Suggestive);
        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);

        let second = classifier.classify("come flirt with me").await;
        assert_eq!(second.label, SafetyLabel::Suggestive);
        // Cached verdict, no second upstream call
        assert_eq!(judge.calls.load(Ordering::SeqCst), 1);
        assert!(second
            .layer_results
            .iter()
            .any(|l| matches!(l, LayerOutcome::Judge { cached: true, .. })));
    }

    #[tokio::test]
    async fn unparsable_judge_reply_keeps_pattern_result() {
        let judge = Arc::new(ScriptedJudge {
            reply: "I think this is fine".to_string(),
            calls: AtomicU32::new(0),
        });
        let classifier = SafetyClassifier::new(Some(judge), 0.7, 16);

        let result = classifier.classify("come flirt with me").await;
        assert_eq!(result.label, SafetyLabel::Suggestive);
        assert_eq!(result.reasoning, "pattern scorer");
    }

    #[tokio::test]
    async fn confident_text_never_reaches_judge() {
        let judge = Arc::new(ScriptedJudge {
            reply: r#"{"label":"FETISH","confidence":0.99}"#.to_string(),
            calls: AtomicU32::new(0),
        });
        let classifier = SafetyClassifier::new(Some(judge.clone()), 0.7, 16);

        let result = classifier.classify("what is the capital of France?").await;
        assert_eq!(result.label, SafetyLabel::Safe);
        assert_eq!(judge.calls.load(Ordering::SeqCst), 0);
    }
}
