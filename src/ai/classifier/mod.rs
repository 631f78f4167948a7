//! Mode Classifier
//!
//! Scores a free-text message against weighted trigger vocabularies and
//! picks the conversation mode.
//!
//! ## Algorithm
//!
//! 1. Normalize the message (lowercase, trim, collapse whitespace)
//! 2. Sum the weights of every trigger phrase found as a substring
//! 3. Apply the per-track multipliers (`track`, alias `carril`)
//! 4. Add the emotion bonus to `coach` when intensity exceeds the threshold
//! 5. Rank descending; ties keep trigger-table order
//! 6. Below the score floor, answer the fallback mode at `low` confidence
//!
//! Classification never fails: a broken trigger source degrades to the
//! built-in table.

mod emotion;
mod triggers;

pub use emotion::{EmotionBoosts, emotion_intensity};
pub use triggers::{
    SharedTriggerSource, SqliteTriggerSource, Trigger, TriggerCache, TriggerSource, TriggerTable,
    builtin_triggers,
};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::debug;

use crate::config::{ClassifierConfig, StorageConfig, TriggerSourceKind};
use crate::types::{
    ChatContext, Confidence, Mode, ModeDecision, Result, SharedClock, normalize_text,
};

/// Shared classifier handle
pub type SharedClassifier = Arc<ModeClassifier>;

/// Scaling constants resolved from configuration
#[derive(Debug, Clone)]
struct Scoring {
    fallback_mode: Mode,
    score_floor: f64,
    high_confidence_gap: f64,
    medium_confidence_gap: f64,
    emotion_threshold: f64,
    emotion_bonus: f64,
    boosts: EmotionBoosts,
    /// Upper-case track name → mode → factor
    track_multipliers: HashMap<String, BTreeMap<Mode, f64>>,
}

impl From<&ClassifierConfig> for Scoring {
    fn from(config: &ClassifierConfig) -> Self {
        let track_multipliers = config
            .track_multipliers
            .iter()
            .map(|(track, factors)| {
                let factors = factors
                    .iter()
                    .filter_map(|(mode, factor)| mode.parse::<Mode>().ok().map(|m| (m, *factor)))
                    .collect();
                (track.to_uppercase(), factors)
            })
            .collect();

        Self {
            fallback_mode: config.fallback_mode,
            score_floor: config.score_floor,
            high_confidence_gap: config.high_confidence_gap,
            medium_confidence_gap: config.medium_confidence_gap,
            emotion_threshold: config.emotion_threshold,
            emotion_bonus: config.emotion_bonus,
            boosts: EmotionBoosts {
                punctuation: config.punctuation_boost,
                uppercase: config.uppercase_boost,
            },
            track_multipliers,
        }
    }
}

pub struct ModeClassifier {
    triggers: TriggerCache,
    scoring: Scoring,
}

impl ModeClassifier {
    /// Classifier over the built-in trigger table
    pub fn new(config: &ClassifierConfig) -> Self {
        Self::with_source(config, None)
    }

    /// Classifier over an external trigger source, cached for the configured TTL
    pub fn with_source(config: &ClassifierConfig, source: Option<SharedTriggerSource>) -> Self {
        Self {
            triggers: TriggerCache::new(source, config.trigger_cache_ttl_secs),
            scoring: Scoring::from(config),
        }
    }

    /// Build from configuration, opening the SQLite trigger source when selected
    pub fn from_config(config: &ClassifierConfig, storage: &StorageConfig) -> Result<Self> {
        let source: Option<SharedTriggerSource> = match config.trigger_source {
            TriggerSourceKind::Builtin => None,
            TriggerSourceKind::Sqlite => {
                if let Some(parent) = storage.path.parent()
                    && !parent.as_os_str().is_empty()
                {
                    std::fs::create_dir_all(parent)?;
                }
                Some(Arc::new(SqliteTriggerSource::open(&storage.path)?))
            }
        };
        Ok(Self::with_source(config, source))
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.triggers = self.triggers.with_clock(clock);
        self
    }

    /// Bound for loading the trigger table from its source
    pub fn with_load_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.triggers = self.triggers.with_load_timeout(timeout);
        self
    }

    /// Pick a mode for the message
    pub async fn classify(&self, message: &str, context: &ChatContext) -> ModeDecision {
        let table = self.triggers.table().await;
        self.score(&table, message, context)
    }

    fn score(&self, table: &TriggerTable, message: &str, context: &ChatContext) -> ModeDecision {
        let s = &self.scoring;
        let normalized = normalize_text(message);

        // 1. Trigger weights
        let mut scores: BTreeMap<Mode, f64> = table
            .iter()
            .map(|(mode, triggers)| {
                let score = triggers
                    .iter()
                    .filter(|t| !t.phrase.is_empty() && normalized.contains(t.phrase.as_str()))
                    .map(|t| t.weight)
                    .sum();
                (*mode, score)
            })
            .collect();

        // 2. Track multipliers
        if let Some(track) = context.track()
            && let Some(factors) = s.track_multipliers.get(&track.trim().to_uppercase())
        {
            for (mode, factor) in factors {
                if let Some(score) = scores.get_mut(mode) {
                    *score *= factor;
                }
            }
        }

        // 3. Emotion bonus
        let emotion = emotion_intensity(&normalized, message, s.boosts);
        if emotion > s.emotion_threshold {
            *scores.entry(Mode::Coach).or_insert(0.0) += s.emotion_bonus;
        }

        let scores: BTreeMap<Mode, f64> = scores.into_iter().map(|(m, v)| (m, round2(v))).collect();
        let emotion = round2(emotion);

        // 4. Rank (stable: ties keep table order)
        let mut ranked: Vec<(Mode, f64)> = scores.iter().map(|(m, v)| (*m, *v)).collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        let Some(&(top_mode, top_score)) = ranked.first() else {
            return ModeDecision::fallback(s.fallback_mode, emotion, scores);
        };
        let runner_up = ranked.get(1).map(|(_, v)| *v).unwrap_or(0.0);

        // 5. Confidence
        if top_score < s.score_floor {
            debug!(top_score, "No clear signal, using fallback mode");
            return ModeDecision::fallback(s.fallback_mode, emotion, scores);
        }

        let gap = top_score - runner_up;
        let confidence = if gap > s.high_confidence_gap {
            Confidence::High
        } else if gap > s.medium_confidence_gap {
            Confidence::Medium
        } else {
            Confidence::Low
        };

        debug!(
            mode = %top_mode,
            score = top_score,
            confidence = %confidence,
            emotion,
            "Mode classified"
        );

        ModeDecision {
            mode: top_mode,
            score: top_score,
            confidence,
            emotion_score: emotion,
            scores,
        }
    }
}

impl Default for ModeClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use proptest::prelude::*;

    struct BrokenSource;

    #[async_trait]
    impl TriggerSource for BrokenSource {
        fn name(&self) -> &str {
            "broken"
        }

        async fn load(&self) -> Result<TriggerTable> {
            Err(crate::types::RouterError::Storage("unreachable".into()))
        }
    }

    #[tokio::test]
    async fn test_fear_of_failure_selects_coach_with_high_confidence() {
        let classifier = ModeClassifier::default();
        let decision = classifier
            .classify("tengo miedo de fracasar", &ChatContext::new())
            .await;

        assert_eq!(decision.mode, Mode::Coach);
        assert!(decision.score > 15.0);
        assert_eq!(decision.score, 25.0);
        assert_eq!(decision.confidence, Confidence::High);
        assert_eq!(decision.emotion_score, 0.8);
    }

    #[tokio::test]
    async fn test_empty_message_uses_fallback() {
        let classifier = ModeClassifier::default();
        let decision = classifier.classify("   ", &ChatContext::new()).await;
        assert_eq!(decision.mode, Mode::Consultor);
        assert_eq!(decision.confidence, Confidence::Low);
    }

    #[tokio::test]
    async fn test_fiscal_question() {
        let classifier = ModeClassifier::default();
        let decision = classifier
            .classify("¿Cuándo presento el modelo 303 del IVA?", &ChatContext::new())
            .await;
        assert_eq!(decision.mode, Mode::Fiscal);
        // modelo 303 (15) + iva (12)
        assert_eq!(decision.scores[&Mode::Fiscal], 27.0);
        assert_eq!(decision.confidence, Confidence::High);
    }

    #[tokio::test]
    async fn test_track_multiplier_applies_case_insensitively() {
        let classifier = ModeClassifier::default();
        let plain = classifier.classify("¿qué precio pongo?", &ChatContext::new()).await;
        let acelera = classifier
            .classify(
                "¿qué precio pongo?",
                &ChatContext::new().with("carril", "acelera"),
            )
            .await;

        assert_eq!(plain.scores[&Mode::Cfo], 9.0);
        assert_eq!(acelera.scores[&Mode::Cfo], 11.7);
    }

    #[tokio::test]
    async fn test_ties_keep_table_order() {
        let classifier = ModeClassifier::default();
        // "crear" (consultor 5) and "cliente" (sparring 5)
        let decision = classifier
            .classify("crear algo para un cliente", &ChatContext::new())
            .await;
        assert_eq!(decision.mode, Mode::Consultor);
        assert_eq!(decision.confidence, Confidence::Low);
    }

    #[tokio::test]
    async fn test_broken_source_still_classifies() {
        let classifier =
            ModeClassifier::with_source(&ClassifierConfig::default(), Some(Arc::new(BrokenSource)));
        let decision = classifier.classify("quiero pivotar", &ChatContext::new()).await;
        assert_eq!(decision.mode, Mode::PivotAdvisor);
    }

    #[tokio::test]
    async fn test_custom_floor_and_fallback() {
        let config = ClassifierConfig {
            score_floor: 50.0,
            fallback_mode: Mode::Coach,
            ..Default::default()
        };
        let classifier = ModeClassifier::new(&config);
        let decision = classifier.classify("quiero pivotar", &ChatContext::new()).await;
        assert_eq!(decision.mode, Mode::Coach);
        assert_eq!(decision.confidence, Confidence::Low);
    }

    proptest! {
        #[test]
        fn prop_unmatched_messages_fall_back(message in "[qxzjkw ]{0,40}") {
            let classifier = ModeClassifier::default();
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let decision = rt.block_on(classifier.classify(&message, &ChatContext::new()));
            prop_assert_eq!(decision.mode, Mode::Consultor);
            prop_assert_eq!(decision.confidence, Confidence::Low);
        }
    }
}
