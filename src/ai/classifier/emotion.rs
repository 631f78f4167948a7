//! Emotion intensity scoring.
//!
//! Intensity is the highest-weighted lexicon phrase found in the message,
//! nudged upward by repeated exclamation marks and shouted words.

use regex::Regex;
use std::sync::LazyLock;

const LEXICON: &[(&str, f64)] = &[
    // Strong
    ("no puedo más", 0.9),
    ("estoy destrozado", 0.95),
    ("me rindo", 0.9),
    ("quiero dejarlo", 0.85),
    ("no sé qué hacer", 0.7),
    ("tengo miedo", 0.8),
    ("me siento fatal", 0.85),
    ("estoy agotado", 0.75),
    ("no valgo", 0.9),
    // Moderate
    ("preocupado", 0.5),
    ("nervioso", 0.5),
    ("ansioso", 0.6),
    ("frustrado", 0.6),
    ("cansado", 0.4),
    ("dudas", 0.4),
    ("confundido", 0.4),
];

static REPEATED_EXCLAMATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[!¡]{2,}").expect("valid regex"));

static UPPERCASE_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Z]{4,}").expect("valid regex"));

/// Boost sizes applied on top of the lexicon score
#[derive(Debug, Clone, Copy)]
pub struct EmotionBoosts {
    pub punctuation: f64,
    pub uppercase: f64,
}

impl Default for EmotionBoosts {
    fn default() -> Self {
        Self {
            punctuation: crate::constants::classifier::PUNCTUATION_BOOST,
            uppercase: crate::constants::classifier::UPPERCASE_BOOST,
        }
    }
}

/// Score in `[0, 1]`.
///
/// `normalized` is the lowercased message used for lexicon lookups;
/// `original` keeps its casing and punctuation for the boosts.
pub fn emotion_intensity(normalized: &str, original: &str, boosts: EmotionBoosts) -> f64 {
    let mut score = LEXICON
        .iter()
        .filter(|(phrase, _)| normalized.contains(phrase))
        .map(|(_, weight)| *weight)
        .fold(0.0_f64, f64::max);

    if REPEATED_EXCLAMATION.is_match(original) {
        score = (score + boosts.punctuation).min(1.0);
    }
    if UPPERCASE_RUN.is_match(original) {
        score = (score + boosts.uppercase).min(1.0);
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn score(message: &str) -> f64 {
        emotion_intensity(
            &crate::types::normalize_text(message),
            message,
            EmotionBoosts::default(),
        )
    }

    #[test]
    fn test_takes_maximum_weight() {
        assert_eq!(score("estoy cansado y tengo miedo"), 0.8);
        assert_eq!(score("hola"), 0.0);
    }

    #[test]
    fn test_boosts_are_capped() {
        assert!((score("tengo miedo!!") - 0.9).abs() < 1e-9);
        assert!((score("ESTOY DESTROZADO!!") - 1.0).abs() < 1e-9);
        assert!((score("AYUDA") - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_short_uppercase_does_not_boost() {
        assert_eq!(score("IVA y RETA"), 0.0);
    }
}
