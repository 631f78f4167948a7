//! PII redaction for streamed chunks.
//!
//! Maskers run on partial buffers, so every pattern is self-contained: an
//! identifier split across two chunks is simply left as-is in both.

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

/// Text → redacted text
pub trait PiiMasker: Send + Sync {
    fn mask(&self, text: &str) -> String;
}

/// Shared masker handle
pub type SharedPiiMasker = Arc<dyn PiiMasker>;

/// Applied in order, most specific first; each match becomes `[REDACTED_<TYPE>]`
static PII_PATTERNS: LazyLock<Vec<(&'static str, Regex)>> = LazyLock::new(|| {
    [
        ("email", r"[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}"),
        ("iban_es", r"\bES\d{2}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{2}[\s-]?\d{10}\b"),
        ("credit_card", r"\b(?:\d{4}[-\s]?){3}\d{4}\b"),
        ("ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
        ("phone_es", r"(?:\+34|\b0034)[\s-]?\d{9}\b"),
        ("nie", r"\b[XYZxyz]\d{7}[A-Za-z]\b"),
        ("nif_cif", r"\b[A-HJ-NP-SUVW]\d{7}[A-J0-9]\b"),
        ("dni", r"\b\d{8}[A-Za-z]\b"),
        ("phone", r"\b\d{3}[-.]?\d{3}[-.]?\d{4}\b"),
    ]
    .into_iter()
    .map(|(kind, pattern)| (kind, Regex::new(pattern).expect("valid regex")))
    .collect()
});

/// Default regex-based masker
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexPiiMasker;

impl RegexPiiMasker {
    pub fn new() -> Self {
        Self
    }

    /// Match counts per PII type
    pub fn detect(&self, text: &str) -> BTreeMap<&'static str, usize> {
        PII_PATTERNS
            .iter()
            .filter_map(|(kind, re)| {
                let count = re.find_iter(text).count();
                (count > 0).then_some((*kind, count))
            })
            .collect()
    }
}

impl PiiMasker for RegexPiiMasker {
    fn mask(&self, text: &str) -> String {
        PII_PATTERNS
            .iter()
            .fold(text.to_string(), |acc, (kind, re)| {
                if re.is_match(&acc) {
                    re.replace_all(&acc, format!("[REDACTED_{}]", kind.to_uppercase()).as_str())
                        .into_owned()
                } else {
                    acc
                }
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mask(text: &str) -> String {
        RegexPiiMasker.mask(text)
    }

    #[test]
    fn test_masks_email_and_phone() {
        assert_eq!(
            mask("Escríbeme a ana.garcia@example.es o llama al 600-123-4567."),
            "Escríbeme a [REDACTED_EMAIL] o llama al [REDACTED_PHONE]."
        );
    }

    #[test]
    fn test_masks_spanish_identifiers() {
        assert_eq!(mask("Mi DNI es 12345678Z"), "Mi DNI es [REDACTED_DNI]");
        assert_eq!(mask("NIE X1234567L"), "NIE [REDACTED_NIE]");
        assert_eq!(
            mask("IBAN ES91 2100 0418 45 0200051332"),
            "IBAN [REDACTED_IBAN_ES]"
        );
        assert_eq!(mask("CIF B1234567A"), "CIF [REDACTED_NIF_CIF]");
        assert_eq!(mask("móvil +34 612345678"), "móvil [REDACTED_PHONE_ES]");
    }

    #[test]
    fn test_masks_card_and_ssn() {
        assert_eq!(mask("4111 1111 1111 1111"), "[REDACTED_CREDIT_CARD]");
        assert_eq!(mask("ssn 123-45-6789"), "ssn [REDACTED_SSN]");
    }

    #[test]
    fn test_leaves_plain_text_and_partial_identifiers() {
        let text = "El modelo 303 se presenta antes del día 20. Mi DNI es 1234";
        assert_eq!(mask(text), text);
    }

    #[test]
    fn test_detect_counts() {
        let found = RegexPiiMasker.detect("a@b.es y c@d.com");
        assert_eq!(found.get("email"), Some(&2));
        assert!(RegexPiiMasker.detect("hola").is_empty());
    }
}
