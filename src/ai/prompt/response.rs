//! Response post-processing: disclaimers, suggestions and the static fallback.

use regex::Regex;
use std::sync::LazyLock;

use crate::types::{CacheLayer, ChatResponse, Mode};

/// Provider id reported on the static fallback response
pub const FALLBACK_PROVIDER: &str = "fallback";

/// Disclaimers already present in a text contain this marker
const DISCLAIMER_MARKER: &str = "orientativa";

const FISCAL_DISCLAIMER: &str = "Esta información es orientativa. La normativa puede cambiar y cada caso es único. \
Para decisiones importantes, consulta con un asesor fiscal colegiado.";

const LABORAL_DISCLAIMER: &str = "Esta información es orientativa. Verifica tu situación específica en la \
Seguridad Social o con un graduado social colegiado.";

static NUMBERED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\d+\.\s*(.+)$").expect("valid regex"));

pub fn disclaimer_for(mode: Mode) -> Option<&'static str> {
    match mode {
        Mode::Fiscal => Some(FISCAL_DISCLAIMER),
        Mode::Laboral => Some(LABORAL_DISCLAIMER),
        _ => None,
    }
}

/// Append the mode's disclaimer unless the text already carries one
pub fn apply_disclaimer(text: &str, mode: Mode) -> String {
    match disclaimer_for(mode) {
        Some(disclaimer) if !text.contains(DISCLAIMER_MARKER) => format!("{}\n\n{}", text, disclaimer),
        _ => text.to_string(),
    }
}

/// First `max` numbered-list items
pub fn extract_suggestions(text: &str, max: usize) -> Vec<String> {
    NUMBERED_ITEM
        .captures_iter(text)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().trim_end().to_string())
        .take(max)
        .collect()
}

/// Final response for generated text
pub fn format_response(
    text: &str,
    mode: Mode,
    provider: &str,
    model: &str,
    max_suggestions: usize,
) -> ChatResponse {
    let text = apply_disclaimer(text, mode);
    let suggestions = extract_suggestions(&text, max_suggestions);
    ChatResponse {
        text,
        mode,
        provider: provider.to_string(),
        model: model.to_string(),
        suggestions,
        from_cache: false,
        cache_layer: CacheLayer::None,
        similarity_score: None,
        error: false,
        mode_decision: None,
    }
}

/// Static, mode-specific answer used when every provider failed
pub fn fallback_response(mode: Mode) -> ChatResponse {
    let (text, suggestions): (String, [&str; 3]) = match mode {
        Mode::LandingCopilot => (
            "Lo siento, en este momento no puedo procesar tu consulta. Te invito a explorar nuestra \
             plataforma: puedes ver ofertas de empleo, conocer el programa de emprendimiento, o \
             registrarte gratis para acceder a todas las funcionalidades."
                .to_string(),
            [
                "Explorar ofertas de empleo",
                "Conocer programa emprendimiento",
                "Registrarse gratis",
            ],
        ),
        _ => (
            format!(
                "Estoy en modo {} pero actualmente no puedo procesar tu consulta. Por favor, \
                 inténtalo de nuevo en unos momentos. Mientras tanto, puedes revisar la biblioteca \
                 de experimentos, consultar tu Business Model Canvas, o revisar tus hipótesis \
                 pendientes de validar.",
                mode.label()
            ),
            [
                "Revisar biblioteca de experimentos",
                "Consultar Business Model Canvas",
                "Revisar hipótesis pendientes",
            ],
        ),
    };

    ChatResponse {
        text,
        mode,
        provider: FALLBACK_PROVIDER.to_string(),
        model: String::new(),
        suggestions: suggestions.iter().map(|s| s.to_string()).collect(),
        from_cache: false,
        cache_layer: CacheLayer::None,
        similarity_score: None,
        error: true,
        mode_decision: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disclaimer_for_expert_modes_only() {
        let fiscal = apply_disclaimer("El IVA se presenta trimestralmente.", Mode::Fiscal);
        assert!(fiscal.ends_with("consulta con un asesor fiscal colegiado."));
        assert!(fiscal.contains(".\n\nEsta información es orientativa."));

        let laboral = apply_disclaimer("Date de alta en RETA.", Mode::Laboral);
        assert!(laboral.contains("graduado social colegiado"));

        assert_eq!(apply_disclaimer("Hola", Mode::Coach), "Hola");
    }

    #[test]
    fn test_disclaimer_not_duplicated() {
        let text = "Información orientativa: presenta el 303.";
        assert_eq!(apply_disclaimer(text, Mode::Fiscal), text);
    }

    #[test]
    fn test_extract_suggestions() {
        let text = "Te propongo:\n1. Validar el problema\n2.Hablar con 5 clientes\n3. Medir\n4. Pivotar";
        assert_eq!(
            extract_suggestions(text, 3),
            vec!["Validar el problema", "Hablar con 5 clientes", "Medir"]
        );
        assert!(extract_suggestions("Sin lista. 1. no al inicio", 3).is_empty());
    }

    #[test]
    fn test_fallback_responses() {
        let landing = fallback_response(Mode::LandingCopilot);
        assert!(landing.error);
        assert_eq!(landing.provider, "fallback");
        assert_eq!(landing.suggestions[2], "Registrarse gratis");

        let cfo = fallback_response(Mode::Cfo);
        assert!(cfo.text.starts_with("Estoy en modo CFO Sintético pero"));
        assert!(cfo.text.contains("revisar la biblioteca de experimentos"));
        assert_eq!(cfo.suggestions.len(), 3);
    }

    #[test]
    fn test_format_response_extracts_from_final_text() {
        let response = format_response("1. Revisa el modelo 303", Mode::Fiscal, "openai", "gpt-4o", 3);
        assert_eq!(response.suggestions, vec!["Revisa el modelo 303"]);
        assert!(response.text.contains("orientativa"));
        assert!(!response.error);
    }
}
