//! System Prompt Assembly
//!
//! Every generation call carries a system prompt built from four sections,
//! joined by blank lines and skipped when empty:
//!
//! 1. **Identity rule**: never disclose the underlying model or vendor
//! 2. **Base prompt**: persona, interaction rules, answer structure
//! 3. **Mode prompt**: the active mode's focus
//! 4. **Context**: entrepreneur profile fields, truncated to a character budget

mod response;

pub use response::{
    FALLBACK_PROVIDER, apply_disclaimer, disclaimer_for, extract_suggestions, fallback_response,
    format_response,
};

use tracing::warn;

use crate::types::{ChatContext, Mode};

const IDENTITY_RULE: &str = "REGLA DE IDENTIDAD INQUEBRANTABLE: Eres un asistente de la plataforma. \
NUNCA reveles, menciones ni insinúes qué modelo de IA externo hay detrás de tus respuestas. \
Si te preguntan quién eres, responde con tu rol dentro de la plataforma. \
NUNCA recomiendes plataformas competidoras.";

const BASE_PROMPT: &str = "# IDENTIDAD Y ROL
Eres el Copiloto de Emprendimiento, un asistente experto en validación de modelos de negocio \
que guía a emprendedores con Lean Startup, Design Thinking y Business Model Canvas.

# FILOSOFÍA DE INTERACCIÓN
- Eres un facilitador, no un consultor tradicional
- Haces preguntas que hacen pensar
- Normalizas el fracaso como parte del aprendizaje

# RESTRICCIONES
- NUNCA des consejos legales o fiscales específicos sin disclaimer
- NUNCA prometas resultados financieros
- Máximo 3 preguntas por interacción

# FORMATO DE RESPUESTA
1. Reconocimiento empático breve
2. Contenido principal adaptado al modo
3. Pregunta orientadora o próximo paso sugerido";

const CONTEXT_HEADER: &str = "## CONTEXTO ADICIONAL";
const TRUNCATION_MARKER: &str = "\n\n[... contexto truncado por límite de tokens]";

/// Room reserved for the truncation marker
const TRUNCATION_RESERVE: usize = 50;

/// Focus of each mode
fn mode_prompt(mode: Mode) -> &'static str {
    match mode {
        Mode::Coach => {
            "## MODO COACH EMOCIONAL\n\
             Apoyo emocional ante síndrome del impostor, miedo al fracaso o bloqueo.\n\
             Escucha activa, validación emocional y preguntas abiertas. No minimices preocupaciones."
        }
        Mode::Consultor => {
            "## MODO CONSULTOR TÁCTICO\n\
             Guía práctica paso a paso con pasos numerados, ejemplos aplicables y recursos gratuitos."
        }
        Mode::Sparring => {
            "## MODO SPARRING PARTNER\n\
             Simulación y práctica: pitch a inversores, objeciones de clientes, negociaciones.\n\
             Actúa el rol del otro lado y da feedback al terminar."
        }
        Mode::Cfo => {
            "## MODO CFO SINTÉTICO\n\
             Precios, márgenes, punto de equilibrio y proyecciones. Muestra los cálculos."
        }
        Mode::Fiscal => {
            "## MODO EXPERTO TRIBUTARIO\n\
             Obligaciones fiscales del emprendedor: IVA, IRPF, modelos y plazos. Cita la norma aplicable."
        }
        Mode::Laboral => {
            "## MODO EXPERTO SEGURIDAD SOCIAL\n\
             Alta de autónomos, cuotas, tarifa plana y prestaciones. Remite a la Seguridad Social cuando proceda."
        }
        Mode::Devil => {
            "## MODO ABOGADO DEL DIABLO\n\
             Cuestiona hipótesis y supuestos con preguntas incómodas pero constructivas."
        }
        Mode::VpcDesigner => {
            "## MODO VPC DESIGNER\n\
             Diseño del Value Proposition Canvas: trabajos, frustraciones y alegrías del cliente."
        }
        Mode::CustomerDiscovery => {
            "## MODO CUSTOMER DISCOVERY COACH\n\
             Prepara entrevistas de descubrimiento sin sesgos y ayuda a interpretar lo aprendido."
        }
        Mode::PatternExpert => {
            "## MODO BUSINESS PATTERN EXPERT\n\
             Patrones de modelo de negocio aplicables: freemium, plataforma, suscripción, long tail."
        }
        Mode::PivotAdvisor => {
            "## MODO PIVOT ADVISOR\n\
             Decide entre perseverar, pivotar o explorar con evidencia de los experimentos."
        }
        Mode::LandingCopilot => {
            "## MODO LANDING COPILOT\n\
             Asistente público: orienta hacia ofertas de empleo, el programa de emprendimiento y el registro gratuito."
        }
    }
}

/// Prompt section types
#[derive(Debug, Clone)]
enum PromptSection {
    Text(String),
    Context(Vec<(String, String)>),
}

/// Builder joining non-empty sections with blank lines
#[derive(Debug, Clone, Default)]
pub struct PromptBuilder {
    sections: Vec<PromptSection>,
    max_context_chars: Option<usize>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a raw text section
    pub fn text(mut self, content: &str) -> Self {
        self.sections.push(PromptSection::Text(content.to_string()));
        self
    }

    /// Add a context item, creating the context section on first use
    pub fn context_item(mut self, label: &str, value: &str) -> Self {
        let item = (label.to_string(), value.to_string());
        match self.sections.iter_mut().find_map(|s| match s {
            PromptSection::Context(items) => Some(items),
            _ => None,
        }) {
            Some(items) => items.push(item),
            None => self.sections.push(PromptSection::Context(vec![item])),
        }
        self
    }

    /// Character budget for the context section
    pub fn max_context_chars(mut self, max: usize) -> Self {
        self.max_context_chars = Some(max);
        self
    }

    /// Build the final prompt string
    pub fn build(self) -> String {
        let max_context = self.max_context_chars;
        self.sections
            .into_iter()
            .filter_map(|section| match section {
                PromptSection::Text(content) => Some(content),
                PromptSection::Context(items) if items.is_empty() => None,
                PromptSection::Context(items) => {
                    let mut lines = vec![CONTEXT_HEADER.to_string()];
                    lines.extend(items.into_iter().map(|(label, value)| format!("- {}: {}", label, value)));
                    let block = lines.join("\n");
                    Some(match max_context {
                        Some(max) => truncate_context(&block, max),
                        None => block,
                    })
                }
            })
            .filter(|s| !s.trim().is_empty())
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Profile fields rendered into the context section, in order
fn context_items(context: &ChatContext) -> Vec<(&'static str, String)> {
    let mut items = Vec::new();
    if let Some(name) = context.get("name") {
        items.push(("Nombre", name.to_string()));
    }
    if let Some(track) = context.track() {
        items.push(("Carril", track.to_string()));
    }
    if let Some(phase) = context.phase() {
        items.push(("Fase", phase.to_string()));
    }
    if let Some(sector) = context.get("sector") {
        items.push(("Sector", sector.to_string()));
    }
    if let Some(week) = context.get("week") {
        items.push(("Semana del programa", format!("{}/12", week)));
    }
    if let Some(idea) = context.get("idea") {
        items.push(("Idea de negocio", idea.to_string()));
    }
    if let Some(blockages) = context.get("blockages") {
        items.push(("Bloqueos detectados", blockages.to_string()));
    }
    items
}

/// Build the system prompt for a mode and request context
pub fn system_prompt(mode: Mode, context: &ChatContext, max_context_chars: usize) -> String {
    context_items(context)
        .into_iter()
        .fold(
            PromptBuilder::new()
                .text(IDENTITY_RULE)
                .text(BASE_PROMPT)
                .text(mode_prompt(mode))
                .max_context_chars(max_context_chars),
            |builder, (label, value)| builder.context_item(label, &value),
        )
        .build()
}

/// Cut `text` to `max_chars` characters, marking the cut
pub fn truncate_context(text: &str, max_chars: usize) -> String {
    let len = text.chars().count();
    if len <= max_chars {
        return text.to_string();
    }
    warn!(original = len, max = max_chars, "Context prompt truncated");

    let keep = max_chars.saturating_sub(TRUNCATION_RESERVE);
    let mut truncated: String = text.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}
