//! Conversation modes and classification results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Conversational strategy selected for a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Emotional support (impostor syndrome, blockages)
    Coach,
    /// Step-by-step tactical guidance
    Consultor,
    /// Simulation and roleplay
    Sparring,
    /// Pricing and financial calculations
    Cfo,
    /// Tax regulation
    Fiscal,
    /// Social security and self-employment
    Laboral,
    /// Hypothesis challenging
    Devil,
    /// Value proposition design
    VpcDesigner,
    /// Customer development interviews
    CustomerDiscovery,
    /// Business model patterns
    PatternExpert,
    /// Pivot and explore/exploit advice
    PivotAdvisor,
    /// Public landing-page assistant
    LandingCopilot,
}

impl Mode {
    /// All modes in trigger-table order
    pub const ALL: [Mode; 12] = [
        Mode::Coach,
        Mode::Consultor,
        Mode::Sparring,
        Mode::Cfo,
        Mode::Fiscal,
        Mode::Laboral,
        Mode::Devil,
        Mode::VpcDesigner,
        Mode::CustomerDiscovery,
        Mode::PatternExpert,
        Mode::PivotAdvisor,
        Mode::LandingCopilot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Coach => "coach",
            Mode::Consultor => "consultor",
            Mode::Sparring => "sparring",
            Mode::Cfo => "cfo",
            Mode::Fiscal => "fiscal",
            Mode::Laboral => "laboral",
            Mode::Devil => "devil",
            Mode::VpcDesigner => "vpc_designer",
            Mode::CustomerDiscovery => "customer_discovery",
            Mode::PatternExpert => "pattern_expert",
            Mode::PivotAdvisor => "pivot_advisor",
            Mode::LandingCopilot => "landing_copilot",
        }
    }

    /// Human-readable persona name
    pub fn label(&self) -> &'static str {
        match self {
            Mode::Coach => "Coach Emocional",
            Mode::Consultor => "Consultor Táctico",
            Mode::Sparring => "Sparring Partner",
            Mode::Cfo => "CFO Sintético",
            Mode::Fiscal => "Experto Tributario",
            Mode::Laboral => "Experto Seguridad Social",
            Mode::Devil => "Abogado del Diablo",
            Mode::LandingCopilot => "Asesor de Jaraba",
            Mode::VpcDesigner | Mode::CustomerDiscovery | Mode::PatternExpert | Mode::PivotAdvisor => {
                "Copiloto"
            }
        }
    }
}

impl Default for Mode {
    fn default() -> Self {
        Mode::Consultor
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_lowercase();
        Mode::ALL
            .iter()
            .find(|m| m.as_str() == needle)
            .copied()
            .ok_or_else(|| {
                format!(
                    "Unknown mode: {}. Valid values: {}",
                    s,
                    Mode::ALL
                        .iter()
                        .map(|m| m.as_str())
                        .collect::<Vec<_>>()
                        .join(", ")
                )
            })
    }
}

/// Classification confidence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Confidence::Low => write!(f, "low"),
            Confidence::Medium => write!(f, "medium"),
            Confidence::High => write!(f, "high"),
        }
    }
}

/// Result of scoring a message against the trigger vocabularies
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeDecision {
    pub mode: Mode,
    /// Score of the winning mode
    pub score: f64,
    pub confidence: Confidence,
    /// Emotion intensity in `[0, 1]`
    pub emotion_score: f64,
    /// Score of every mode in the trigger table
    pub scores: BTreeMap<Mode, f64>,
}

impl ModeDecision {
    /// Conservative decision used when nothing matched
    pub fn fallback(mode: Mode, emotion_score: f64, scores: BTreeMap<Mode, f64>) -> Self {
        let score = scores.get(&mode).copied().unwrap_or(0.0);
        Self {
            mode,
            score,
            confidence: Confidence::Low,
            emotion_score,
            scores,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_round_trip_through_str() {
        for mode in Mode::ALL {
            assert_eq!(mode.as_str().parse::<Mode>().unwrap(), mode);
        }
        assert_eq!(" Coach ".parse::<Mode>().unwrap(), Mode::Coach);
        assert!("therapist".parse::<Mode>().is_err());
    }

    #[test]
    fn test_mode_serde_uses_snake_case() {
        let json = serde_json::to_string(&Mode::LandingCopilot).unwrap();
        assert_eq!(json, "\"landing_copilot\"");
        let scores: BTreeMap<Mode, f64> = [(Mode::Coach, 25.0)].into_iter().collect();
        let json = serde_json::to_string(&scores).unwrap();
        assert_eq!(json, "{\"coach\":25.0}");
    }

    #[test]
    fn test_labels() {
        assert_eq!(Mode::Fiscal.label(), "Experto Tributario");
        assert_eq!(Mode::PivotAdvisor.label(), "Copiloto");
    }
}
