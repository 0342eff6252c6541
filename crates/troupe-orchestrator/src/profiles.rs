use crate::types::{AgentType, CapabilitySet};

/// Static defaults for one agent type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgentProfile {
    pub agent_type: AgentType,
    pub capabilities: &'static [&'static str],
    pub max_concurrency: u32,
    /// Static weight folded into the candidate score.
    pub priority_weight: f64,
}

impl AgentProfile {
    pub fn capability_set(&self) -> CapabilitySet {
        self.capabilities.iter().map(|c| (*c).to_string()).collect()
    }

    /// Whether this profile alone covers every tag in `required`.
    pub fn covers(&self, required: &CapabilitySet) -> bool {
        required
            .iter()
            .all(|tag| self.capabilities.contains(&tag.as_str()))
    }
}

/// The built-in profiles, one per agent type.
pub fn default_profiles() -> Vec<AgentProfile> {
    AgentType::ALL.iter().map(|t| profile_for(*t)).collect()
}

pub fn profile_for(agent_type: AgentType) -> AgentProfile {
    match agent_type {
        AgentType::Research => AgentProfile {
            agent_type,
            capabilities: &[
                "data_analysis",
                "web_research",
                "fact_checking",
                "literature_review",
                "market_research",
            ],
            max_concurrency: 3,
            priority_weight: 1.0,
        },
        AgentType::Code => AgentProfile {
            agent_type,
            capabilities: &[
                "code_generation",
                "debugging",
                "code_review",
                "architecture_design",
                "testing",
            ],
            max_concurrency: 2,
            priority_weight: 1.2,
        },
        AgentType::Creative => AgentProfile {
            agent_type,
            capabilities: &[
                "content_creation",
                "creative_writing",
                "design_thinking",
                "brainstorming",
                "storytelling",
            ],
            max_concurrency: 4,
            priority_weight: 0.8,
        },
        AgentType::Analysis => AgentProfile {
            agent_type,
            capabilities: &[
                "statistical_analysis",
                "data_processing",
                "pattern_recognition",
                "forecasting",
                "optimization",
            ],
            max_concurrency: 3,
            priority_weight: 1.1,
        },
        AgentType::Communication => AgentProfile {
            agent_type,
            capabilities: &[
                "text_summarization",
                "translation",
                "sentiment_analysis",
                "communication_drafting",
                "language_processing",
            ],
            max_concurrency: 5,
            priority_weight: 0.9,
        },
    }
}

/// Union of every profile's capabilities.
pub fn profile_capabilities() -> CapabilitySet {
    default_profiles()
        .iter()
        .flat_map(|p| p.capabilities.iter().map(|c| (*c).to_string()))
        .collect()
}

/// Whether any single profile covers the whole set.
pub fn any_profile_covers(required: &CapabilitySet) -> bool {
    default_profiles().iter().any(|p| p.covers(required))
}

/// Default capabilities for a task category label such as `analysis_task`.
pub fn category_capabilities(task_type: &str) -> Option<&'static [&'static str]> {
    match task_type {
        "research_task" => Some(&["data_analysis", "web_research", "fact_checking"]),
        "development_task" => Some(&["code_generation", "debugging", "testing"]),
        "creative_task" => Some(&["content_creation", "creative_writing", "design_thinking"]),
        "analysis_task" => Some(&[
            "statistical_analysis",
            "data_processing",
            "pattern_recognition",
        ]),
        "communication_task" => Some(&[
            "text_summarization",
            "translation",
            "communication_drafting",
        ]),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profiles() {
        let profiles = default_profiles();
        assert_eq!(profiles.len(), 5);
        for p in &profiles {
            assert_eq!(p.capabilities.len(), 5);
            assert!(p.max_concurrency > 0);
        }
    }

    #[test]
    fn test_code_profile_limits() {
        let code = profile_for(AgentType::Code);
        assert_eq!(code.max_concurrency, 2);
        assert!((code.priority_weight - 1.2).abs() < f64::EPSILON);
        assert!(code.capabilities.contains(&"debugging"));
    }

    #[test]
    fn test_profile_covers() {
        let analysis = profile_for(AgentType::Analysis);
        let narrow: CapabilitySet = ["forecasting".to_string()].into_iter().collect();
        let mixed: CapabilitySet = ["forecasting".to_string(), "translation".to_string()]
            .into_iter()
            .collect();
        assert!(analysis.covers(&narrow));
        assert!(!analysis.covers(&mixed));
        assert!(any_profile_covers(&narrow));
        assert!(!any_profile_covers(&mixed));
    }

    #[test]
    fn test_profile_capabilities_union() {
        let all = profile_capabilities();
        assert_eq!(all.len(), 25);
        assert!(all.contains("storytelling"));
    }

    #[test]
    fn test_category_capabilities() {
        assert_eq!(
            category_capabilities("development_task"),
            Some(&["code_generation", "debugging", "testing"][..])
        );
        assert!(category_capabilities("complex_task").is_none());
    }
}
