//! Task classifications: business domain, AI capability and execution shape.
//!
//! All three are closed sets. Parsing is lenient about case and separators so
//! that `LLM_Generation`, `llm-generation` and `llmgeneration` name the same
//! capability; serialization always uses the canonical snake_case form.

use core::str::FromStr;
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

fn normalize(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| *c != '_' && *c != '-' && !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

macro_rules! classification {
    (
        $(#[$meta:meta])*
        $name:ident, $field:literal {
            $($variant:ident => $wire:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $(#[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            /// Canonical snake_case form (also the storage representation).
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }

            /// Parse, reporting failures as a validation error on `field`.
            pub fn parse_field(raw: &str, field: &str) -> Result<Self, DomainError> {
                let wanted = normalize(raw);
                Self::ALL
                    .iter()
                    .copied()
                    .find(|candidate| normalize(candidate.as_str()) == wanted)
                    .ok_or_else(|| {
                        DomainError::validation(
                            field,
                            format!("unrecognised value `{}`", raw.trim()),
                        )
                    })
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = DomainError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::parse_field(s, $field)
            }
        }
    };
}

classification!(
    /// Business domain of a task. Selects the executor.
    DomainType, "domain_type" {
        DocumentProcessing => "document_processing",
        CustomerSupport => "customer_support",
        ComplianceCheck => "compliance_check",
        ContentCreation => "content_creation",
        DataAnalysis => "data_analysis",
        CodeAutomation => "code_automation",
        DecisionAutomation => "decision_automation",
        MonitoringAlert => "monitoring_alert",
    }
);

classification!(
    /// AI capability the task needs from its executor.
    CapabilityType, "capability_type" {
        LlmGeneration => "llm_generation",
        LlmClassification => "llm_classification",
        LlmReasoning => "llm_reasoning",
        VisionOcr => "vision_ocr",
        VisionObjectDetection => "vision_object_detection",
        EmbeddingSearch => "embedding_search",
        RuleEngine => "rule_engine",
        ExternalIntegration => "external_integration",
    }
);

classification!(
    /// Execution shape requested by the caller.
    ///
    /// Recorded and filterable; every shape currently runs through the same
    /// asynchronous claim-and-execute path.
    ExecutionType, "task_execution_type" {
        Sync => "sync",
        Async => "async",
        Saga => "saga",
        HumanInLoop => "human_in_loop",
        Batch => "batch",
        EventDriven => "event_driven",
    }
);
