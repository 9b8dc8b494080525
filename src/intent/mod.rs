pub mod llm;
pub mod orchestrator;
pub mod rules;

pub use llm::LlmIntentParser;
pub use orchestrator::{Orchestrator, ResolvedIntent};
pub use rules::RulesParser;
