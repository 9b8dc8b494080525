use super::llm::LlmIntentParser;
use super::rules::RulesParser;
use crate::adapters::LlmTransport;
use crate::errors::{AppError, ResolutionError};
use crate::models::{IntentSource, ParsedIntent, ResolvedParams};
use crate::registry::{MetricDefinition, MetricRegistry};
use crate::resolver::{self, ReferenceLookup};

/// States of one question's trip from text to a validated intent.
#[derive(Debug)]
pub enum ResolutionState {
    LlmAttempt,
    RulesAttempt,
    Resolve { intent: ParsedIntent, source: IntentSource },
    Ready(ResolvedIntent),
    Failed(Failure),
}

#[derive(Debug)]
pub enum Failure {
    Unanswerable,
    Resolution(ResolutionError),
}

impl From<Failure> for AppError {
    fn from(value: Failure) -> Self {
        match value {
            Failure::Unanswerable => AppError::Unanswerable,
            Failure::Resolution(error) => AppError::Resolution(error),
        }
    }
}

/// A metric from the registry plus parameters ready to bind.
#[derive(Debug, Clone)]
pub struct ResolvedIntent {
    pub metric: MetricDefinition,
    pub params: ResolvedParams,
    pub source: IntentSource,
}

pub struct Orchestrator<'a> {
    registry: &'a MetricRegistry,
    transport: Option<&'a dyn LlmTransport>,
    lookup: &'a dyn ReferenceLookup,
}

impl<'a> Orchestrator<'a> {
    /// `transport: None` is rules-only mode; the LLM attempt is skipped entirely.
    pub fn new(
        registry: &'a MetricRegistry,
        transport: Option<&'a dyn LlmTransport>,
        lookup: &'a dyn ReferenceLookup,
    ) -> Self {
        Self {
            registry,
            transport,
            lookup,
        }
    }

    pub fn initial_state(&self) -> ResolutionState {
        if self.transport.is_some() {
            ResolutionState::LlmAttempt
        } else {
            ResolutionState::RulesAttempt
        }
    }

    /// One transition. Terminal states are returned unchanged.
    pub fn step(&self, state: ResolutionState, question: &str) -> ResolutionState {
        match state {
            ResolutionState::LlmAttempt => {
                let Some(transport) = self.transport else {
                    return ResolutionState::RulesAttempt;
                };
                match LlmIntentParser::new(self.registry, transport).parse(question) {
                    Ok(intent) => ResolutionState::Resolve {
                        intent,
                        source: IntentSource::Llm,
                    },
                    Err(failure) => {
                        tracing::warn!(%failure, "llm intent parse failed; falling back to rules");
                        ResolutionState::RulesAttempt
                    }
                }
            }
            ResolutionState::RulesAttempt => match RulesParser::new(self.registry).parse(question) {
                Ok(intent) => ResolutionState::Resolve {
                    intent,
                    source: IntentSource::Rules,
                },
                Err(_) => ResolutionState::Failed(Failure::Unanswerable),
            },
            ResolutionState::Resolve { intent, source } => {
                let Some(metric) = self.registry.get(&intent.metric_name) else {
                    // Parsers only emit registry names; treat anything else as not understood.
                    return ResolutionState::Failed(Failure::Unanswerable);
                };
                match resolver::resolve(metric, &intent, self.lookup) {
                    Ok(params) => ResolutionState::Ready(ResolvedIntent {
                        metric: metric.clone(),
                        params,
                        source,
                    }),
                    Err(error) => ResolutionState::Failed(Failure::Resolution(error)),
                }
            }
            terminal @ (ResolutionState::Ready(_) | ResolutionState::Failed(_)) => terminal,
        }
    }

    pub fn resolve(&self, question: &str) -> Result<ResolvedIntent, AppError> {
        let mut state = self.initial_state();
        loop {
            tracing::info!(state = state.label(), "intent resolution");
            state = match self.step(state, question) {
                ResolutionState::Ready(resolved) => {
                    tracing::info!(metric = %resolved.metric.name, source = resolved.source.as_str(), "intent ready");
                    return Ok(resolved);
                }
                ResolutionState::Failed(failure) => {
                    tracing::info!(?failure, "intent resolution failed");
                    return Err(failure.into());
                }
                next => next,
            };
        }
    }
}

impl ResolutionState {
    pub fn label(&self) -> &'static str {
        match self {
            Self::LlmAttempt => "LLM_ATTEMPT",
            Self::RulesAttempt => "RULES_ATTEMPT",
            Self::Resolve { .. } => "RESOLVE",
            Self::Ready(_) => "READY",
            Self::Failed(_) => "FAILED",
        }
    }
}
