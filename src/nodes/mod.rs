//! Stage nodes: one model call each, validated input in, normalized output out.
//!
//! Nodes hold no state. Anything they learn is returned to the caller, which
//! decides what to write into the report state.

mod format;
mod plan;
mod search;
mod summary;

pub use format::{format_report, render_report, FormatRequest, FormattedSection};
pub use plan::{clarify_topic, fallback_plan, plan_report, PlanRequest, MAX_PARAGRAPHS};
pub use search::{first_search, reflect, ReflectionRequest, SearchQuery, SearchRequest};
pub use summary::{first_summary, reflection_summary, SummaryRequest};

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::llm::{InvokeOptions, ModelProvider, ProviderError};
use crate::query::{ForecastWindow, Vocabulary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Plan,
    FirstSearch,
    WebSearch,
    FirstSummary,
    Reflection,
    ReflectionSummary,
    Formatting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Plan => "plan",
            Stage::FirstSearch => "first search",
            Stage::WebSearch => "web search",
            Stage::FirstSummary => "first summary",
            Stage::Reflection => "reflection",
            Stage::ReflectionSummary => "reflection summary",
            Stage::Formatting => "report formatting",
        };
        f.write_str(name)
    }
}

/// Result of a node whose model output may have been unusable.
///
/// `Fallback` still carries a valid value; `raw` is the model text that could
/// not be used, kept for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput<T> {
    Parsed(T),
    Fallback { value: T, raw: String },
}

impl<T> StageOutput<T> {
    pub fn value(&self) -> &T {
        match self {
            StageOutput::Parsed(value) | StageOutput::Fallback { value, .. } => value,
        }
    }

    pub fn into_value(self) -> T {
        match self {
            StageOutput::Parsed(value) | StageOutput::Fallback { value, .. } => value,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, StageOutput::Fallback { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("{stage}: required field `{field}` is missing or blank")]
    MissingField { stage: Stage, field: &'static str },
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

pub(crate) fn require(stage: Stage, field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::MissingField { stage, field });
    }
    Ok(())
}

/// Everything a node needs besides its request.
#[derive(Clone)]
pub struct NodeContext {
    provider: Arc<dyn ModelProvider>,
    options: InvokeOptions,
    vocabulary: Arc<Vocabulary>,
    window: Option<ForecastWindow>,
}

impl NodeContext {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self {
            provider,
            options: InvokeOptions::default(),
            vocabulary: Arc::new(Vocabulary::default()),
            window: None,
        }
    }

    pub fn with_options(mut self, options: InvokeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_vocabulary(mut self, vocabulary: Arc<Vocabulary>) -> Self {
        self.vocabulary = vocabulary;
        self
    }

    pub fn with_window(mut self, window: Option<ForecastWindow>) -> Self {
        self.window = window;
        self
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    pub fn window(&self) -> Option<&ForecastWindow> {
        self.window.as_ref()
    }

    pub(crate) async fn call(&self, stage: Stage, system_prompt: &str, user_prompt: &str) -> Result<String, ProviderError> {
        debug!(%stage, provider = self.provider.name(), chars = user_prompt.chars().count(), "invoking model");
        self.provider.invoke(system_prompt, user_prompt, &self.options).await
    }
}
