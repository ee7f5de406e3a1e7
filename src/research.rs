use chrono::{Local, NaiveDate, Utc};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::Config;
use crate::llm::{InvokeOptions, ModelProvider, ProviderError};
use crate::nodes::{
    self, FormatRequest, FormattedSection, NodeContext, NodeError, PlanRequest, ReflectionRequest, SearchRequest, Stage,
    SummaryRequest, ValidationError,
};
use crate::query::{ForecastWindow, TimeHorizon, Vocabulary};
use crate::report::ReportStore;
use crate::search::{truncate_chars, SearchError, SearchProvider};
use crate::state::{ReportState, SearchRecord, StateError};

#[derive(Debug, Clone, PartialEq)]
pub enum ResearchProgress {
    Started,
    Planning,
    Planned(usize), // number of paragraphs
    ParagraphStarted { index: usize, total: usize, title: String },
    Searching { index: usize, query: String },
    Summarizing { index: usize },
    Reflecting { index: usize, round: u32, max: u32 },
    ParagraphCompleted { index: usize },
    Formatting,
    Completed,
}

/// Where in the run a failure happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Report,
    Paragraph { index: usize, title: String },
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Report => f.write_str("report"),
            Location::Paragraph { index, title } => write!(f, "paragraph {} ('{}')", index + 1, title),
        }
    }
}

#[derive(Debug, Error)]
pub enum ResearchError {
    #[error("{stage} rejected its input at {location}: {source}")]
    Validation {
        stage: Stage,
        location: Location,
        source: ValidationError,
    },

    #[error("{stage} model call failed at {location}: {source}")]
    Model {
        stage: Stage,
        location: Location,
        source: ProviderError,
    },

    #[error("web search failed at {location}: {source}")]
    Search { location: Location, source: SearchError },

    #[error("report has no plan yet")]
    NotPlanned,

    #[error("no paragraph at index {0}")]
    UnknownParagraph(usize),

    #[error(transparent)]
    State(#[from] StateError),
}

impl ResearchError {
    fn from_node(stage: Stage, location: Location, err: NodeError) -> Self {
        match err {
            NodeError::Validation(source) => ResearchError::Validation { stage, location, source },
            NodeError::Provider(source) => ResearchError::Model { stage, location, source },
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            ResearchError::Validation { stage, .. } | ResearchError::Model { stage, .. } => Some(*stage),
            ResearchError::Search { .. } => Some(Stage::WebSearch),
            _ => None,
        }
    }

    pub fn location(&self) -> Option<&Location> {
        match self {
            ResearchError::Validation { location, .. }
            | ResearchError::Model { location, .. }
            | ResearchError::Search { location, .. } => Some(location),
            _ => None,
        }
    }
}

/// Knobs for one research run.
#[derive(Debug, Clone)]
pub struct ResearchSettings {
    pub max_reflections: u32,
    pub max_results: usize,
    pub max_content_length: usize,
    pub time_horizon: Option<String>,
    pub analysis_angles: Vec<String>,
}

impl Default for ResearchSettings {
    fn default() -> Self {
        Self {
            max_reflections: 2,
            max_results: 3,
            max_content_length: 20000,
            time_horizon: None,
            analysis_angles: Vec::new(),
        }
    }
}

impl From<&Config> for ResearchSettings {
    fn from(config: &Config) -> Self {
        Self {
            max_reflections: config.agent.max_reflections,
            max_results: config.search.max_results,
            max_content_length: config.search.max_content_length,
            time_horizon: config.agent.time_horizon.clone(),
            analysis_angles: config.agent.analysis_angles.clone(),
        }
    }
}

/// Drives plan, per-paragraph search/summary/reflection and formatting.
///
/// Paragraphs run one after another, and each paragraph's rounds run in
/// order because every round reads the summary the previous one wrote.
pub struct ResearchOrchestrator {
    model: Arc<dyn ModelProvider>,
    search: Arc<dyn SearchProvider>,
    settings: ResearchSettings,
    vocabulary: Arc<Vocabulary>,
    options: InvokeOptions,
    today: NaiveDate,
    store: Option<ReportStore>,
    progress_tx: Option<mpsc::UnboundedSender<ResearchProgress>>,
}

impl ResearchOrchestrator {
    pub fn new(model: Arc<dyn ModelProvider>, search: Arc<dyn SearchProvider>, settings: ResearchSettings) -> Self {
        Self {
            model,
            search,
            settings,
            vocabulary: Arc::new(Vocabulary::default()),
            options: InvokeOptions::default(),
            today: Local::now().date_naive(),
            store: None,
            progress_tx: None,
        }
    }

    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    /// Checkpoint the state into `store` after planning and after each paragraph.
    pub fn with_store(mut self, store: ReportStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_vocabulary(mut self, vocabulary: Vocabulary) -> Self {
        self.vocabulary = Arc::new(vocabulary);
        self
    }

    pub fn with_invoke_options(mut self, options: InvokeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn set_progress_channel(&mut self, tx: mpsc::UnboundedSender<ResearchProgress>) {
        self.progress_tx = Some(tx);
    }

    fn send_progress(&self, progress: ResearchProgress) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(progress);
        }
    }

    /// The window `state` is researched under, fixed when it was planned.
    pub fn forecast_window(&self, state: &ReportState) -> Option<ForecastWindow> {
        state
            .time_horizon()
            .map(|h| ForecastWindow::new(TimeHorizon::parse(h), self.today))
    }

    fn context(&self, state: &ReportState) -> NodeContext {
        NodeContext::new(self.model.clone())
            .with_options(self.options)
            .with_vocabulary(self.vocabulary.clone())
            .with_window(self.forecast_window(state))
    }

    fn checkpoint(&self, state: &ReportState) {
        if let Some(store) = &self.store {
            match store.save_state(state) {
                Ok(path) => info!(path = %path.display(), "state checkpoint saved"),
                Err(e) => warn!("failed to save state checkpoint: {}", e),
            }
        }
    }

    /// Run the whole pipeline on `state` and return the Markdown report.
    ///
    /// A state that is already planned keeps its plan, and finished
    /// paragraphs are not researched again. On error, `state` holds every
    /// paragraph and search record completed before the failure.
    pub async fn research(&self, state: &mut ReportState) -> Result<String, ResearchError> {
        self.send_progress(ResearchProgress::Started);

        if !state.is_planned() {
            self.plan(state).await?;
        }

        for index in 0..state.paragraphs().len() {
            self.run_paragraph(state, index).await?;
        }

        let report = self.format_report(state).await?;
        self.send_progress(ResearchProgress::Completed);
        Ok(report)
    }

    /// Continue a checkpointed run.
    pub async fn resume(&self, state: &mut ReportState) -> Result<String, ResearchError> {
        if !state.is_planned() {
            return Err(ResearchError::NotPlanned);
        }
        let progress = state.progress();
        info!(
            completed = progress.completed_paragraphs,
            total = progress.total_paragraphs,
            "resuming research"
        );
        if self.settings.time_horizon.as_deref() != state.time_horizon() {
            warn!(
                stored = ?state.time_horizon(),
                configured = ?self.settings.time_horizon,
                "keeping the time horizon the report was planned with"
            );
        }
        self.research(state).await
    }

    pub async fn plan(&self, state: &mut ReportState) -> Result<(), ResearchError> {
        if state.is_planned() {
            return Err(StateError::AlreadyPlanned(state.paragraphs().len()).into());
        }
        self.send_progress(ResearchProgress::Planning);

        state.set_scope(self.settings.time_horizon.clone(), self.settings.analysis_angles.clone());
        let request = PlanRequest {
            topic: state.query().to_string(),
            analysis_angles: state.analysis_angles().to_vec(),
        };
        let plan = nodes::plan_report(&self.context(state), &request)
            .await
            .map_err(|e| ResearchError::from_node(Stage::Plan, Location::Report, e))?;

        state.apply_plan(plan.value(), self.settings.max_reflections)?;
        if state.report_title().is_empty() {
            let title = format!("关于'{}'的深度研究报告", state.query());
            state.set_report_title(title);
        }

        self.send_progress(ResearchProgress::Planned(state.paragraphs().len()));
        self.checkpoint(state);
        Ok(())
    }

    /// Take one paragraph from wherever it stands to completed.
    pub async fn run_paragraph(&self, state: &mut ReportState, index: usize) -> Result<(), ResearchError> {
        let total = state.paragraphs().len();
        let ctx = self.context(state);
        let paragraph = state.paragraph_mut(index).ok_or(ResearchError::UnknownParagraph(index))?;
        if paragraph.research().is_completed() {
            return Ok(());
        }

        let title = paragraph.title().to_string();
        let content = paragraph.content().to_string();
        let location = Location::Paragraph {
            index,
            title: title.clone(),
        };
        info!(index, %title, "researching paragraph");
        self.send_progress(ResearchProgress::ParagraphStarted {
            index,
            total,
            title: title.clone(),
        });

        if !paragraph.research().has_summary() {
            let query = nodes::first_search(
                &ctx,
                &SearchRequest {
                    title: title.clone(),
                    content: content.clone(),
                },
            )
            .await
            .map_err(|e| ResearchError::from_node(Stage::FirstSearch, location.clone(), e))?
            .into_value();

            let excerpts = self.search_and_record(index, &query.search_query, &location, state).await?;

            self.send_progress(ResearchProgress::Summarizing { index });
            let summary = nodes::first_summary(
                &ctx,
                &SummaryRequest {
                    title: title.clone(),
                    content: content.clone(),
                    search_query: query.search_query,
                    search_results: excerpts,
                    ..SummaryRequest::default()
                },
            )
            .await
            .map_err(|e| ResearchError::from_node(Stage::FirstSummary, location.clone(), e))?
            .into_value();

            research_of(state, index)?.set_first_summary(summary);
        }

        loop {
            let research = research_of(state, index)?;
            let Some(round) = research.next_reflection() else {
                break;
            };
            let latest_summary = research.latest_summary().to_string();
            let max = research.max_reflections();

            info!(index, round = round.index(), max, "reflecting");
            self.send_progress(ResearchProgress::Reflecting {
                index,
                round: round.index(),
                max,
            });

            let query = nodes::reflect(
                &ctx,
                &ReflectionRequest {
                    title: title.clone(),
                    content: content.clone(),
                    latest_summary: latest_summary.clone(),
                    round: round.index(),
                },
            )
            .await
            .map_err(|e| ResearchError::from_node(Stage::Reflection, location.clone(), e))?
            .into_value();

            let excerpts = self.search_and_record(index, &query.search_query, &location, state).await?;

            self.send_progress(ResearchProgress::Summarizing { index });
            let summary = nodes::reflection_summary(
                &ctx,
                &SummaryRequest {
                    title: title.clone(),
                    content: content.clone(),
                    search_query: query.search_query,
                    search_results: excerpts,
                    latest_summary,
                    critical: round.is_critical(),
                },
            )
            .await
            .map_err(|e| ResearchError::from_node(Stage::ReflectionSummary, location.clone(), e))?
            .into_value();

            research_of(state, index)?.finish_reflection(round, summary);
        }

        research_of(state, index)?.complete();
        info!(index, %title, "paragraph completed");
        self.send_progress(ResearchProgress::ParagraphCompleted { index });
        self.checkpoint(state);
        Ok(())
    }

    /// Run a search and append its results to the paragraph's history right
    /// away, so they survive a failure later in the round.
    async fn search_and_record(
        &self,
        index: usize,
        query: &str,
        location: &Location,
        state: &mut ReportState,
    ) -> Result<Vec<String>, ResearchError> {
        self.send_progress(ResearchProgress::Searching {
            index,
            query: query.to_string(),
        });

        let hits = self
            .search
            .search(query, self.settings.max_results)
            .await
            .map_err(|source| ResearchError::Search {
                location: location.clone(),
                source,
            })?;
        info!(index, query, results = hits.len(), "search finished");

        let now = Utc::now();
        let records: Vec<SearchRecord> = hits
            .into_iter()
            .map(|mut hit| {
                hit.content = truncate_chars(&hit.content, self.settings.max_content_length).to_string();
                SearchRecord::from_hit(query, hit, now)
            })
            .collect();
        let excerpts = records.iter().map(|r| r.content.clone()).collect();

        research_of(state, index)?.record_searches(records);
        Ok(excerpts)
    }

    /// Assemble the Markdown report and store it on the state.
    pub async fn format_report(&self, state: &mut ReportState) -> Result<String, ResearchError> {
        if !state.is_planned() {
            return Err(ResearchError::NotPlanned);
        }
        self.send_progress(ResearchProgress::Formatting);

        let request = FormatRequest {
            report_title: state.report_title().to_string(),
            sections: state
                .paragraphs()
                .iter()
                .map(|p| FormattedSection {
                    title: p.title().to_string(),
                    paragraph_latest_state: p.research().latest_summary().to_string(),
                })
                .collect(),
        };

        let report = nodes::format_report(&self.context(state), &request)
            .await
            .map_err(|e| ResearchError::from_node(Stage::Formatting, Location::Report, e))?
            .into_value();

        state.set_final_report(report.clone());
        self.checkpoint(state);
        Ok(report)
    }
}

fn research_of(state: &mut ReportState, index: usize) -> Result<&mut crate::state::ParagraphResearch, ResearchError> {
    state
        .paragraph_mut(index)
        .map(|p| p.research_mut())
        .ok_or(ResearchError::UnknownParagraph(index))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_names_stage_and_paragraph() {
        let err = ResearchError::Model {
            stage: Stage::Reflection,
            location: Location::Paragraph {
                index: 1,
                title: "市场规模".to_string(),
            },
            source: ProviderError::RateLimited {
                provider: "deepseek".to_string(),
                detail: "429".to_string(),
            },
        };
        let text = err.to_string();
        assert!(text.contains("reflection"));
        assert!(text.contains("paragraph 2 ('市场规模')"));
        assert!(text.contains("rate limited"));
        assert_eq!(err.stage(), Some(Stage::Reflection));
    }

    #[test]
    fn test_window_follows_the_report_not_the_settings() {
        let settings = ResearchSettings {
            time_horizon: Some("3个月".to_string()),
            ..ResearchSettings::default()
        };
        let model = crate::nodes::testing::ScriptedModel::new(&[]);
        let orchestrator = ResearchOrchestrator::new(model, Arc::new(NoSearch), settings)
            .with_today(NaiveDate::from_ymd_opt(2025, 3, 1).unwrap());

        let mut state = ReportState::new("电动汽车市场");
        assert!(orchestrator.forecast_window(&state).is_none());

        state.set_scope(Some("1年".to_string()), Vec::new());
        assert_eq!(orchestrator.forecast_window(&state).map(|w| w.target_year()), Some(2026));
    }

    struct NoSearch;

    #[async_trait::async_trait]
    impl SearchProvider for NoSearch {
        async fn search(&self, _query: &str, _max_results: usize) -> Result<Vec<crate::search::SearchHit>, SearchError> {
            Ok(Vec::new())
        }
    }
}
