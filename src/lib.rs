//! Iterative deep-research agent: plan a report, then search, summarize and
//! reflect paragraph by paragraph before assembling Markdown.

pub mod config;
pub mod extract;
pub mod history;
pub mod llm;
pub mod nodes;
pub mod prompts;
pub mod query;
pub mod report;
pub mod research;
pub mod search;
pub mod state;

pub use research::{Location, ResearchError, ResearchOrchestrator, ResearchProgress, ResearchSettings};
pub use state::{Progress, ReportState};
