//! Research state: the report, its paragraphs and each paragraph's search
//! and reflection history.
//!
//! State flows strictly downward. [`ReportState`] owns its paragraphs, each
//! [`Paragraph`] owns its [`ParagraphResearch`], and nothing points back up.
//! Only the research part of a paragraph is mutable once planning is done.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::search::SearchHit;

/// One completed web search result. Never changed after it is recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRecord {
    pub query: String,
    pub url: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub score: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl SearchRecord {
    pub fn from_hit(query: &str, hit: SearchHit, timestamp: DateTime<Utc>) -> Self {
        Self {
            query: query.to_string(),
            url: hit.url,
            title: hit.title,
            content: hit.content,
            score: hit.score,
            timestamp,
        }
    }
}

/// Permission to run reflection round `index` on a paragraph.
///
/// Only [`ParagraphResearch::next_reflection`] hands these out, and only while
/// the paragraph is below its reflection bound, so finishing a round can never
/// push the counter past the bound.
#[derive(Debug, PartialEq, Eq)]
pub struct ReflectionRound {
    index: u32,
}

impl ReflectionRound {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Round 0 looks for omissions; later rounds argue with the draft.
    pub fn is_critical(&self) -> bool {
        self.index >= 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParagraphPhase {
    /// No summary yet; the next step is the first search.
    Planned,
    /// Summarized, with `rounds` reflection rounds done so far.
    Summarized { rounds: u32 },
    Completed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParagraphResearch {
    #[serde(default)]
    search_history: Vec<SearchRecord>,
    #[serde(default)]
    latest_summary: String,
    #[serde(default)]
    reflection_iteration: u32,
    #[serde(default)]
    max_reflections: u32,
    #[serde(default, rename = "completed")]
    is_completed: bool,
}

impl ParagraphResearch {
    pub fn new(max_reflections: u32) -> Self {
        Self {
            max_reflections,
            ..Self::default()
        }
    }

    pub fn search_history(&self) -> &[SearchRecord] {
        &self.search_history
    }

    pub fn latest_summary(&self) -> &str {
        &self.latest_summary
    }

    pub fn has_summary(&self) -> bool {
        !self.latest_summary.trim().is_empty()
    }

    pub fn reflection_iteration(&self) -> u32 {
        self.reflection_iteration
    }

    pub fn max_reflections(&self) -> u32 {
        self.max_reflections
    }

    pub fn is_completed(&self) -> bool {
        self.is_completed
    }

    pub fn phase(&self) -> ParagraphPhase {
        if self.is_completed {
            ParagraphPhase::Completed
        } else if self.has_summary() {
            ParagraphPhase::Summarized {
                rounds: self.reflection_iteration,
            }
        } else {
            ParagraphPhase::Planned
        }
    }

    /// Append in call order. History is append-only.
    pub fn record_searches(&mut self, records: impl IntoIterator<Item = SearchRecord>) {
        if self.is_completed {
            return;
        }
        self.search_history.extend(records);
    }

    /// Store the first-pass summary. Ignored once reflection has started or
    /// when the text is empty.
    pub fn set_first_summary(&mut self, summary: String) {
        if self.is_completed || self.reflection_iteration > 0 || summary.trim().is_empty() {
            return;
        }
        self.latest_summary = summary;
    }

    pub fn next_reflection(&self) -> Option<ReflectionRound> {
        if self.is_completed || !self.has_summary() || self.reflection_iteration >= self.max_reflections {
            return None;
        }
        Some(ReflectionRound {
            index: self.reflection_iteration,
        })
    }

    /// Close a reflection round with its updated summary. An empty update
    /// keeps the previous summary.
    pub fn finish_reflection(&mut self, round: ReflectionRound, summary: String) {
        if self.is_completed || round.index != self.reflection_iteration {
            return;
        }
        if !summary.trim().is_empty() {
            self.latest_summary = summary;
        }
        self.reflection_iteration = round.index + 1;
    }

    /// Mark the paragraph done. Only succeeds once every reflection round has
    /// run; returns whether the paragraph is now completed.
    pub fn complete(&mut self) -> bool {
        if self.has_summary() && self.reflection_iteration == self.max_reflections {
            self.is_completed = true;
        }
        self.is_completed
    }

    fn check(&self) -> Result<(), String> {
        if self.reflection_iteration > self.max_reflections {
            return Err(format!(
                "reflection_iteration {} exceeds max_reflections {}",
                self.reflection_iteration, self.max_reflections
            ));
        }
        if self.reflection_iteration > 0 && !self.has_summary() {
            return Err("reflection rounds recorded without a summary".to_string());
        }
        if self.is_completed && (self.reflection_iteration != self.max_reflections || !self.has_summary()) {
            return Err("completed before its reflection bound was reached".to_string());
        }
        Ok(())
    }
}

/// A planned section of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Paragraph {
    title: String,
    #[serde(default)]
    content: String,
    #[serde(flatten)]
    research: ParagraphResearch,
}

impl Paragraph {
    fn new(title: String, content: String, max_reflections: u32) -> Self {
        Self {
            title,
            content,
            research: ParagraphResearch::new(max_reflections),
        }
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn research(&self) -> &ParagraphResearch {
        &self.research
    }

    pub fn research_mut(&mut self) -> &mut ParagraphResearch {
        &mut self.research
    }
}

/// A `{title, content}` pair produced by planning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedParagraph {
    pub title: String,
    pub content: String,
}

/// Snapshot for front ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub total_paragraphs: usize,
    pub completed_paragraphs: usize,
    pub progress_percentage: f64,
    pub is_completed: bool,
}

#[derive(Debug, Error)]
pub enum StateError {
    #[error("report is already planned with {0} paragraphs")]
    AlreadyPlanned(usize),

    #[error("a plan needs at least one paragraph")]
    EmptyPlan,

    #[error("invalid state document: {0}")]
    Document(#[from] serde_json::Error),

    #[error("paragraph {index} in state document is inconsistent: {reason}")]
    Inconsistent { index: usize, reason: String },
}

/// The whole research session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportState {
    query: String,
    #[serde(default)]
    report_title: String,
    #[serde(default)]
    paragraphs: Vec<Paragraph>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    final_report: Option<String>,
    /// Forecast window the plan was made for; resumed runs keep it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    time_horizon: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    analysis_angles: Vec<String>,
    created_at: DateTime<Utc>,
}

impl ReportState {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            report_title: String::new(),
            paragraphs: Vec::new(),
            final_report: None,
            time_horizon: None,
            analysis_angles: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn report_title(&self) -> &str {
        &self.report_title
    }

    pub fn set_report_title(&mut self, title: impl Into<String>) {
        self.report_title = title.into();
    }

    pub fn time_horizon(&self) -> Option<&str> {
        self.time_horizon.as_deref()
    }

    pub fn analysis_angles(&self) -> &[String] {
        &self.analysis_angles
    }

    /// Record the horizon and angles the report is researched under.
    pub fn set_scope(&mut self, time_horizon: Option<String>, analysis_angles: Vec<String>) {
        self.time_horizon = time_horizon.filter(|h| !h.trim().is_empty());
        self.analysis_angles = analysis_angles;
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn paragraphs(&self) -> &[Paragraph] {
        &self.paragraphs
    }

    pub fn paragraph_mut(&mut self, index: usize) -> Option<&mut Paragraph> {
        self.paragraphs.get_mut(index)
    }

    pub fn is_planned(&self) -> bool {
        !self.paragraphs.is_empty()
    }

    /// Populate paragraphs from a plan. Happens once per report.
    pub fn apply_plan(&mut self, plan: &[PlannedParagraph], max_reflections: u32) -> Result<(), StateError> {
        if self.is_planned() {
            return Err(StateError::AlreadyPlanned(self.paragraphs.len()));
        }
        if plan.is_empty() {
            return Err(StateError::EmptyPlan);
        }
        self.paragraphs = plan
            .iter()
            .map(|p| Paragraph::new(p.title.clone(), p.content.clone(), max_reflections))
            .collect();
        Ok(())
    }

    pub fn final_report(&self) -> Option<&str> {
        self.final_report.as_deref()
    }

    pub fn set_final_report(&mut self, markdown: String) {
        self.final_report = Some(markdown);
    }

    pub fn completed_paragraphs(&self) -> usize {
        self.paragraphs
            .iter()
            .filter(|p| p.research.is_completed())
            .count()
    }

    pub fn is_completed(&self) -> bool {
        self.is_planned() && self.completed_paragraphs() == self.paragraphs.len()
    }

    pub fn progress(&self) -> Progress {
        let total = self.paragraphs.len();
        let completed = self.completed_paragraphs();
        let percentage = if total == 0 {
            0.0
        } else {
            (completed as f64 / total as f64 * 1000.0).round() / 10.0
        };
        Progress {
            total_paragraphs: total,
            completed_paragraphs: completed,
            progress_percentage: percentage,
            is_completed: self.is_completed(),
        }
    }

    pub fn to_json(&self) -> Result<String, StateError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Parse a checkpoint, rejecting documents whose counters break the
    /// paragraph invariants.
    pub fn from_json(document: &str) -> Result<Self, StateError> {
        let state: Self = serde_json::from_str(document)?;
        for (index, paragraph) in state.paragraphs.iter().enumerate() {
            if paragraph.title.trim().is_empty() {
                return Err(StateError::Inconsistent {
                    index,
                    reason: "empty title".to_string(),
                });
            }
            paragraph
                .research
                .check()
                .map_err(|reason| StateError::Inconsistent { index, reason })?;
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn planned(titles: &[&str], max_reflections: u32) -> ReportState {
        let mut state = ReportState::new("电动汽车市场");
        let plan: Vec<PlannedParagraph> = titles
            .iter()
            .map(|t| PlannedParagraph {
                title: t.to_string(),
                content: format!("{t} 内容"),
            })
            .collect();
        state.apply_plan(&plan, max_reflections).unwrap();
        state
    }

    fn record(query: &str, url: &str) -> SearchRecord {
        SearchRecord::from_hit(
            query,
            SearchHit {
                url: url.to_string(),
                title: "t".to_string(),
                content: "c".to_string(),
                score: Some(0.5),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_reflection_rounds_stop_at_bound() {
        let mut research = ParagraphResearch::new(2);
        assert!(research.next_reflection().is_none(), "no reflection before a summary");

        research.set_first_summary("first".to_string());
        let round = research.next_reflection().unwrap();
        assert_eq!(round.index(), 0);
        assert!(!round.is_critical());
        research.finish_reflection(round, "second".to_string());

        let round = research.next_reflection().unwrap();
        assert!(round.is_critical());
        research.finish_reflection(round, "third".to_string());

        assert!(research.next_reflection().is_none());
        assert_eq!(research.reflection_iteration(), 2);
        assert!(research.complete());
        assert_eq!(research.phase(), ParagraphPhase::Completed);
    }

    #[test]
    fn test_stale_round_token_is_ignored() {
        let mut research = ParagraphResearch::new(1);
        research.set_first_summary("first".to_string());
        let a = research.next_reflection().unwrap();
        let b = research.next_reflection().unwrap();
        research.finish_reflection(a, "second".to_string());
        research.finish_reflection(b, "ignored".to_string());
        assert_eq!(research.reflection_iteration(), 1);
        assert_eq!(research.latest_summary(), "second");
    }

    #[test]
    fn test_complete_requires_bound() {
        let mut research = ParagraphResearch::new(1);
        research.set_first_summary("first".to_string());
        assert!(!research.complete());
        assert_eq!(research.phase(), ParagraphPhase::Summarized { rounds: 0 });

        let mut zero = ParagraphResearch::new(0);
        assert!(!zero.complete(), "needs a summary");
        zero.set_first_summary("only".to_string());
        assert!(zero.complete());
    }

    #[test]
    fn test_history_is_append_only_in_order() {
        let mut research = ParagraphResearch::new(0);
        research.record_searches(vec![record("q1", "a"), record("q1", "b")]);
        research.record_searches(vec![record("q2", "c")]);
        let urls: Vec<&str> = research.search_history().iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_plan_applies_once() {
        let mut state = planned(&["概述"], 2);
        let again = state.apply_plan(
            &[PlannedParagraph {
                title: "x".to_string(),
                content: String::new(),
            }],
            2,
        );
        assert!(matches!(again, Err(StateError::AlreadyPlanned(1))));
        assert!(matches!(
            ReportState::new("q").apply_plan(&[], 2),
            Err(StateError::EmptyPlan)
        ));
    }

    #[test]
    fn test_progress_accounting() {
        let mut state = planned(&["a", "b", "c"], 0);
        assert_eq!(state.progress().progress_percentage, 0.0);

        let research = state.paragraph_mut(0).unwrap().research_mut();
        research.set_first_summary("s".to_string());
        research.complete();

        let progress = state.progress();
        assert_eq!(progress.total_paragraphs, 3);
        assert_eq!(progress.completed_paragraphs, 1);
        assert_eq!(progress.progress_percentage, 33.3);
        assert!(!progress.is_completed);

        assert!(!ReportState::new("q").progress().is_completed);
    }

    #[test]
    fn test_document_roundtrip_keeps_history() {
        let mut state = planned(&["概述", "详细分析"], 1);
        state.set_report_title("关于'电动汽车市场'的深度研究报告");
        state.set_scope(Some("1年".to_string()), vec!["技术".to_string()]);
        let research = state.paragraph_mut(0).unwrap().research_mut();
        research.record_searches(vec![record("电动汽车 2026年", "https://a.example")]);
        research.set_first_summary("summary".to_string());

        let json = state.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        let first = &value["paragraphs"][0];
        assert_eq!(first["title"], "概述");
        assert_eq!(first["latest_summary"], "summary");
        assert_eq!(first["reflection_iteration"], 0);
        assert_eq!(first["completed"], false);
        assert_eq!(first["search_history"][0]["query"], "电动汽车 2026年");
        assert_eq!(first["search_history"][0]["score"], 0.5);
        assert_eq!(value["time_horizon"], "1年");

        let restored = ReportState::from_json(&json).unwrap();
        assert_eq!(restored, state);
        assert_eq!(restored.time_horizon(), Some("1年"));
        assert_eq!(restored.analysis_angles(), ["技术".to_string()]);
    }

    #[test]
    fn test_inconsistent_document_rejected() {
        let mut value = serde_json::to_value(planned(&["a"], 1)).unwrap();
        value["paragraphs"][0]["reflection_iteration"] = serde_json::json!(3);
        value["paragraphs"][0]["latest_summary"] = serde_json::json!("s");
        let err = ReportState::from_json(&value.to_string()).unwrap_err();
        assert!(matches!(err, StateError::Inconsistent { index: 0, .. }));
    }
}
