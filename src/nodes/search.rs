use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use super::{require, NodeContext, NodeError, Stage, StageOutput};
use crate::extract::{extract, text_field};
use crate::prompts;

const FIRST_SEARCH_FALLBACK: &str = "相关主题研究";
const REFLECTION_FALLBACK: &str = "深度研究补充信息";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub search_query: String,
    pub reasoning: String,
}

#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ReflectionRequest {
    pub title: String,
    pub content: String,
    pub latest_summary: String,
    /// Round 0 looks for omissions, later rounds are critical.
    pub round: u32,
}

/// Ask for the first search query of a paragraph.
pub async fn first_search(ctx: &NodeContext, request: &SearchRequest) -> Result<StageOutput<SearchQuery>, NodeError> {
    require(Stage::FirstSearch, "title", &request.title)?;
    require(Stage::FirstSearch, "content", &request.content)?;

    let vocabulary = ctx.vocabulary();
    let message = json!({
        "title": vocabulary.strip_concept_noise(&request.title),
        "content": vocabulary.strip_concept_noise(&request.content),
    });

    let system = prompts::first_search(ctx.window());
    let raw = ctx.call(Stage::FirstSearch, &system, &message.to_string()).await?;

    let output = parse_query(raw, Stage::FirstSearch, FIRST_SEARCH_FALLBACK, "解析失败，使用默认搜索查询");
    Ok(refine(ctx, output))
}

/// Ask what to search next to improve the paragraph's current summary.
pub async fn reflect(ctx: &NodeContext, request: &ReflectionRequest) -> Result<StageOutput<SearchQuery>, NodeError> {
    require(Stage::Reflection, "title", &request.title)?;
    require(Stage::Reflection, "content", &request.content)?;
    require(Stage::Reflection, "paragraph_latest_state", &request.latest_summary)?;

    let message = json!({
        "title": request.title,
        "content": request.content,
        "paragraph_latest_state": request.latest_summary,
    });

    let system = prompts::reflection(ctx.window(), request.round);
    let raw = ctx.call(Stage::Reflection, &system, &message.to_string()).await?;

    let output = parse_query(raw, Stage::Reflection, REFLECTION_FALLBACK, "解析失败，使用默认反思查询");
    Ok(refine(ctx, output))
}

fn parse_query(raw: String, stage: Stage, fallback_query: &str, fallback_reason: &str) -> StageOutput<SearchQuery> {
    let parsed = extract(&raw).ok().and_then(|value| {
        let search_query = text_field(&value, &["search_query", "query"])?;
        let reasoning = text_field(&value, &["reasoning", "reason"]).unwrap_or_default();
        Some(SearchQuery {
            search_query,
            reasoning,
        })
    });

    match parsed {
        Some(query) => StageOutput::Parsed(query),
        None => {
            warn!(%stage, "no search query in model output, using fallback");
            StageOutput::Fallback {
                value: SearchQuery {
                    search_query: fallback_query.to_string(),
                    reasoning: fallback_reason.to_string(),
                },
                raw,
            }
        }
    }
}

/// Strip placeholder noise, then pin years to the forecast window.
fn refine(ctx: &NodeContext, output: StageOutput<SearchQuery>) -> StageOutput<SearchQuery> {
    let fix = |mut query: SearchQuery| {
        let cleaned = ctx.vocabulary().strip_query_noise(&query.search_query);
        query.search_query = match ctx.window() {
            Some(window) => window.correct_query(&cleaned),
            None => cleaned,
        };
        info!(query = %query.search_query, "search query ready");
        query
    };

    match output {
        StageOutput::Parsed(query) => StageOutput::Parsed(fix(query)),
        StageOutput::Fallback { value, raw } => StageOutput::Fallback { value: fix(value), raw },
    }
}
