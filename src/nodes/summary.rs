use serde_json::json;
use tracing::{debug, warn};

use super::{require, NodeContext, NodeError, Stage, StageOutput};
use crate::extract::{clean_text, extract, text_field};
use crate::prompts;

const FIRST_KEYS: &[&str] = &["paragraph_latest_state", "updated_paragraph_latest_state", "summary"];
const UPDATE_KEYS: &[&str] = &["updated_paragraph_latest_state", "paragraph_latest_state", "summary"];

#[derive(Debug, Clone, Default)]
pub struct SummaryRequest {
    pub title: String,
    pub content: String,
    pub search_query: String,
    /// Result excerpts in search order. May be empty.
    pub search_results: Vec<String>,
    /// Current paragraph text; empty for the first pass.
    pub latest_summary: String,
    /// Critical rounds may revise earlier text instead of only adding to it.
    pub critical: bool,
}

/// Write the first version of a paragraph. Never returns an empty summary.
pub async fn first_summary(ctx: &NodeContext, request: &SummaryRequest) -> Result<StageOutput<String>, NodeError> {
    require(Stage::FirstSummary, "title", &request.title)?;

    let message = json!({
        "title": request.title,
        "content": request.content,
        "search_query": request.search_query,
        "search_results": request.search_results,
    });
    let system = prompts::first_summary(ctx.window());
    let raw = ctx.call(Stage::FirstSummary, &system, &message.to_string()).await?;

    let summary = match extract(&raw) {
        Ok(value) => text_field(&value, FIRST_KEYS),
        // Plain prose is still a usable paragraph.
        Err(_) => Some(clean_text(&raw)).filter(|text| !text.is_empty()),
    };

    match summary {
        Some(summary) if !looks_structured(&summary) => Ok(StageOutput::Parsed(summary)),
        _ => {
            warn!(stage = %Stage::FirstSummary, title = %request.title, "no summary in model output, writing one from the plan");
            Ok(StageOutput::Fallback {
                value: planned_summary(request),
                raw,
            })
        }
    }
}

/// Fold a reflection round's results into the current summary.
///
/// Outside critical rounds the result is never shorter than the previous
/// summary; an unusable reply keeps the previous summary as it was.
pub async fn reflection_summary(ctx: &NodeContext, request: &SummaryRequest) -> Result<StageOutput<String>, NodeError> {
    require(Stage::ReflectionSummary, "title", &request.title)?;
    require(Stage::ReflectionSummary, "paragraph_latest_state", &request.latest_summary)?;

    let message = json!({
        "title": request.title,
        "content": request.content,
        "search_query": request.search_query,
        "search_results": request.search_results,
        "paragraph_latest_state": request.latest_summary,
    });
    let system = prompts::reflection_summary(ctx.window(), request.critical);
    let raw = ctx.call(Stage::ReflectionSummary, &system, &message.to_string()).await?;

    let updated = extract(&raw).ok().and_then(|value| text_field(&value, UPDATE_KEYS));
    let Some(updated) = updated else {
        warn!(stage = %Stage::ReflectionSummary, title = %request.title, "no updated summary in model output, keeping previous");
        return Ok(StageOutput::Fallback {
            value: request.latest_summary.clone(),
            raw,
        });
    };

    if !request.critical && updated.chars().count() < request.latest_summary.chars().count() {
        debug!(title = %request.title, "update shorter than previous summary, merging");
        return Ok(StageOutput::Parsed(merge(&request.latest_summary, &updated)));
    }
    Ok(StageOutput::Parsed(updated))
}

fn merge(previous: &str, addition: &str) -> String {
    if previous.contains(addition.trim()) {
        return previous.to_string();
    }
    format!("{}\n\n{}", previous.trim_end(), addition.trim())
}

fn planned_summary(request: &SummaryRequest) -> String {
    let content = request.content.trim();
    if content.is_empty() || content == request.title.trim() {
        request.title.trim().to_string()
    } else {
        format!("{}：{}", request.title.trim(), content)
    }
}

/// Raw text that is really an unparsed JSON payload is not a summary.
fn looks_structured(text: &str) -> bool {
    let trimmed = text.trim_start();
    trimmed.starts_with('{') || trimmed.starts_with('[')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::testing::{context, ScriptedModel};
    use pretty_assertions::assert_eq;

    fn request(latest: &str, critical: bool) -> SummaryRequest {
        SummaryRequest {
            title: "市场规模".to_string(),
            content: "全球销量与渗透率".to_string(),
            search_query: "电动汽车 销量 2026年".to_string(),
            search_results: vec!["销量增长 30%".to_string()],
            latest_summary: latest.to_string(),
            critical,
        }
    }

    #[tokio::test]
    async fn test_first_summary_parsed() {
        let model = ScriptedModel::new(&[r#"{"paragraph_latest_state": "销量预计继续增长。"}"#]);
        let out = first_summary(&context(&model), &request("", false)).await.unwrap();
        assert_eq!(out, StageOutput::Parsed("销量预计继续增长。".to_string()));

        let sent: serde_json::Value = serde_json::from_str(&model.user_prompts()[0]).unwrap();
        assert_eq!(sent["search_results"][0], "销量增长 30%");
    }

    #[tokio::test]
    async fn test_prose_reply_used_as_summary() {
        let model = ScriptedModel::new(&["<think>plan</think>\n渗透率将在年内突破四成。"]);
        let out = first_summary(&context(&model), &request("", false)).await.unwrap();
        assert_eq!(out.into_value(), "渗透率将在年内突破四成。");
    }

    #[tokio::test]
    async fn test_empty_reply_and_no_results_still_summarize() {
        let model = ScriptedModel::new(&[""]);
        let mut req = request("", false);
        req.search_results.clear();
        let out = first_summary(&context(&model), &req).await.unwrap();
        assert!(out.is_fallback());
        assert_eq!(out.value(), "市场规模：全球销量与渗透率");
    }

    #[tokio::test]
    async fn test_json_without_summary_key_falls_back() {
        let model = ScriptedModel::new(&[r#"{"unexpected": "shape"}"#]);
        let out = first_summary(&context(&model), &request("", false)).await.unwrap();
        assert!(out.is_fallback());
    }

    #[tokio::test]
    async fn test_enrichment_never_shrinks() {
        let previous = "销量预计继续增长，主要由中国和欧洲市场带动。";
        let model = ScriptedModel::new(&[r#"{"updated_paragraph_latest_state": "补贴退坡。"}"#]);
        let out = reflection_summary(&context(&model), &request(previous, false)).await.unwrap();
        let text = out.into_value();
        assert!(text.starts_with(previous));
        assert!(text.ends_with("补贴退坡。"));
        assert!(text.chars().count() >= previous.chars().count());
    }

    #[tokio::test]
    async fn test_critical_round_may_revise() {
        let previous = "销量预计继续增长，主要由中国和欧洲市场带动。";
        let model = ScriptedModel::new(&[r#"{"updated_paragraph_latest_state": "增长放缓。"}"#]);
        let out = reflection_summary(&context(&model), &request(previous, true)).await.unwrap();
        assert_eq!(out.into_value(), "增长放缓。");
    }

    #[tokio::test]
    async fn test_unusable_update_keeps_previous() {
        let model = ScriptedModel::new(&["sorry"]);
        let out = reflection_summary(&context(&model), &request("previous", false)).await.unwrap();
        assert!(out.is_fallback());
        assert_eq!(out.value(), "previous");
    }
}
