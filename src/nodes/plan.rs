use serde_json::Value;
use tracing::{info, warn};

use super::{require, NodeContext, NodeError, Stage, StageOutput};
use crate::extract::{extract, text_field};
use crate::prompts;
use crate::state::PlannedParagraph;

pub const MAX_PARAGRAPHS: usize = 5;

const DEFAULT_HORIZON: &str = "3个月";

#[derive(Debug, Clone, Default)]
pub struct PlanRequest {
    pub topic: String,
    pub analysis_angles: Vec<String>,
}

/// Rewrite a vague topic so it names a concrete window of time.
///
/// Placeholder topics are replaced outright, falling back to a three-month
/// window when none is configured. Other vague topics keep their subject and
/// gain the configured horizon; without one they come back unchanged, as do
/// concrete topics.
pub fn clarify_topic(ctx: &NodeContext, topic: &str) -> String {
    let vocabulary = ctx.vocabulary();
    if !vocabulary.is_vague_topic(topic) {
        return topic.trim().to_string();
    }

    let configured = ctx.window().map(|w| w.horizon.label().to_string());
    let clarified = if vocabulary.is_placeholder_topic(topic) {
        let horizon = configured.unwrap_or_else(|| DEFAULT_HORIZON.to_string());
        format!("未来{horizon}内可能发生的重要事件、趋势和变化")
    } else if let Some(horizon) = configured {
        format!("未来{horizon}内，{}可能出现的具体事件、趋势和变化", topic.trim())
    } else {
        return topic.trim().to_string();
    };
    info!(topic, %clarified, "clarified vague topic");
    clarified
}

/// The two-paragraph outline used when the model's plan is unusable.
pub fn fallback_plan(topic: &str) -> Vec<PlannedParagraph> {
    vec![
        PlannedParagraph {
            title: "概述".to_string(),
            content: format!("对'{topic}'的总体概述和背景介绍"),
        },
        PlannedParagraph {
            title: "详细分析".to_string(),
            content: format!("深入分析'{topic}'的相关内容"),
        },
    ]
}

/// Plan the report outline. Always yields at least one paragraph.
pub async fn plan_report(ctx: &NodeContext, request: &PlanRequest) -> Result<StageOutput<Vec<PlannedParagraph>>, NodeError> {
    require(Stage::Plan, "topic", &request.topic)?;

    let clarified = clarify_topic(ctx, &request.topic);
    let dispatched = match ctx.window() {
        Some(w) if !clarified.contains(w.horizon.label()) => format!("未来{}内，{clarified}", w.horizon),
        _ => clarified,
    };

    let system = prompts::report_structure(ctx.window(), &request.analysis_angles);
    let raw = ctx.call(Stage::Plan, &system, &dispatched).await?;

    let plan = extract(&raw).ok().map(|value| paragraphs_from(&value)).unwrap_or_default();
    if plan.is_empty() {
        warn!(stage = %Stage::Plan, "unusable plan output, using fallback outline");
        return Ok(StageOutput::Fallback {
            value: fallback_plan(request.topic.trim()),
            raw,
        });
    }

    info!(paragraphs = plan.len(), "planned report structure");
    Ok(StageOutput::Parsed(plan))
}

fn paragraphs_from(value: &Value) -> Vec<PlannedParagraph> {
    let records: Vec<Value> = match value {
        Value::Array(items) => items.clone(),
        // {"paragraphs": [...]} or any other single wrapping key
        Value::Object(map) => match map.values().find(|v| v.is_array()) {
            Some(Value::Array(items)) => items.clone(),
            _ if map.contains_key("title") => vec![value.clone()],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    records
        .iter()
        .filter(|record| record.is_object())
        .take(MAX_PARAGRAPHS)
        .enumerate()
        .map(|(i, record)| {
            let title = text_field(record, &["title"]).unwrap_or_else(|| format!("段落 {}", i + 1));
            let content = text_field(record, &["content", "description"]).unwrap_or_else(|| title.clone());
            PlannedParagraph { title, content }
        })
        .collect()
}
