use serde::Serialize;
use tracing::{info, warn};

use super::{NodeContext, NodeError, Stage, StageOutput};
use crate::extract::clean_text;
use crate::prompts;
use crate::query::Vocabulary;

const CONCLUSION_HEADING: &str = "结论";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FormattedSection {
    pub title: String,
    pub paragraph_latest_state: String,
}

#[derive(Debug, Clone)]
pub struct FormatRequest {
    pub report_title: String,
    pub sections: Vec<FormattedSection>,
}

/// Assemble the final Markdown report from every paragraph's latest summary.
pub async fn format_report(ctx: &NodeContext, request: &FormatRequest) -> Result<StageOutput<String>, NodeError> {
    let message = serde_json::to_string(&request.sections).unwrap_or_else(|_| "[]".to_string());
    let system = prompts::report_formatting(ctx.window());
    let raw = ctx.call(Stage::Formatting, &system, &message).await?;

    let markdown = clean_text(&raw);
    if markdown.is_empty() || markdown.starts_with('{') || markdown.starts_with('[') {
        warn!(stage = %Stage::Formatting, "unusable report from model, rendering locally");
        return Ok(StageOutput::Fallback {
            value: render_report(request, ctx.vocabulary()),
            raw,
        });
    }

    let vocabulary = ctx.vocabulary();
    let has_conclusion = has_conclusion_section(request, vocabulary)
        || markdown
            .lines()
            .filter(|line| line.trim_start().starts_with('#'))
            .any(|heading| vocabulary.looks_like_conclusion(heading));

    info!(chars = markdown.chars().count(), has_conclusion, "report formatted");
    if has_conclusion {
        Ok(StageOutput::Parsed(markdown))
    } else {
        Ok(StageOutput::Parsed(format!(
            "{}\n\n{}",
            markdown.trim_end(),
            synthesize_conclusion(&request.sections)
        )))
    }
}

/// Local Markdown rendering, used when the model's report is unusable.
pub fn render_report(request: &FormatRequest, vocabulary: &Vocabulary) -> String {
    let mut out = format!("# {}\n\n", request.report_title.trim());
    for section in &request.sections {
        out.push_str(&format!("## {}\n\n{}\n\n", section.title.trim(), section.paragraph_latest_state.trim()));
    }
    if !has_conclusion_section(request, vocabulary) {
        out.push_str(&synthesize_conclusion(&request.sections));
        out.push('\n');
    }
    out.trim_end().to_string() + "\n"
}

fn has_conclusion_section(request: &FormatRequest, vocabulary: &Vocabulary) -> bool {
    request
        .sections
        .iter()
        .any(|section| vocabulary.looks_like_conclusion(&section.title))
}

/// One line per section: its title and the lead sentence of its summary.
fn synthesize_conclusion(sections: &[FormattedSection]) -> String {
    let mut out = format!("## {CONCLUSION_HEADING}\n\n");
    for section in sections {
        let lead = lead_sentence(&section.paragraph_latest_state);
        if lead.is_empty() {
            continue;
        }
        out.push_str(&format!("- **{}**：{}\n", section.title.trim(), lead));
    }
    out
}

fn lead_sentence(text: &str) -> String {
    let text = text.trim();
    let end = text
        .char_indices()
        .find(|(_, c)| matches!(c, '。' | '！' | '？' | '\n'))
        .map(|(i, c)| if c == '\n' { i } else { i + c.len_utf8() })
        .unwrap_or(text.len());
    text[..end].trim().trim_start_matches('#').trim().to_string()
}
