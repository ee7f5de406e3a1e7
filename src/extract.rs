//! Recovery of structured records from free-text model output.
//!
//! Models wrap their JSON in reasoning blocks, markdown fences, explanatory
//! prose, or simply stop mid-object. [`extract`] runs a fixed pipeline of
//! best-effort cleanups and parsers and only gives up with an
//! [`ExtractionFailure`] carrying the original text.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

/// Model output that no recovery strategy could turn into an object or array.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("no structured payload found in model output ({} chars)", .raw.chars().count())]
pub struct ExtractionFailure {
    pub raw: String,
}

static REASONING_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(?:think|thinking|reasoning|reflection)>.*?</(?:think|thinking|reasoning|reflection)>")
        .expect("valid reasoning block regex")
});

static DANGLING_CLOSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</(?:think|thinking|reasoning|reflection)>").expect("valid closing tag regex")
});

static DANGLING_OPEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<(?:think|thinking|reasoning|reflection)>").expect("valid opening tag regex")
});

static WRAPPING_FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^```[A-Za-z0-9_+-]*[ \t]*\r?\n?(.*?)\r?\n?```\s*$").expect("valid fence regex")
});

static WRAPPER_TAG: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)</?(?:json|output|answer|response)>").expect("valid wrapper tag regex")
});

static TRAILING_COMMA: Lazy<Regex> =
    Lazy::new(|| Regex::new(r",(\s*[}\]])").expect("valid trailing comma regex"));

static STRING_FRAGMENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#""([A-Za-z_][A-Za-z0-9_]*)"\s*:\s*"((?:[^"\\]|\\.)*)""#).expect("valid fragment regex")
});

/// Turn raw model output into a JSON object or array.
///
/// Never panics, whatever the input. Valid JSON goes through untouched, so
/// extracting the reprinted form of an extracted record yields the same record.
pub fn extract(raw: &str) -> Result<Value, ExtractionFailure> {
    // Tag stripping ignores string boundaries, so well-formed payloads skip it.
    if let Some(value) = parse_structured(raw.trim()) {
        return Ok(value);
    }

    let cleaned = clean_text(raw);

    if let Some(value) = parse_structured(&cleaned) {
        return Ok(value);
    }

    if let Some(value) = recover_enclosed(&cleaned) {
        return Ok(value);
    }

    if let Some(value) = scan_fragments(&cleaned) {
        return Ok(value);
    }

    Err(ExtractionFailure {
        raw: raw.to_string(),
    })
}

/// Reasoning and decoration removed, for outputs that are prose rather than JSON.
pub fn clean_text(raw: &str) -> String {
    strip_decoration(&strip_reasoning(raw))
}

/// Drop chain-of-thought blocks some models emit ahead of the answer.
pub fn strip_reasoning(text: &str) -> String {
    let mut out = REASONING_BLOCK.replace_all(text, "").into_owned();

    // A closing tag without its opener: everything before it was reasoning.
    if let Some(close) = DANGLING_CLOSE.find_iter(&out).last() {
        out = out[close.end()..].to_string();
    }

    // An opener that never closed: the reasoning runs up to the payload.
    if let Some(open) = DANGLING_OPEN.find(&out) {
        let rest = &out[open.end()..];
        let cut = rest
            .find(['{', '['])
            .map(|i| open.end() + i)
            .unwrap_or(out.len());
        out = format!("{}{}", &out[..open.start()], &out[cut..]);
    }

    out.trim().to_string()
}

/// Remove a markdown fence or wrapper tags surrounding the whole payload.
pub fn strip_decoration(text: &str) -> String {
    let trimmed = text.trim();

    if let Some(caps) = WRAPPING_FENCE.captures(trimmed) {
        if let Some(inner) = caps.get(1) {
            return WRAPPER_TAG.replace_all(inner.as_str(), "").trim().to_string();
        }
    }

    // Unterminated fence, typically from a truncated response
    let mut body = trimmed;
    if let Some(rest) = body.strip_prefix("```") {
        body = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    }
    if let Some(rest) = body.strip_suffix("```") {
        body = rest;
    }

    WRAPPER_TAG.replace_all(body, "").trim().to_string()
}

/// First non-empty string among `keys`, looking into the first element when
/// the record is an array.
pub fn text_field(value: &Value, keys: &[&str]) -> Option<String> {
    let object = match value {
        Value::Object(map) => map,
        Value::Array(items) => return items.iter().find_map(|item| text_field(item, keys)),
        _ => return None,
    };

    keys.iter().find_map(|key| match object.get(*key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    })
}

fn parse_structured(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value @ (Value::Object(_) | Value::Array(_))) => Some(value),
        _ => None,
    }
}

/// Recovered payloads must carry something; `{` closed off to `{}` does not count.
fn parse_recovered(text: &str) -> Option<Value> {
    parse_structured(text).filter(has_content)
}

fn has_content(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty(),
        Value::Array(items) => items.iter().any(has_content),
        _ => true,
    }
}

/// Re-parse from each plausible opening brace or bracket to its last matching closer.
fn recover_enclosed(text: &str) -> Option<Value> {
    let mut openers: Vec<(usize, char, char)> = Vec::new();
    if let Some(i) = text.find('{') {
        openers.push((i, '{', '}'));
    }
    if let Some(i) = text.find('[') {
        openers.push((i, '[', ']'));
    }
    openers.sort_by_key(|(i, _, _)| *i);

    for (start, _, close) in openers {
        if let Some(end) = text.rfind(close) {
            if end > start {
                let candidate = &text[start..=end];
                if let Some(value) = parse_recovered(candidate) {
                    return Some(value);
                }
                let repaired = TRAILING_COMMA.replace_all(candidate, "$1");
                if let Some(value) = parse_recovered(&repaired) {
                    return Some(value);
                }
            }
        }

        if let Some(balanced) = balanced_payload(&text[start..]) {
            let repaired = TRAILING_COMMA.replace_all(&balanced, "$1");
            if let Some(value) = parse_recovered(&repaired) {
                return Some(value);
            }
        }
    }

    None
}

/// Walk from an opening brace, tracking strings and nesting. Returns the
/// balanced payload, or the truncated tail closed off if the text ends early.
fn balanced_payload(text: &str) -> Option<String> {
    let mut stack: Vec<char> = Vec::new();
    let mut in_string = false;
    let mut escape = false;

    for (i, ch) in text.char_indices() {
        if escape {
            escape = false;
            continue;
        }
        if in_string {
            match ch {
                '\\' => escape = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                if stack.pop() != Some(ch) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(text[..i + ch.len_utf8()].to_string());
                }
            }
            _ => {}
        }
    }

    if stack.is_empty() {
        return None;
    }

    let mut closed = text.trim_end().to_string();
    if escape {
        closed.pop();
    }
    if in_string {
        closed.push('"');
    }
    while let Some(closer) = stack.pop() {
        closed.push(closer);
    }
    Some(closed)
}

/// Last resort: collect `"key": "value"` pairs. A repeated key starts a new
/// record, so several records come back as an array.
fn scan_fragments(text: &str) -> Option<Value> {
    let mut records: Vec<Map<String, Value>> = Vec::new();
    let mut current = Map::new();

    for caps in STRING_FRAGMENT.captures_iter(text) {
        let key = caps[1].to_string();
        let raw_value = &caps[2];
        let value = serde_json::from_str::<String>(&format!("\"{raw_value}\""))
            .unwrap_or_else(|_| raw_value.to_string());

        if current.contains_key(&key) {
            records.push(std::mem::take(&mut current));
        }
        current.insert(key, Value::String(value));
    }

    if !current.is_empty() {
        records.push(current);
    }

    match records.len() {
        0 => None,
        1 => records.pop().map(Value::Object),
        _ => Some(Value::Array(records.into_iter().map(Value::Object).collect())),
    }
}
