#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use deep_search::llm::{InvokeOptions, ModelProvider, ProviderError};
use deep_search::search::{SearchError, SearchHit, SearchProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Call {
    Plan,
    FirstSearch,
    Reflection,
    FirstSummary,
    ReflectionSummary,
    Formatting,
}

/// Recognise the stage from the system prompt it was sent.
fn classify(system_prompt: &str) -> Call {
    if system_prompt.contains("Produce at most five paragraphs") {
        Call::Plan
    } else if system_prompt.contains("updated_paragraph_latest_state") {
        Call::ReflectionSummary
    } else if system_prompt.contains("{\"paragraph_latest_state\": \"...\"}") {
        Call::FirstSummary
    } else if system_prompt.contains("enrich or correct the current state") {
        Call::Reflection
    } else if system_prompt.contains("Return only the Markdown report.") {
        Call::Formatting
    } else {
        Call::FirstSearch
    }
}

type Responder = dyn Fn(Call, usize) -> Result<String, ProviderError> + Send + Sync;

/// Model stub answering per stage and recording every call.
pub struct StubModel {
    respond: Box<Responder>,
    /// Stage, system prompt and user prompt of every call.
    pub calls: Mutex<Vec<(Call, String, String)>>,
}

impl StubModel {
    pub fn new(respond: impl Fn(Call, usize) -> Result<String, ProviderError> + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Well-formed answers for every stage. `n` counts calls of that stage.
    pub fn well_behaved() -> Arc<Self> {
        Self::new(|call, n| Ok(default_reply(call, n)))
    }

    pub fn count(&self, call: Call) -> usize {
        self.calls.lock().unwrap().iter().filter(|(c, _, _)| *c == call).count()
    }

    pub fn prompts(&self, call: Call) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| *c == call)
            .map(|(_, _, prompt)| prompt.clone())
            .collect()
    }

    pub fn system_prompts(&self, call: Call) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _, _)| *c == call)
            .map(|(_, system, _)| system.clone())
            .collect()
    }
}

pub fn default_reply(call: Call, n: usize) -> String {
    match call {
        Call::Plan => r#"[{"title": "市场规模", "content": "销量与渗透率"}, {"title": "技术路线", "content": "电池与充电"}]"#.to_string(),
        Call::FirstSearch => format!(r#"{{"search_query": "first query {n}", "reasoning": "r"}}"#),
        Call::Reflection => format!(r#"{{"search_query": "reflection query {n}", "reasoning": "r"}}"#),
        Call::FirstSummary => format!(r#"{{"paragraph_latest_state": "first summary {n}"}}"#),
        Call::ReflectionSummary => format!(r#"{{"updated_paragraph_latest_state": "enriched summary number {n} with more detail"}}"#),
        Call::Formatting => "# Report\n\n## 结论\n\ndone".to_string(),
    }
}

#[async_trait]
impl ModelProvider for StubModel {
    fn name(&self) -> &str {
        "stub"
    }

    async fn invoke(&self, system_prompt: &str, user_prompt: &str, _options: &InvokeOptions) -> Result<String, ProviderError> {
        let call = classify(system_prompt);
        let n = {
            let mut calls = self.calls.lock().unwrap();
            let n = calls.iter().filter(|(c, _, _)| *c == call).count();
            calls.push((call, system_prompt.to_string(), user_prompt.to_string()));
            n
        };
        (self.respond)(call, n)
    }
}

/// Search stub: answers from a queue of result lists, then a default list.
pub struct StubSearch {
    queued: Mutex<VecDeque<Result<Vec<SearchHit>, SearchError>>>,
    default_hits: usize,
    pub queries: Mutex<Vec<String>>,
}

impl StubSearch {
    pub fn with_hits(default_hits: usize) -> Arc<Self> {
        Arc::new(Self {
            queued: Mutex::new(VecDeque::new()),
            default_hits,
            queries: Mutex::new(Vec::new()),
        })
    }

    pub fn scripted(answers: Vec<Result<Vec<SearchHit>, SearchError>>, default_hits: usize) -> Arc<Self> {
        Arc::new(Self {
            queued: Mutex::new(answers.into()),
            default_hits,
            queries: Mutex::new(Vec::new()),
        })
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

pub fn hits(query: &str, count: usize) -> Vec<SearchHit> {
    (0..count)
        .map(|i| SearchHit {
            url: format!("https://example.com/{}/{}", query.replace(' ', "-"), i),
            title: format!("{query} #{i}"),
            content: format!("content for {query} #{i}"),
            score: Some(0.9 - i as f64 * 0.1),
        })
        .collect()
}

#[async_trait]
impl SearchProvider for StubSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<SearchHit>, SearchError> {
        self.queries.lock().unwrap().push(query.to_string());
        if let Some(answer) = self.queued.lock().unwrap().pop_front() {
            return answer;
        }
        Ok(hits(query, self.default_hits.min(max_results)))
    }
}
