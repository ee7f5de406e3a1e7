//! System prompts for each research stage.
//!
//! Every builder takes an optional [`ForecastWindow`]. With a window the
//! prompt asks for forward-looking material dated inside it; without one it
//! asks for plain topical research.

use crate::query::ForecastWindow;

const JSON_ONLY: &str = "Return only the JSON value described above. No explanation, no Markdown, no extra text.";

fn window_notice(window: Option<&ForecastWindow>) -> String {
    match window {
        Some(w) => format!(
            "\nTime frame:\n- Today is {}.\n- The forecast window is the next {} (from now until {}).\n",
            w.today_label(),
            w.horizon,
            w.target_label()
        ),
        None => String::new(),
    }
}

fn query_rules(window: Option<&ForecastWindow>) -> String {
    match window {
        Some(w) => format!(
            "\nSearch query rules:\n\
             1. Name the time frame explicitly using current or future dates such as \"{}\" or \"{}年\". Never use years before {}.\n\
             2. Include forecasting words such as trend, forecast, outlook or development.\n\
             3. Target the future period, not historical background.\n\
             4. Avoid placeholder phrases that carry no subject.\n",
            w.target_label(),
            w.target_year(),
            w.today.format("%Y")
        ),
        None => String::new(),
    }
}

pub fn report_structure(window: Option<&ForecastWindow>, analysis_angles: &[String]) -> String {
    let role = match window {
        Some(w) => format!(
            "You are a forecasting analyst. Given a topic, plan a report about what is likely to happen within the next {}.",
            w.horizon
        ),
        None => "You are a deep research assistant. Given a topic, plan the structure of a research report about it.".to_string(),
    };

    let angles = if analysis_angles.is_empty() {
        String::new()
    } else {
        format!(
            "\nCover these analysis angles where they fit: {}.\n",
            analysis_angles.join(", ")
        )
    };

    format!(
        "{role}\n{}{angles}\n\
         Produce at most five paragraphs. Each paragraph has a short title and a description of what it should cover.\n\
         Output a JSON array of objects:\n\
         [{{\"title\": \"...\", \"content\": \"...\"}}]\n\n{JSON_ONLY}",
        window_notice(window)
    )
}

pub fn first_search(window: Option<&ForecastWindow>) -> String {
    format!(
        "You are a deep research assistant. You receive one paragraph of a report as JSON:\n\
         {{\"title\": string, \"content\": string}}\n{}\n\
         You can use a web search tool that takes a 'search_query'. Think about what to search to research this paragraph \
         and give the single best query.{}\n\
         Output a JSON object:\n\
         {{\"search_query\": \"...\", \"reasoning\": \"...\"}}\n\n{JSON_ONLY}",
        window_notice(window),
        query_rules(window)
    )
}

pub fn first_summary(window: Option<&ForecastWindow>) -> String {
    let focus = match window {
        Some(w) => format!(
            "Write the paragraph from the search results with the next {} in view. Emphasize forward-looking claims, \
             who predicts them, their likely impact and how uncertain they are.",
            w.horizon
        ),
        None => "Write the paragraph from the search results so it matches the planned content.".to_string(),
    };

    format!(
        "You are a deep research assistant. You receive a search query, its results and the report paragraph you are writing, as JSON:\n\
         {{\"title\": string, \"content\": string, \"search_query\": string, \"search_results\": [string]}}\n{}\n\
         {focus}\n\
         If the results are empty, write the best paragraph you can from the title and planned content.\n\
         Output a JSON object:\n\
         {{\"paragraph_latest_state\": \"...\"}}\n\n{JSON_ONLY}",
        window_notice(window)
    )
}

pub fn reflection(window: Option<&ForecastWindow>, round: u32) -> String {
    let focus = if round == 0 {
        "Reflect on the current paragraph and look for what is missing: other possible scenarios, differing forecasts, \
         risks and opportunities, related technical or social developments."
    } else {
        "Reflect critically on the current paragraph. Look for contradictions or stale information, overly optimistic or \
         pessimistic claims, experts or institutions who disagree, overlooked risks, and assumptions that do not hold up."
    };

    format!(
        "You are a deep research assistant building one paragraph of a report. You receive its title, planned content and \
         current state as JSON:\n\
         {{\"title\": string, \"content\": string, \"paragraph_latest_state\": string}}\n{}\n\
         {focus}\n\
         You can use a web search tool that takes a 'search_query'. Give the best query to enrich or correct the current state.{}\n\
         Output a JSON object:\n\
         {{\"search_query\": \"...\", \"reasoning\": \"...\"}}\n\n{JSON_ONLY}",
        window_notice(window),
        query_rules(window)
    )
}

pub fn reflection_summary(window: Option<&ForecastWindow>, critical: bool) -> String {
    let focus = if critical {
        "Update the current state with the new results. Revise content that the results contradict, fold in dissenting \
         views and neglected risks, and keep the paragraph balanced. Correct conflicting claims rather than stacking them."
    } else {
        "Enrich the current state with the new results. Do not drop key information already there; only add what is missing."
    };

    format!(
        "You are a deep research assistant iterating on one paragraph of a report. You receive a search query, its results, \
         the paragraph's title and planned content, and its current state, as JSON:\n\
         {{\"title\": string, \"content\": string, \"search_query\": string, \"search_results\": [string], \"paragraph_latest_state\": string}}\n{}\n\
         {focus}\n\
         Output a JSON object:\n\
         {{\"updated_paragraph_latest_state\": \"...\"}}\n\n{JSON_ONLY}",
        window_notice(window)
    )
}

pub fn report_formatting(window: Option<&ForecastWindow>) -> String {
    let scope = match window {
        Some(w) => format!(
            "Open the report by stating the forecast window (the next {}, until {}) and its main focus. \
             Note how confident each forecast is where it matters.",
            w.horizon,
            w.target_label()
        ),
        None => "Open the report with a short statement of its scope.".to_string(),
    };

    format!(
        "You have finished researching every paragraph of a report. You receive them as JSON:\n\
         [{{\"title\": string, \"paragraph_latest_state\": string}}]\n{}\n\
         Format the report as clean Markdown with headings, lists and emphasis. {scope}\n\
         Connect paragraphs with short transitions and keep the core subject in focus.\n\
         If there is no conclusion paragraph, end with a conclusion drawn from all paragraphs.\n\
         Return only the Markdown report.",
        window_notice(window)
    )
}
