//! Query shaping: time horizons, year correction and vague-term stripping.

use chrono::{Datelike, Months, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

static HORIZON: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^\s*(\d+)\s*(个月|月|months?|mos?|年|years?|yrs?)\s*$").expect("valid horizon regex")
});

static DIGIT_RUN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[0-9]+").expect("valid digit regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HorizonSpan {
    Months(u32),
    Years(u32),
    /// Text we could not read; treated as one year ahead.
    Unspecified,
}

/// A forward-looking window such as `3个月` or `1年`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeHorizon {
    label: String,
    span: HorizonSpan,
}

impl TimeHorizon {
    pub fn parse(label: &str) -> Self {
        let span = HORIZON
            .captures(label)
            .and_then(|caps| {
                let n: u32 = caps[1].parse().ok()?;
                let unit = caps[2].to_lowercase();
                if unit == "年" || unit.starts_with('y') {
                    Some(HorizonSpan::Years(n))
                } else {
                    Some(HorizonSpan::Months(n))
                }
            })
            .unwrap_or(HorizonSpan::Unspecified);

        Self {
            label: label.trim().to_string(),
            span,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn span(&self) -> HorizonSpan {
        self.span
    }

    /// Calendar-aware: month overflow carries into the year, and days past
    /// the end of the target month clamp to its last day.
    pub fn target_date(&self, today: NaiveDate) -> NaiveDate {
        let months = match self.span {
            HorizonSpan::Months(n) => n,
            HorizonSpan::Years(n) => n.saturating_mul(12),
            HorizonSpan::Unspecified => 12,
        };
        today
            .checked_add_months(Months::new(months))
            .unwrap_or(NaiveDate::MAX)
    }
}

impl fmt::Display for TimeHorizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// A horizon pinned to the date the run started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForecastWindow {
    pub horizon: TimeHorizon,
    pub today: NaiveDate,
}

impl ForecastWindow {
    pub fn new(horizon: TimeHorizon, today: NaiveDate) -> Self {
        Self { horizon, today }
    }

    pub fn target_date(&self) -> NaiveDate {
        self.horizon.target_date(self.today)
    }

    pub fn target_year(&self) -> i32 {
        self.target_date().year()
    }

    pub fn today_label(&self) -> String {
        format!("{}年{}月{}日", self.today.year(), self.today.month(), self.today.day())
    }

    pub fn target_label(&self) -> String {
        let target = self.target_date();
        match self.horizon.span() {
            HorizonSpan::Months(_) => format!("{}年{}月", target.year(), target.month()),
            HorizonSpan::Years(_) | HorizonSpan::Unspecified => format!("{}年", target.year()),
        }
    }

    /// Push stale years in a search query forward to the target year.
    pub fn correct_query(&self, query: &str) -> String {
        correct_years(query, self.today.year(), self.target_year())
    }
}

/// Rewrite every year token before `current_year` to `target_year`; append
/// the target year when the query carries no year at all.
///
/// A year token is a run of exactly four ASCII digits in `[2000, 2099)`. Model
/// numbers that happen to look like years are rewritten too.
pub fn correct_years(query: &str, current_year: i32, target_year: i32) -> String {
    let mut saw_year = false;
    let corrected = DIGIT_RUN.replace_all(query, |caps: &regex::Captures| {
        let run = &caps[0];
        match as_year(run) {
            Some(year) => {
                saw_year = true;
                if year < current_year {
                    target_year.to_string()
                } else {
                    run.to_string()
                }
            }
            None => run.to_string(),
        }
    });

    if saw_year {
        corrected.into_owned()
    } else {
        format!("{} {}年", corrected.trim_end(), target_year)
    }
}

fn as_year(run: &str) -> Option<i32> {
    if run.len() != 4 {
        return None;
    }
    let year: i32 = run.parse().ok()?;
    (2000..2099).contains(&year).then_some(year)
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Trigger-term sets used to de-vague topics and queries. Tuned per locale
/// from the `[vocabulary]` config section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Vocabulary {
    /// Generic trend/future words that mark a topic as vague.
    pub vague_topic_terms: Vec<String>,
    /// Topics shorter than this (in characters) that contain a vague term are rewritten.
    pub vague_topic_max_chars: usize,
    /// Terms meaning "the product itself" rather than a subject.
    pub placeholder_topic_terms: Vec<String>,
    /// Stripped from paragraph titles/content before asking for a query.
    pub concept_noise_terms: Vec<String>,
    pub concept_min_chars: usize,
    /// Stripped from model-produced search queries.
    pub query_noise_terms: Vec<String>,
    /// A paragraph title containing one of these counts as a conclusion.
    pub conclusion_markers: Vec<String>,
}

impl Default for Vocabulary {
    fn default() -> Self {
        let owned = |terms: &[&str]| terms.iter().map(|t| t.to_string()).collect::<Vec<_>>();
        Self {
            vague_topic_terms: owned(&["未来简事", "未来", "趋势", "发展", "展望", "预测"]),
            vague_topic_max_chars: 20,
            placeholder_topic_terms: owned(&["未来简事", "简事"]),
            concept_noise_terms: owned(&["未来简事", "简事", "未来", "趋势", "发展", "展望", "预测", "分析"]),
            concept_min_chars: 5,
            query_noise_terms: owned(&["未来简事", "简事"]),
            conclusion_markers: owned(&["结论", "总结", "结语", "conclusion", "concluding"]),
        }
    }
}

impl Vocabulary {
    pub fn is_vague_topic(&self, topic: &str) -> bool {
        let lowered = topic.to_lowercase();
        let short = topic.trim().chars().count() < self.vague_topic_max_chars;
        short
            && self
                .vague_topic_terms
                .iter()
                .any(|term| lowered.contains(&term.to_lowercase()))
    }

    pub fn is_placeholder_topic(&self, topic: &str) -> bool {
        self.placeholder_topic_terms
            .iter()
            .any(|term| topic.contains(term.as_str()))
    }

    /// Key concepts of a paragraph title or description. Falls back to the
    /// original text when stripping leaves too little to search for.
    pub fn strip_concept_noise(&self, text: &str) -> String {
        if text.trim().is_empty() {
            return text.to_string();
        }
        let mut cleaned = text.to_string();
        for term in &self.concept_noise_terms {
            cleaned = cleaned.replace(term.as_str(), "");
        }
        let cleaned = collapse_whitespace(&cleaned);
        if cleaned.chars().count() < self.concept_min_chars {
            return text.to_string();
        }
        cleaned
    }

    /// Exact removal, then a lowercase pass for Latin-script terms.
    pub fn strip_query_noise(&self, query: &str) -> String {
        let mut cleaned = query.to_string();
        for term in &self.query_noise_terms {
            cleaned = cleaned
                .replace(term.as_str(), "")
                .replace(term.to_lowercase().as_str(), "");
        }
        let cleaned = collapse_whitespace(&cleaned);
        if cleaned.is_empty() {
            query.to_string()
        } else {
            cleaned
        }
    }

    pub fn looks_like_conclusion(&self, title: &str) -> bool {
        let lowered = title.to_lowercase();
        self.conclusion_markers
            .iter()
            .any(|marker| lowered.contains(&marker.to_lowercase()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_horizons() {
        assert_eq!(TimeHorizon::parse("3个月").span(), HorizonSpan::Months(3));
        assert_eq!(TimeHorizon::parse("1年").span(), HorizonSpan::Years(1));
        assert_eq!(TimeHorizon::parse(" 6 months ").span(), HorizonSpan::Months(6));
        assert_eq!(TimeHorizon::parse("2 Years").span(), HorizonSpan::Years(2));
        assert_eq!(TimeHorizon::parse("下个季度").span(), HorizonSpan::Unspecified);
        assert_eq!(TimeHorizon::parse(" 3个月 ").label(), "3个月");
    }

    #[test]
    fn test_month_overflow_carries_into_year() {
        let horizon = TimeHorizon::parse("3个月");
        assert_eq!(horizon.target_date(date(2025, 11, 15)), date(2026, 2, 15));
        assert_eq!(horizon.target_date(date(2025, 11, 30)), date(2026, 2, 28));
        assert_eq!(TimeHorizon::parse("1年").target_date(date(2024, 2, 29)), date(2025, 2, 28));
        assert_eq!(TimeHorizon::parse("whenever").target_date(date(2025, 5, 1)), date(2026, 5, 1));
    }

    #[test]
    fn test_window_labels() {
        let window = ForecastWindow::new(TimeHorizon::parse("3个月"), date(2025, 10, 18));
        assert_eq!(window.today_label(), "2025年10月18日");
        assert_eq!(window.target_label(), "2026年1月");
        assert_eq!(window.target_year(), 2026);
    }

    #[test]
    fn test_stale_year_replaced() {
        let window = ForecastWindow::new(TimeHorizon::parse("1年"), date(2025, 6, 1));
        assert_eq!(window.correct_query("新能源汽车 2023年 销量"), "新能源汽车 2026年 销量");
        assert_eq!(window.correct_query("2025年 与 2027 展望"), "2025年 与 2027 展望");
    }

    #[test]
    fn test_missing_year_appended() {
        assert_eq!(correct_years("AI 芯片 出口管制", 2025, 2026), "AI 芯片 出口管制 2026年");
        // out-of-range and non-4-digit runs are not years
        assert_eq!(correct_years("RTX 2099 and 120235", 2025, 2026), "RTX 2099 and 120235 2026年");
    }

    #[test]
    fn test_vague_topic_detection() {
        let vocab = Vocabulary::default();
        assert!(vocab.is_vague_topic("人工智能的发展"));
        assert!(!vocab.is_vague_topic("电动汽车市场"));
        assert!(!vocab.is_vague_topic("人工智能在医疗影像诊断领域的技术发展与商业化落地路径研究"));
        assert!(vocab.is_placeholder_topic("未来简事"));
    }

    #[test]
    fn test_concept_noise() {
        let vocab = Vocabulary::default();
        assert_eq!(vocab.strip_concept_noise("未来 电动汽车 电池技术 趋势"), "电动汽车 电池技术");
        // too little left: keep original
        assert_eq!(vocab.strip_concept_noise("未来趋势"), "未来趋势");
        assert_eq!(vocab.strip_concept_noise(""), "");
    }

    #[test]
    fn test_query_noise() {
        let vocab = Vocabulary::default();
        assert_eq!(vocab.strip_query_noise("未来简事 储能  政策"), "储能 政策");
        assert_eq!(vocab.strip_query_noise("简事"), "简事");
    }

    #[test]
    fn test_conclusion_markers() {
        let vocab = Vocabulary::default();
        assert!(vocab.looks_like_conclusion("结论与建议"));
        assert!(vocab.looks_like_conclusion("Conclusions"));
        assert!(!vocab.looks_like_conclusion("市场规模"));
        assert!(!vocab.looks_like_conclusion("Market Outlook"));
        assert!(!vocab.looks_like_conclusion("Executive Summary"));
    }
}
