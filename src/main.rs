use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::warn;

use deep_search::config::{ApiKeys, Config, TAVILY_KEY_NAME};
use deep_search::history;
use deep_search::llm::{build_provider, InvokeOptions};
use deep_search::report::ReportStore;
use deep_search::search::TavilyClient;
use deep_search::{ReportState, ResearchOrchestrator, ResearchProgress, ResearchSettings};

#[derive(Debug, Parser)]
#[command(name = "deep-search", version, about = "Iterative web research that writes a Markdown report")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Research a topic from scratch
    Research {
        topic: String,
        #[command(flatten)]
        scope: ScopeArgs,
        #[command(flatten)]
        run: RunArgs,
    },
    /// Continue a run from a saved state file under its stored settings
    Resume {
        state: PathBuf,
        #[command(flatten)]
        run: RunArgs,
    },
    /// List recent runs
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the report of a past run
    Show { id: i64 },
    /// Remove a run from the history
    Delete { id: i64 },
    /// Print progress of a saved state file
    Progress { state: PathBuf },
}

// Frozen into the report when it is planned; resume has no say over them.
#[derive(Debug, Args)]
struct ScopeArgs {
    /// Forecast window, e.g. "3个月" or "1年"
    #[arg(long)]
    time_horizon: Option<String>,
    /// Analysis angle to cover (repeatable)
    #[arg(long = "angle")]
    angles: Vec<String>,
    #[arg(long)]
    max_reflections: Option<u32>,
}

impl ScopeArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(horizon) = &self.time_horizon {
            config.agent.time_horizon = Some(horizon.clone());
        }
        if !self.angles.is_empty() {
            config.agent.analysis_angles = self.angles.clone();
        }
        if let Some(max) = self.max_reflections {
            config.agent.max_reflections = max;
        }
    }
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    max_results: Option<usize>,
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// Do not write report or state files
    #[arg(long)]
    no_save: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(max) = self.max_results {
            config.search.max_results = max;
        }
        if let Some(dir) = &self.output_dir {
            config.agent.output_dir = dir.clone();
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("deep-search error: {error:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    init_tracing()?;
    let cli = Cli::parse();
    let db = history::default_db_path();

    match cli.command {
        Command::Research { topic, scope, run } => {
            let state = ReportState::new(topic);
            research(state, Some(&scope), &run, &db).await
        }
        Command::Resume { state, run } => {
            let state = ReportStore::load_state(&state)?;
            research(state, None, &run, &db).await
        }
        Command::History { limit } => {
            history::init(&db)?;
            for entry in history::list_entries(&db, limit)? {
                let when = chrono::DateTime::from_timestamp(entry.created_at, 0)
                    .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_default();
                println!("{:>4}  {}  {}  ({} paragraphs)", entry.id, when, entry.query, entry.paragraphs);
            }
            Ok(())
        }
        Command::Show { id } => {
            history::init(&db)?;
            let entry = history::get_entry(&db, id)?.with_context(|| format!("no run with id {id}"))?;
            let report = std::fs::read_to_string(&entry.report_path)
                .with_context(|| format!("failed to read {}", entry.report_path))?;
            println!("{report}");
            Ok(())
        }
        Command::Delete { id } => {
            history::init(&db)?;
            if !history::delete_entry(&db, id)? {
                anyhow::bail!("no run with id {id}");
            }
            eprintln!("deleted run {id}");
            Ok(())
        }
        Command::Progress { state } => {
            let state = ReportStore::load_state(&state)?;
            let progress = state.progress();
            println!("{}", serde_json::to_string_pretty(&progress)?);
            Ok(())
        }
    }
}

/// Run or resume research. A resumed run (`scope` is `None`) keeps the
/// horizon and angles stored in its checkpoint.
async fn research(mut state: ReportState, scope: Option<&ScopeArgs>, run: &RunArgs, db: &Path) -> anyhow::Result<()> {
    let mut config = Config::load();
    if let Some(scope) = scope {
        scope.apply(&mut config);
    }
    run.apply(&mut config);
    let resume = scope.is_none();
    let save = !run.no_save;

    let keys = ApiKeys::load();
    let model = build_provider(&config.provider, &keys)?;
    let tavily_key = keys
        .get(TAVILY_KEY_NAME)
        .with_context(|| format!("no search API key: set {TAVILY_KEY_NAME} or add it to api_keys.toml"))?;
    let search = std::sync::Arc::new(TavilyClient::new(tavily_key));

    let store = ReportStore::new(&config.agent.output_dir);
    let mut orchestrator = ResearchOrchestrator::new(model, search, ResearchSettings::from(&config))
        .with_vocabulary(config.vocabulary.clone())
        .with_invoke_options(InvokeOptions::from(&config.provider));
    if save && config.agent.save_intermediate_states {
        orchestrator = orchestrator.with_store(store.clone());
    }

    let (tx, rx) = mpsc::unbounded_channel();
    orchestrator.set_progress_channel(tx);
    let printer = tokio::spawn(print_progress(rx));

    let result = if resume {
        orchestrator.resume(&mut state).await
    } else {
        orchestrator.research(&mut state).await
    };
    drop(orchestrator);
    let _ = printer.await;

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            if save {
                match store.save_state(&state) {
                    Ok(path) => eprintln!("partial state saved to {}", path.display()),
                    Err(save_err) => warn!("failed to save partial state: {}", save_err),
                }
            }
            return Err(e.into());
        }
    };

    println!("{report}");

    if save {
        let path = store.save_report(&state, &report)?;
        eprintln!("report saved to {}", path.display());
        if let Err(e) = history::init(db).and_then(|_| {
            history::add_entry(db, state.query(), state.report_title(), &path, state.paragraphs().len())
        }) {
            warn!("failed to record run in history: {}", e);
        }
    }
    Ok(())
}

async fn print_progress(mut rx: mpsc::UnboundedReceiver<ResearchProgress>) {
    while let Some(progress) = rx.recv().await {
        let line = match progress {
            ResearchProgress::Started => "starting research".to_string(),
            ResearchProgress::Planning => "planning report structure".to_string(),
            ResearchProgress::Planned(n) => format!("planned {n} paragraphs"),
            ResearchProgress::ParagraphStarted { index, total, title } => {
                format!("[{}/{}] {}", index + 1, total, title)
            }
            ResearchProgress::Searching { query, .. } => format!("  searching: {query}"),
            ResearchProgress::Summarizing { .. } => "  summarizing".to_string(),
            ResearchProgress::Reflecting { round, max, .. } => format!("  reflection {}/{}", round + 1, max),
            ResearchProgress::ParagraphCompleted { index } => format!("  paragraph {} done", index + 1),
            ResearchProgress::Formatting => "formatting report".to_string(),
            ResearchProgress::Completed => "research complete".to_string(),
        };
        eprintln!("{line}");
    }
}

fn init_tracing() -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_env("DEEP_SEARCH_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}
