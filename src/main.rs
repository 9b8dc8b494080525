use anyhow::Context;
use clap::{Parser, Subcommand};
use course_metrics::adapters::openai::OpenAiTransport;
use course_metrics::adapters::LlmTransport;
use course_metrics::config::{
    self, LlmSettings, Settings, DEFAULT_BUSY_TIMEOUT_MS, DEFAULT_LLM_TIMEOUT_SECS, DEFAULT_MODEL,
    DEFAULT_QUERY_TIMEOUT_MS,
};
use course_metrics::errors::{AppError, ResolutionError};
use course_metrics::registry::MetricRegistry;
use course_metrics::CourseMetrics;
use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

const REPHRASE_TIPS: &str = "\
Try naming what to count or average and which item it is about, for example:
  How many students completed module 2?
  What's the average score on the Final Exam assessment?
  What is student 7's average score?
Run `course-metrics metrics` to see every supported metric.";

#[derive(Parser)]
#[command(name = "course-metrics", version)]
#[command(about = "Answer instructor questions about course metrics from a reviewed SQL catalog")]
struct Cli {
    /// SQLite course database (opened read-only)
    #[arg(long, env = "COURSE_METRICS_DB", default_value = "user.db", global = true)]
    db: PathBuf,

    /// Metric registry (JSON, or YAML for .yaml/.yml)
    #[arg(long = "metrics", env = "COURSE_METRICS_REGISTRY", default_value = "metrics.json", global = true)]
    registry: PathBuf,

    /// Write JSON logs to a daily file in this directory instead of stderr
    #[arg(long, env = "COURSE_METRICS_LOG_DIR", global = true)]
    log_dir: Option<PathBuf>,

    #[arg(long, env = "COURSE_METRICS_QUERY_TIMEOUT_MS", default_value_t = DEFAULT_QUERY_TIMEOUT_MS, global = true)]
    query_timeout_ms: u64,

    /// Base URL of the OpenAI-compatible endpoint, e.g. https://host/v1
    #[arg(long, env = "LLAMA_API_BASE", global = true)]
    llm_base: Option<String>,

    #[arg(long, env = "LLAMA_API_KEY", hide_env_values = true, global = true)]
    llm_key: Option<String>,

    #[arg(long, env = "LLAMA_MODEL", default_value = DEFAULT_MODEL, global = true)]
    llm_model: String,

    #[arg(long, env = "LLAMA_TIMEOUT_SECS", default_value_t = DEFAULT_LLM_TIMEOUT_SECS, global = true)]
    llm_timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Answer one question; the value goes to stdout, the audit trailer to stderr
    Ask {
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,

        /// Skip the model and use only the deterministic keyword rules
        #[arg(long)]
        rules_only: bool,
    },
    /// Ratings, comments and insights for one module, as JSON
    FeedbackModule {
        module_id: i64,

        #[arg(long)]
        no_insights: bool,
    },
    /// Feedback report for every module with completions, as JSON
    FeedbackCourse {
        #[arg(long)]
        no_insights: bool,
    },
    /// List supported metrics and their parameters
    Metrics,
    /// Manage the API key stored in the OS keyring
    Credentials {
        #[command(subcommand)]
        action: CredentialsAction,
    },
}

#[derive(Subcommand)]
enum CredentialsAction {
    /// Store a key; read from stdin when not given
    Set { key: Option<String> },
    Clear,
    Status,
}

impl Cli {
    fn settings(&self) -> Settings {
        Settings {
            db_path: self.db.clone(),
            registry_path: self.registry.clone(),
            log_dir: self.log_dir.clone(),
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            busy_timeout: Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS),
            llm: LlmSettings {
                base_url: self.llm_base.clone(),
                api_key: self.llm_key.clone(),
                model: self.llm_model.clone(),
                timeout: Duration::from_secs(self.llm_timeout_secs),
            },
        }
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(error) = course_metrics::init_tracing(cli.log_dir.as_deref()) {
        eprintln!("warning: logging disabled: {}", error);
    }

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            let (message, code) = report(&error);
            eprintln!("{}", message);
            ExitCode::from(code)
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let settings = cli.settings();
    settings.validate()?;
    match cli.command {
        Command::Ask { question, rules_only } => {
            let question = question.join(" ");
            let app = CourseMetrics::open(&settings, transport(&settings, !rules_only))?;
            let answer = app.ask(&question)?;
            println!("{}", answer.value);
            eprintln!("{}", serde_json::to_string_pretty(&answer.trailer)?);
        }
        Command::FeedbackModule { module_id, no_insights } => {
            let app = CourseMetrics::open(&settings, transport(&settings, !no_insights))?;
            let report = app.module_feedback(module_id)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::FeedbackCourse { no_insights } => {
            let app = CourseMetrics::open(&settings, transport(&settings, !no_insights))?;
            let reports = app.course_feedback()?;
            println!("{}", serde_json::to_string_pretty(&reports)?);
        }
        Command::Metrics => {
            let registry = MetricRegistry::load(&settings.registry_path).map_err(AppError::from)?;
            print!("{}", registry.summary());
        }
        Command::Credentials { action } => credentials(action)?,
    }
    Ok(())
}

fn transport(settings: &Settings, enabled: bool) -> Option<Box<dyn LlmTransport>> {
    if !enabled {
        return None;
    }
    let mut llm = settings.llm.clone();
    llm.api_key = config::resolve_api_key(llm.api_key.take());
    if !llm.is_configured() {
        tracing::warn!("LLM endpoint or key not configured; questions will use the keyword rules");
    }
    Some(Box::new(OpenAiTransport::new(llm)))
}

fn credentials(action: CredentialsAction) -> anyhow::Result<()> {
    match action {
        CredentialsAction::Set { key } => {
            let key = match key {
                Some(key) => key,
                None => {
                    let mut line = String::new();
                    std::io::stdin()
                        .lock()
                        .read_line(&mut line)
                        .context("reading API key from stdin")?;
                    line
                }
            };
            config::save_api_key(&key)?;
            println!("API key stored in the OS keyring.");
        }
        CredentialsAction::Clear => {
            config::clear_api_key()?;
            println!("Stored API key removed.");
        }
        CredentialsAction::Status => match config::stored_api_key()? {
            Some(_) => println!("An API key is stored in the OS keyring."),
            None => println!("No API key is stored."),
        },
    }
    Ok(())
}

/// User-facing message and exit code. "Rephrase" and "data problem" never share wording.
fn report(error: &anyhow::Error) -> (String, u8) {
    let Some(app_error) = error.downcast_ref::<AppError>() else {
        return (format!("Error: {:#}", error), 1);
    };
    let message = match app_error {
        AppError::Unanswerable => format!("Could not understand the question.\n{}", REPHRASE_TIPS),
        AppError::Resolution(inner @ ResolutionError::Lookup(_)) => format!("Database/query error: {}", inner),
        AppError::Resolution(inner) => format!("Could not resolve the question: {}", inner),
        AppError::Execution(inner) => format!("Database/query error: {}", inner),
        AppError::Registry(inner) => format!("Metric registry error: {}", inner),
        AppError::Config(_) | AppError::Io(_) | AppError::Internal(_) => format!("Error: {}", app_error),
    };
    let code = u8::try_from(app_error.exit_code()).unwrap_or(1);
    (message, code)
}
