use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod cases;
mod compare;
mod config;
mod error;
mod evaluation;
mod metrics;
mod models;
mod output;
mod protocol;
mod runner;

use crate::config::Settings;
use crate::error::{RunError, codes};
use crate::evaluation::SupportedModel;
use crate::output::OutputFormat;
use crate::runner::{RunOptions, Runner};

/// Parser accuracy evaluator - run hand-labeled utterances through the parser CLI
/// and score its structured output field by field
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Text-generation model used for AI-assisted fields
    #[arg(long)]
    model: SupportedModel,

    /// Parser jar; defaults to the newest jar in the configured artifact directory
    #[arg(long)]
    jar: Option<PathBuf>,

    /// Context document exported from the app
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Markdown table of test cases
    #[arg(long, default_value = "test_cases.md")]
    test_cases: PathBuf,

    /// Only run the given test ID; repeat to select several
    #[arg(long = "test", value_name = "ID")]
    tests: Vec<String>,

    /// Directory for the markdown reports
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,

    /// Command used to launch the jar, e.g. "java -Xmx4g"
    #[arg(long, value_name = "CMD")]
    java: Option<String>,

    /// Optional TOML settings for the model endpoint and parser process
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Run summary format: plain or json
    #[arg(short, long, default_value = "plain")]
    format: OutputFormat,

    /// Verbose output - log progress for each case
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // RUST_LOG wins over the verbosity flag
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        let level = if args.verbose { "info" } else { "warn" };
        format!("parser_accuracy_eval={}", level)
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(args: Args) -> Result<u8, RunError> {
    let settings = load_settings(args.settings.as_deref())?;
    let format = args.format;

    let runner = Runner::new(RunOptions {
        model: args.model,
        test_cases: args.test_cases,
        context: args.config,
        results_dir: args.results_dir,
        selected_ids: args.tests,
        artifact: args.jar,
        launch_command: args.java,
        settings,
    });

    let summary = runner.run().await?;
    output::print_run_summary(&summary, format);

    if summary.failing_ids.is_empty() {
        Ok(codes::SUCCESS)
    } else {
        Ok(codes::CASES_FAILED)
    }
}

fn load_settings(path: Option<&Path>) -> Result<Settings, RunError> {
    match path {
        None => Ok(Settings::default()),
        Some(path) if !path.is_file() => Err(RunError::InputNotFound(path.to_path_buf())),
        Some(path) => Ok(Settings::from_file(path)?),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = Args::try_parse_from(["parser-accuracy-eval", "--model", "google/gemma-3-1b-it"])
            .unwrap();
        assert_eq!(args.model, SupportedModel::Gemma3_1b);
        assert_eq!(args.config, PathBuf::from("config.json"));
        assert_eq!(args.test_cases, PathBuf::from("test_cases.md"));
        assert_eq!(args.results_dir, PathBuf::from("results"));
        assert!(args.tests.is_empty());
        assert!(matches!(args.format, OutputFormat::Plain));
    }

    #[test]
    fn test_args_repeatable_test_filter() {
        let args = Args::try_parse_from([
            "parser-accuracy-eval",
            "--model",
            "google/gemma-3n-E2B-it",
            "--test",
            "T1",
            "--test",
            "T7",
            "--java",
            "java -Xmx4g",
            "--format",
            "json",
        ])
        .unwrap();
        assert_eq!(args.tests, vec!["T1", "T7"]);
        assert_eq!(args.java.as_deref(), Some("java -Xmx4g"));
        assert!(matches!(args.format, OutputFormat::Json));
    }

    #[test]
    fn test_args_reject_unsupported_model() {
        assert!(Args::try_parse_from(["parser-accuracy-eval", "--model", "gpt-4"]).is_err());
        assert!(Args::try_parse_from(["parser-accuracy-eval"]).is_err());
    }

    #[test]
    fn test_load_settings() {
        assert_eq!(load_settings(None).unwrap().parser.timeout_secs, 30);

        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("settings.toml");
        assert!(matches!(
            load_settings(Some(missing.as_path())),
            Err(RunError::InputNotFound(_))
        ));

        std::fs::write(&missing, "[parser]\ntimeout_secs = 5\n").unwrap();
        assert_eq!(load_settings(Some(missing.as_path())).unwrap().parser.timeout_secs, 5);
    }
}
