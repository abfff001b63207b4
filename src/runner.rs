use crate::cases::parse_test_cases;
use crate::compare::compare_results;
use crate::config::{ParserContext, Settings};
use crate::error::RunError;
use crate::evaluation::{OpenAiGenerator, SupportedModel, TextGenerator};
use crate::metrics::compute_metrics;
use crate::models::{RunSummary, TestCase};
use crate::output::write_reports;
use crate::protocol::{CaseExecutor, ParserProcess, ParserTransport, find_parser_artifact};
use anyhow::Context;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// Everything one evaluation run needs from the command line
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub model: SupportedModel,
    pub test_cases: PathBuf,
    pub context: PathBuf,
    pub results_dir: PathBuf,
    /// Identifiers to run; empty means every case
    pub selected_ids: Vec<String>,
    /// Parser jar; the newest jar in the artifact directory when absent
    pub artifact: Option<PathBuf>,
    /// Launch command override, split like a shell command line
    pub launch_command: Option<String>,
    pub settings: Settings,
}

/// Main runner that orchestrates the evaluation process
pub struct Runner {
    options: RunOptions,
}

impl Runner {
    pub fn new(options: RunOptions) -> Self {
        Self { options }
    }

    /// Run the selected cases against the parser jar and the configured model
    pub async fn run(&self) -> Result<RunSummary, RunError> {
        let launch_command = self.launch_command()?;
        let cases = self.select_cases()?;
        let context = ParserContext::load(&self.options.context);

        let artifact = self.resolve_artifact()?;
        info!("Using parser artifact {}", artifact.display());
        let transport = ParserProcess::for_artifact(
            &launch_command,
            &artifact,
            Duration::from_secs(self.options.settings.parser.timeout_secs),
        )?;
        let generator = OpenAiGenerator::new(&self.options.settings.model, self.options.model.id())?;

        self.evaluate(&cases, &context, &transport, &generator).await
    }

    /// Execute, compare and report on `cases` with the given collaborators
    pub async fn evaluate<P: ParserTransport, G: TextGenerator>(
        &self,
        cases: &[TestCase],
        context: &ParserContext,
        transport: &P,
        generator: &G,
    ) -> Result<RunSummary, RunError> {
        let executor = CaseExecutor::new(
            transport,
            generator,
            context,
            self.options.settings.model.system_prompt.as_deref(),
        );

        let total = cases.len();
        let mut executions = Vec::with_capacity(total);
        for (index, case) in cases.iter().enumerate() {
            info!("Running case {}/{}: {}", index + 1, total, case.identifier);
            let result = executor.execute(case).await;
            if !result.status.is_complete() {
                info!("Case {} ended with status {}", case.identifier, result.status);
            }
            executions.push(result);
        }

        let comparisons = compare_results(executions);
        let metrics = compute_metrics(&comparisons);
        let (results_path, summary_path) =
            write_reports(&comparisons, &metrics, &self.options.results_dir)?;

        Ok(RunSummary {
            model: self.options.model.id().to_string(),
            total_tests: metrics.total_tests,
            passed_tests: metrics.passed_tests,
            failed_tests: metrics.failed_tests(),
            results_path: results_path.display().to_string(),
            summary_path: summary_path.display().to_string(),
            failing_ids: comparisons
                .iter()
                .filter(|c| !c.overall_match)
                .map(|c| c.execution.case.identifier.clone())
                .collect(),
        })
    }

    /// Load the expectations table and apply the `--test` filter
    pub fn select_cases(&self) -> Result<Vec<TestCase>, RunError> {
        let path = &self.options.test_cases;
        if !path.is_file() {
            return Err(RunError::InputNotFound(path.clone()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read test cases: {}", path.display()))?;
        let cases = filter_cases(parse_test_cases(&content), &self.options.selected_ids);
        if cases.is_empty() {
            return Err(RunError::NoCasesSelected);
        }

        info!("Selected {} test case(s)", cases.len());
        Ok(cases)
    }

    fn launch_command(&self) -> Result<Vec<String>, RunError> {
        let raw = self
            .options
            .launch_command
            .as_deref()
            .unwrap_or(&self.options.settings.parser.launch_command);

        let Some(tokens) = shlex::split(raw) else {
            return Err(RunError::InvalidArgument(format!(
                "--java command has unbalanced quotes: {}",
                raw
            )));
        };
        if tokens.is_empty() {
            return Err(RunError::InvalidArgument(
                "--java command is empty after parsing".to_string(),
            ));
        }
        Ok(tokens)
    }

    fn resolve_artifact(&self) -> Result<PathBuf, RunError> {
        match &self.options.artifact {
            Some(path) if path.is_file() => Ok(path.clone()),
            Some(path) => Err(RunError::InputNotFound(path.clone())),
            None => Ok(find_parser_artifact(&self.options.settings.parser.artifact_dir)?),
        }
    }
}

/// Keep cases whose identifier was selected, in table order
fn filter_cases(cases: Vec<TestCase>, selected_ids: &[String]) -> Vec<TestCase> {
    let wanted: BTreeSet<&str> = selected_ids
        .iter()
        .map(|id| id.trim())
        .filter(|id| !id.is_empty())
        .collect();
    if wanted.is_empty() {
        return cases;
    }

    let filtered: Vec<TestCase> = cases
        .into_iter()
        .filter(|case| wanted.contains(case.identifier.as_str()))
        .collect();

    for id in &wanted {
        if !filtered.iter().any(|case| case.identifier == *id) {
            warn!("Test ID '{}' not found in test cases", id);
        }
    }

    filtered
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;
    use crate::protocol::{InvocationError, ParserRequest, ParserResponse};
    use anyhow::{Result, bail};
    use std::path::Path;
    use tempfile::tempdir;

    const TABLE: &str = "\
| ID | Input | Amount | Merchant |
|----|-------|--------|----------|
| T1 | coffee $4.50 | 4.50 | |
| T2 | crash please | 10 | |
| T3 | lunch $12 | 99 | |
";

    /// Parser stand-in: fails on utterances containing "crash", otherwise
    /// reports the amount written after `$`
    struct DollarParser;

    impl ParserTransport for DollarParser {
        async fn invoke(
            &self,
            request: &ParserRequest<'_>,
        ) -> Result<ParserResponse, InvocationError> {
            if request.utterance.contains("crash") {
                return Err(InvocationError::NonZeroExit { code: Some(1) });
            }
            let amount = request.utterance.split('$').nth(1).unwrap_or("0");
            let body = serde_json::json!({
                "status": "complete",
                "parsed": {"amountUsd": amount},
                "method": "HEURISTIC",
                "stats": {"total_ms": 5}
            });
            ParserResponse::from_stdout(&body.to_string())
        }
    }

    struct UnusedGenerator;

    impl TextGenerator for UnusedGenerator {
        async fn generate(&self, _prompt: &str, _system_prompt: Option<&str>) -> Result<String> {
            bail!("generator should not be called")
        }
    }

    fn options(dir: &Path) -> RunOptions {
        RunOptions {
            model: SupportedModel::Gemma3_1b,
            test_cases: dir.join("test_cases.md"),
            context: dir.join("config.json"),
            results_dir: dir.join("results"),
            selected_ids: vec![],
            artifact: None,
            launch_command: None,
            settings: Settings::default(),
        }
    }

    fn write_table(dir: &Path) {
        std::fs::write(dir.join("test_cases.md"), TABLE).unwrap();
    }

    #[test]
    fn test_missing_test_cases_file() {
        let dir = tempdir().unwrap();
        let runner = Runner::new(options(dir.path()));

        let err = runner.select_cases().unwrap_err();
        assert!(matches!(err, RunError::InputNotFound(_)));
        assert_eq!(err.exit_code(), codes::INPUT_NOT_FOUND);
    }

    #[test]
    fn test_selection_filters_and_trims_ids() {
        let dir = tempdir().unwrap();
        write_table(dir.path());
        let mut opts = options(dir.path());
        opts.selected_ids = vec![" T3 ".to_string(), "T1".to_string(), "NOPE".to_string()];

        let cases = Runner::new(opts).select_cases().unwrap();
        let ids: Vec<&str> = cases.iter().map(|c| c.identifier.as_str()).collect();
        assert_eq!(ids, vec!["T1", "T3"]);
    }

    #[test]
    fn test_blank_selection_keeps_every_case() {
        let dir = tempdir().unwrap();
        write_table(dir.path());
        let mut opts = options(dir.path());
        opts.selected_ids = vec!["  ".to_string()];

        assert_eq!(Runner::new(opts).select_cases().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unknown_selection_exits_before_running() {
        let dir = tempdir().unwrap();
        write_table(dir.path());
        let mut opts = options(dir.path());
        opts.selected_ids = vec!["T99".to_string()];
        opts.settings.parser.artifact_dir = dir.path().join("no-jars-here");

        let err = Runner::new(opts).run().await.unwrap_err();
        assert!(matches!(err, RunError::NoCasesSelected));
        assert_eq!(err.exit_code(), codes::NO_CASES);
        assert!(!dir.path().join("results").exists());
    }

    #[tokio::test]
    async fn test_missing_artifact_is_runtime_error() {
        let dir = tempdir().unwrap();
        write_table(dir.path());
        let mut opts = options(dir.path());
        opts.settings.parser.artifact_dir = dir.path().join("no-jars-here");

        let err = Runner::new(opts).run().await.unwrap_err();
        assert!(matches!(err, RunError::Runtime(_)));
        assert_eq!(err.exit_code(), codes::RUNTIME_ERROR);
    }

    #[tokio::test]
    async fn test_explicit_missing_jar_is_input_not_found() {
        let dir = tempdir().unwrap();
        write_table(dir.path());
        let mut opts = options(dir.path());
        opts.artifact = Some(dir.path().join("cli.jar"));

        let err = Runner::new(opts).run().await.unwrap_err();
        assert!(matches!(err, RunError::InputNotFound(_)));
    }

    #[tokio::test]
    async fn test_empty_launch_command_is_invalid() {
        let dir = tempdir().unwrap();
        write_table(dir.path());
        let mut opts = options(dir.path());
        opts.launch_command = Some("   ".to_string());

        let err = Runner::new(opts).run().await.unwrap_err();
        assert!(matches!(err, RunError::InvalidArgument(_)));
        assert_eq!(err.exit_code(), codes::INPUT_NOT_FOUND);
    }

    #[test]
    fn test_launch_command_shell_split() {
        let dir = tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.launch_command = Some(r#""/opt/My JDK/bin/java" -Xmx4g"#.to_string());

        let tokens = Runner::new(opts).launch_command().unwrap();
        assert_eq!(tokens, vec!["/opt/My JDK/bin/java", "-Xmx4g"]);
    }

    #[test]
    fn test_launch_command_unbalanced_quotes_is_invalid() {
        let dir = tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.launch_command = Some(r#""/opt/My JDK/bin/java -Xmx4g"#.to_string());

        let err = Runner::new(opts).launch_command().unwrap_err();
        assert!(matches!(err, RunError::InvalidArgument(_)));
        assert_eq!(err.exit_code(), codes::INPUT_NOT_FOUND);
    }

    #[test]
    fn test_launch_command_defaults_to_settings() {
        let dir = tempdir().unwrap();
        let mut opts = options(dir.path());
        opts.settings.parser.launch_command = "java -Xmx2g".to_string();

        let tokens = Runner::new(opts).launch_command().unwrap();
        assert_eq!(tokens, vec!["java", "-Xmx2g"]);
    }

    #[tokio::test]
    async fn test_evaluate_writes_reports_and_summary() {
        let dir = tempdir().unwrap();
        write_table(dir.path());
        let runner = Runner::new(options(dir.path()));
        let cases = runner.select_cases().unwrap();

        let summary = runner
            .evaluate(&cases, &ParserContext::default(), &DollarParser, &UnusedGenerator)
            .await
            .unwrap();

        assert_eq!(summary.model, "google/gemma-3-1b-it");
        assert_eq!(summary.total_tests, 3);
        assert_eq!(summary.passed_tests, 1);
        assert_eq!(summary.failed_tests, 2);
        assert_eq!(summary.failing_ids, vec!["T2", "T3"]);

        let results = std::fs::read_to_string(&summary.results_path).unwrap();
        assert!(results.contains("| T1 | coffee $4.50 | ✅ | HEURISTIC | 0 | ✅ 4.50 / 4.50 |"));
        assert!(results.contains("CLI error (stage1): parser exited with code 1"));
        assert!(results.contains("| ❌ 12 / 99 |"));

        let report = std::fs::read_to_string(&summary.summary_path).unwrap();
        assert!(report.contains("| Overall accuracy | 33.3% |"));
        assert!(report.contains("| Avg total time | 5.0 ms |"));
    }
}
