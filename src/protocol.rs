use crate::config::ParserContext;
use crate::evaluation::TextGenerator;
use crate::models::{ExecutionResult, ExecutionStatus, ParsedRecord, PromptExchange, TestCase};
use anyhow::{Context, Result, bail};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// Which parser invocation of a case
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Heuristic pass
    First,
    /// Pass carrying model responses
    Second,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::First => f.write_str("stage1"),
            Stage::Second => f.write_str("stage2"),
        }
    }
}

/// A parser invocation that produced no usable response
#[derive(Debug, thiserror::Error)]
pub enum InvocationError {
    #[error("failed to launch parser process '{program}': {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode parser request: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to exchange data with parser process: {0}")]
    Io(#[source] std::io::Error),

    #[error("parser timed out after {0:?}")]
    Timeout(Duration),

    #[error(
        "parser exited with code {}",
        .code.map_or_else(|| "none (terminated by signal)".to_string(), |c| c.to_string())
    )]
    NonZeroExit { code: Option<i32> },

    #[error("parser produced no output")]
    EmptyOutput,

    #[error("failed to parse parser JSON output: {0}")]
    InvalidJson(#[source] serde_json::Error),

    #[error("parser output must be a JSON object")]
    NotAnObject,
}

/// Request written to the parser's stdin
#[derive(Debug, Serialize)]
pub struct ParserRequest<'a> {
    pub utterance: &'a str,
    pub context: &'a ParserContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_responses: Option<&'a BTreeMap<String, String>>,
}

/// Status reported at the top of a parser response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParserStatus {
    Complete,
    NeedsAi,
    Error,
    Other(String),
}

impl ParserStatus {
    fn from_label(label: &str) -> Self {
        match label {
            "complete" => ParserStatus::Complete,
            "needs_ai" => ParserStatus::NeedsAi,
            "error" => ParserStatus::Error,
            other => ParserStatus::Other(other.to_string()),
        }
    }

    pub fn label(&self) -> &str {
        match self {
            ParserStatus::Complete => "complete",
            ParserStatus::NeedsAi => "needs_ai",
            ParserStatus::Error => "error",
            ParserStatus::Other(label) => label,
        }
    }
}

/// A field the parser wants the model to disambiguate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptRequest {
    pub field: String,
    pub prompt: String,
}

/// Decoded JSON object from the parser's stdout
///
/// Fields are read leniently: a key holding the wrong JSON type is treated as absent.
#[derive(Debug, Clone, PartialEq)]
pub struct ParserResponse {
    data: Map<String, Value>,
}

impl ParserResponse {
    pub fn from_stdout(stdout: &str) -> Result<Self, InvocationError> {
        match serde_json::from_str::<Value>(stdout).map_err(InvocationError::InvalidJson)? {
            Value::Object(data) => Ok(Self { data }),
            _ => Err(InvocationError::NotAnObject),
        }
    }

    pub fn field(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    fn object(&self, key: &str) -> Option<Map<String, Value>> {
        self.field(key).and_then(Value::as_object).cloned()
    }

    fn text(&self, key: &str) -> Option<String> {
        self.field(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    pub fn status(&self) -> ParserStatus {
        match self.field("status").and_then(Value::as_str) {
            Some(label) => ParserStatus::from_label(label),
            None => ParserStatus::Other("unknown".to_string()),
        }
    }

    pub fn parsed(&self) -> Option<ParsedRecord> {
        self.object("parsed")
    }

    pub fn stats(&self) -> Option<Map<String, Value>> {
        self.object("stats")
    }

    pub fn heuristic_results(&self) -> Option<Map<String, Value>> {
        self.object("heuristic_results")
    }

    pub fn method(&self) -> Option<String> {
        self.text("method")
    }

    pub fn message(&self) -> Option<String> {
        self.text("message")
    }

    /// Prompt entries with a non-empty field and prompt, in response order
    pub fn prompts_needed(&self) -> Vec<PromptRequest> {
        let Some(entries) = self.field("prompts_needed").and_then(Value::as_array) else {
            return Vec::new();
        };

        entries
            .iter()
            .filter_map(|entry| {
                let field = entry.get("field").and_then(Value::as_str)?.trim();
                let prompt = entry.get("prompt").and_then(Value::as_str)?.trim();
                if field.is_empty() || prompt.is_empty() {
                    return None;
                }
                Some(PromptRequest {
                    field: field.to_string(),
                    prompt: prompt.to_string(),
                })
            })
            .collect()
    }
}

/// One request, one response exchange with the parser
pub trait ParserTransport {
    async fn invoke(&self, request: &ParserRequest<'_>) -> Result<ParserResponse, InvocationError>;
}

/// Runs the parser as a fresh subprocess per request
#[derive(Debug, Clone)]
pub struct ParserProcess {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ParserProcess {
    /// Process launched as `command...`
    pub fn new(command: &[String], timeout: Duration) -> Result<Self> {
        let Some((program, args)) = command.split_first() else {
            bail!("parser launch command is empty");
        };
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            timeout,
        })
    }

    /// Process launched as `launch_command... -jar <artifact>`
    pub fn for_artifact(launch_command: &[String], artifact: &Path, timeout: Duration) -> Result<Self> {
        let mut command = launch_command.to_vec();
        command.push("-jar".to_string());
        command.push(artifact.display().to_string());
        Self::new(&command, timeout)
    }
}

impl ParserTransport for ParserProcess {
    async fn invoke(&self, request: &ParserRequest<'_>) -> Result<ParserResponse, InvocationError> {
        let payload = serde_json::to_string(request).map_err(InvocationError::Encode)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| InvocationError::Launch {
                program: self.program.clone(),
                source,
            })?;

        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A parser that exits without reading is judged by its exit status
                match stdin.write_all(payload.as_bytes()).await {
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
            }
            Ok(())
        };

        // stdin is fed while stdout and stderr drain, so large payloads cannot deadlock
        let exchange = async move {
            let (fed, output) = tokio::join!(feed, child.wait_with_output());
            fed.map_err(InvocationError::Io)?;
            output.map_err(InvocationError::Io)
        };

        // Dropping the exchange on timeout kills the child
        let output = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| InvocationError::Timeout(self.timeout))??;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!("parser stderr: {}", stderr.trim());
        }

        if !output.status.success() {
            return Err(InvocationError::NonZeroExit {
                code: output.status.code(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() {
            return Err(InvocationError::EmptyOutput);
        }

        ParserResponse::from_stdout(stdout)
    }
}

/// Newest `*.jar` in `dir` by modification time
pub fn find_parser_artifact(dir: &Path) -> Result<PathBuf> {
    if !dir.is_dir() {
        bail!(
            "Parser artifact directory not found: {}. Build the parser jar first.",
            dir.display()
        );
    }

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
    {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jar") {
            continue;
        }
        let modified = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        if newest.as_ref().is_none_or(|(time, _)| modified > *time) {
            newest = Some((modified, path));
        }
    }

    match newest {
        Some((_, path)) => Ok(path),
        None => bail!(
            "No parser jar found in {}. Build the parser jar first.",
            dir.display()
        ),
    }
}

/// Where a case is in the two-stage exchange
#[derive(Debug)]
enum ProtocolState {
    Initial,
    AwaitingAi(Vec<PromptRequest>),
    Resolved(ParserResponse),
    Failed(ExecutionStatus),
}

/// Drives cases through the parser and, when asked, the text generator
pub struct CaseExecutor<'a, P, G> {
    transport: &'a P,
    generator: &'a G,
    context: &'a ParserContext,
    system_prompt: Option<&'a str>,
}

impl<'a, P: ParserTransport, G: TextGenerator> CaseExecutor<'a, P, G> {
    pub fn new(
        transport: &'a P,
        generator: &'a G,
        context: &'a ParserContext,
        system_prompt: Option<&'a str>,
    ) -> Self {
        Self {
            transport,
            generator,
            context,
            system_prompt,
        }
    }

    /// Run one case to a terminal result; failures are captured, never returned
    pub async fn execute(&self, case: &TestCase) -> ExecutionResult {
        let context = self.context.for_case(case.expected_date);
        let mut run = CaseRun::new(case.clone());
        let mut state = ProtocolState::Initial;

        loop {
            state = match state {
                ProtocolState::Initial => self.first_pass(&mut run, &context).await,
                ProtocolState::AwaitingAi(prompts) => {
                    self.second_pass(&mut run, &context, prompts).await
                }
                ProtocolState::Resolved(response) => return run.resolve(response),
                ProtocolState::Failed(status) => return run.fail(status),
            };
        }
    }

    async fn first_pass(&self, run: &mut CaseRun, context: &ParserContext) -> ProtocolState {
        let request = ParserRequest {
            utterance: &run.case.utterance,
            context,
            model_responses: None,
        };

        let response = match self.transport.invoke(&request).await {
            Ok(response) => response,
            Err(e) => return run.cli_error(Stage::First, &e),
        };

        run.heuristic_stats = response.stats();
        run.heuristic_results = response.heuristic_results();

        match response.status() {
            ParserStatus::Error => run.reported_error(&response),
            ParserStatus::NeedsAi => {
                let prompts = response.prompts_needed();
                debug!(
                    "case {} needs AI for {} field(s)",
                    run.case.identifier,
                    prompts.len()
                );
                ProtocolState::AwaitingAi(prompts)
            }
            _ => ProtocolState::Resolved(response),
        }
    }

    async fn second_pass(
        &self,
        run: &mut CaseRun,
        context: &ParserContext,
        prompts: Vec<PromptRequest>,
    ) -> ProtocolState {
        let mut model_responses = BTreeMap::new();

        for PromptRequest { field, prompt } in prompts {
            match self.generator.generate(&prompt, self.system_prompt).await {
                Ok(text) => {
                    model_responses.insert(field.clone(), text.clone());
                    run.prompts.push(PromptExchange {
                        field,
                        prompt,
                        response: Some(text),
                    });
                }
                Err(e) => {
                    run.errors
                        .push(format!("Model inference failed for field '{}': {:#}", field, e));
                    run.prompts.push(PromptExchange {
                        field,
                        prompt,
                        response: None,
                    });
                    return ProtocolState::Failed(ExecutionStatus::ModelError);
                }
            }
        }

        let request = ParserRequest {
            utterance: &run.case.utterance,
            context,
            model_responses: (!model_responses.is_empty()).then_some(&model_responses),
        };

        match self.transport.invoke(&request).await {
            Ok(response) if response.status() == ParserStatus::Error => {
                run.reported_error(&response)
            }
            Ok(response) => ProtocolState::Resolved(response),
            Err(e) => run.cli_error(Stage::Second, &e),
        }
    }
}

/// State accumulated while one case runs
struct CaseRun {
    case: TestCase,
    prompts: Vec<PromptExchange>,
    errors: Vec<String>,
    heuristic_results: Option<Map<String, Value>>,
    heuristic_stats: Option<Map<String, Value>>,
}

impl CaseRun {
    fn new(case: TestCase) -> Self {
        Self {
            case,
            prompts: Vec::new(),
            errors: Vec::new(),
            heuristic_results: None,
            heuristic_stats: None,
        }
    }

    fn cli_error(&mut self, stage: Stage, error: &InvocationError) -> ProtocolState {
        info!("case {} failed at {}: {}", self.case.identifier, stage, error);
        self.errors.push(format!("CLI error ({}): {}", stage, error));
        ProtocolState::Failed(ExecutionStatus::CliError)
    }

    fn reported_error(&mut self, response: &ParserResponse) -> ProtocolState {
        self.errors.push(
            response
                .message()
                .unwrap_or_else(|| "CLI reported error".to_string()),
        );
        ProtocolState::Failed(ExecutionStatus::CliError)
    }

    fn resolve(self, response: ParserResponse) -> ExecutionResult {
        let status = match response.status() {
            ParserStatus::Complete => ExecutionStatus::Complete,
            other => ExecutionStatus::Unresolved {
                reported: other.label().to_string(),
            },
        };
        let parsed = if status.is_complete() {
            response.parsed()
        } else {
            None
        };

        ExecutionResult {
            case: self.case,
            status,
            parsed,
            method: response.method(),
            prompts: self.prompts,
            stats: response.stats().unwrap_or_default(),
            heuristic_results: self.heuristic_results,
            heuristic_stats: self.heuristic_stats,
            errors: self.errors,
        }
    }

    fn fail(self, status: ExecutionStatus) -> ExecutionResult {
        ExecutionResult {
            case: self.case,
            status,
            parsed: None,
            method: None,
            prompts: self.prompts,
            stats: Map::new(),
            heuristic_results: self.heuristic_results,
            heuristic_stats: self.heuristic_stats,
            errors: self.errors,
        }
    }
}
