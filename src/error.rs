use std::path::PathBuf;

/// Process exit codes
pub mod codes {
    /// Every selected case passed.
    pub const SUCCESS: u8 = 0;
    /// A required input file is missing, or an argument is unusable.
    pub const INPUT_NOT_FOUND: u8 = 2;
    /// Configuration or runtime failure before cases could run.
    pub const RUNTIME_ERROR: u8 = 3;
    /// No test case matched the selection.
    pub const NO_CASES: u8 = 4;
    /// At least one case failed comparison.
    pub const CASES_FAILED: u8 = 5;
}

/// Failures that abort the whole run
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("input file not found: {0}")]
    InputNotFound(PathBuf),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no matching test cases to execute")]
    NoCasesSelected,

    #[error(transparent)]
    Runtime(#[from] anyhow::Error),
}

impl RunError {
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::InputNotFound(_) | RunError::InvalidArgument(_) => codes::INPUT_NOT_FOUND,
            RunError::NoCasesSelected => codes::NO_CASES,
            RunError::Runtime(_) => codes::RUNTIME_ERROR,
        }
    }
}
