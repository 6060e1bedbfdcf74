use std::fmt;

/// Diagnostics carried alongside engine failures, keeping the raw response
/// body available to callers that log or persist it.
#[derive(Debug, Clone)]
pub struct EngineDiagnosticsError {
    pub stage: &'static str,
    pub detail: String,
    pub raw_body: Option<String>,
}

impl fmt::Display for EngineDiagnosticsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine error (stage={}): {}", self.stage, self.detail)
    }
}

impl std::error::Error for EngineDiagnosticsError {}
