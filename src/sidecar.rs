//! Newline-delimited JSON protocol for driving a node from another process.
//!
//! Each input line is one [`Command`]; each output line is one [`Response`].
//! Keys are looked up in the [`LimitCatalog`], which stands in for the
//! database the verification service would otherwise load them from.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::KeygateError;
use crate::ratelimit::{
    EvaluationResult, LeaseOutcome, LimitCatalog, LimitRequest, RateLimiter,
};

/// One request line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Command {
    Verify(VerifyCommand),
    IssueLease(IssueLeaseCommand),
    CommitLease(CommitLeaseCommand),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyCommand {
    pub key_id: String,
    #[serde(default)]
    pub ratelimits: Vec<LimitRequest>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssueLeaseCommand {
    pub key_id: String,
    pub ratelimit: LimitRequest,
    pub timeout_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitLeaseCommand {
    pub workspace_id: String,
    pub lease: String,
    pub actual_cost: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Malformed,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

/// One response line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    Error { error: ErrorBody },
    Lease(LeaseOutcome),
    Evaluation(EvaluationResult),
}

impl Response {
    fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Response::Error {
            error: ErrorBody {
                kind,
                message: message.into(),
            },
        }
    }
}

impl From<KeygateError> for Response {
    fn from(err: KeygateError) -> Self {
        let kind = match &err {
            KeygateError::Validation(_) => ErrorKind::Validation,
            KeygateError::NotFound(_) => ErrorKind::NotFound,
            _ => ErrorKind::Internal,
        };
        Response::error(kind, err.to_string())
    }
}

/// Executes commands against a limiter and a catalog.
#[derive(Debug)]
pub struct Sidecar {
    limiter: RateLimiter,
    catalog: LimitCatalog,
}

impl Sidecar {
    pub fn new(limiter: RateLimiter, catalog: LimitCatalog) -> Self {
        Self { limiter, catalog }
    }

    /// Parse and execute one input line.
    pub fn handle_line(&self, line: &str) -> Response {
        match serde_json::from_str::<Command>(line) {
            Ok(command) => self.handle(command),
            Err(e) => {
                warn!(error = %e, "Malformed sidecar command");
                Response::error(ErrorKind::Malformed, e.to_string())
            }
        }
    }

    /// Execute a parsed command.
    pub fn handle(&self, command: Command) -> Response {
        let result = match command {
            Command::Verify(cmd) => self.verify(cmd).map(Response::Evaluation),
            Command::IssueLease(cmd) => self.issue_lease(cmd).map(Response::Lease),
            Command::CommitLease(cmd) => self
                .limiter
                .commit_lease(&cmd.workspace_id, &cmd.lease, cmd.actual_cost)
                .map(Response::Evaluation),
        };
        result.unwrap_or_else(|e| {
            debug!(error = %e, "Sidecar command rejected");
            e.into()
        })
    }

    fn verify(&self, cmd: VerifyCommand) -> crate::error::Result<EvaluationResult> {
        let ctx = self
            .catalog
            .key(&cmd.key_id)
            .ok_or_else(|| KeygateError::NotFound(format!("key '{}'", cmd.key_id)))?;
        self.limiter.evaluate(ctx, &cmd.ratelimits)
    }

    fn issue_lease(&self, cmd: IssueLeaseCommand) -> crate::error::Result<LeaseOutcome> {
        let ctx = self
            .catalog
            .key(&cmd.key_id)
            .ok_or_else(|| KeygateError::NotFound(format!("key '{}'", cmd.key_id)))?;
        self.limiter.issue_lease(ctx, &cmd.ratelimit, cmd.timeout_ms)
    }
}
