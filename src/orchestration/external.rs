//! Advisor backed by an external program.
//!
//! The program is started once per call with the configured arguments plus
//! the operation name (`evaluate` or `plan`). It reads one JSON request on
//! stdin and must write one JSON response on stdout:
//!
//! ```text
//! evaluate  <- {"op":"evaluate","payload":{...}}
//!           -> {"struggling":["web"],"donors":["api"],"notes":[]}
//! plan      <- {"op":"plan","assessment":{...}}
//!           -> {"directives":[{"worker":"cy","source":"api","destination":"web","reason":"..."}]}
//! ```
//!
//! Either response may instead carry `{"error": "..."}`. The child is killed
//! when its call is cancelled or abandoned.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::core::TeamId;
use crate::error::{Error, Result};
use crate::orchestration::advisor::{Advisor, Assessment, BorrowDirective, HealthPayload, Plan};
use crate::tlog_debug;

#[derive(Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Request<'a> {
    Evaluate { payload: &'a HealthPayload },
    Plan { assessment: &'a Assessment },
}

impl Request<'_> {
    fn op(&self) -> &'static str {
        match self {
            Request::Evaluate { .. } => "evaluate",
            Request::Plan { .. } => "plan",
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawAssessment {
    #[serde(default)]
    struggling: Vec<TeamId>,
    #[serde(default)]
    donors: Vec<TeamId>,
    #[serde(default)]
    notes: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    directives: Vec<BorrowDirective>,
    #[serde(default)]
    notes: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CommandAdvisor {
    binary: PathBuf,
    args: Vec<String>,
}

impl CommandAdvisor {
    /// Resolve `program` on `PATH`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdvisorBinaryNotFound`] if it cannot be found.
    pub fn new(program: &str, args: &[String]) -> Result<Self> {
        let binary =
            which::which(program).map_err(|_| Error::AdvisorBinaryNotFound(program.to_string()))?;
        Ok(Self::with_binary(binary, args))
    }

    pub fn with_binary(binary: PathBuf, args: &[String]) -> Self {
        Self {
            binary,
            args: args.to_vec(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn call(&self, request: Request<'_>, cancel: CancellationToken) -> Result<String> {
        let input = serde_json::to_vec(&request)?;
        tlog_debug!(
            "CommandAdvisor: {} {} ({} bytes)",
            self.binary.display(),
            request.op(),
            input.len()
        );

        let mut child = Command::new(&self.binary)
            .args(&self.args)
            .arg(request.op())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take();
        let exchange = async move {
            if let Some(mut stdin) = stdin {
                if let Err(e) = stdin.write_all(&input).await {
                    // The program may exit without reading its input.
                    if e.kind() != std::io::ErrorKind::BrokenPipe {
                        return Err(Error::Io(e));
                    }
                }
            }
            child.wait_with_output().await.map_err(Error::Io)
        };

        // Dropping the exchange drops the child, which kills it.
        let output = tokio::select! {
            output = exchange => output?,
            _ = cancel.cancelled() => {
                return Err(Error::Advisor(format!("{} cancelled", request.op())));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = if stderr.trim().is_empty() {
                format!(
                    "advisor exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Err(Error::Advisor(message));
        }
        Ok(stdout)
    }

    /// Parse an `evaluate` response.
    pub fn parse_assessment(json: &str, payload: HealthPayload) -> Result<Assessment> {
        let raw: RawAssessment = serde_json::from_str(json)?;
        if let Some(error) = raw.error {
            return Err(Error::Advisor(error));
        }
        Ok(Assessment {
            cycle: payload.cycle,
            struggling: raw.struggling,
            donors: raw.donors,
            notes: raw.notes,
            payload,
        })
    }

    /// Parse a `plan` response.
    pub fn parse_plan(json: &str) -> Result<Plan> {
        let raw: RawPlan = serde_json::from_str(json)?;
        if let Some(error) = raw.error {
            return Err(Error::Advisor(error));
        }
        Ok(Plan {
            directives: raw.directives,
            notes: raw.notes,
        })
    }
}

impl Advisor for CommandAdvisor {
    fn name(&self) -> &str {
        "command"
    }

    fn evaluate(
        &self,
        payload: HealthPayload,
        cancel: CancellationToken,
    ) -> BoxFuture<'static, Result<Assessment>> {
        let advisor = self.clone();
        Box::pin(async move {
            let stdout = advisor
                .call(Request::Evaluate { payload: &payload }, cancel)
                .await?;
            Self::parse_assessment(&stdout, payload)
        })
    }

    fn plan(&self, assessment: Assessment, cancel: CancellationToken) -> BoxFuture<'static, Result<Plan>> {
        let advisor = self.clone();
        Box::pin(async move {
            let stdout = advisor
                .call(Request::Plan { assessment: &assessment }, cancel)
                .await?;
            Self::parse_plan(&stdout)
        })
    }
}
