//! Tool execution sandbox
//!
//! The validation + constrained-execution pipeline standing between an
//! untrusted remote argument set and local command execution:
//!
//! ```text
//! Received -> Validating -> (Rejected | Executing) -> (Completed | TimedOut | Error)
//! ```
//!
//! Terminal states are final; the sandbox never retries. Retry policy, if
//! any, belongs to the caller via a new relay request.

pub mod definition;
pub mod executor;
pub mod render;
pub mod validate;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::Error;

pub use definition::{
    ExecutionKind, ExecutionSpec, MAX_TIMEOUT_SECS, ParameterSpec, ParameterType, ToolDefinition,
    ToolParameters, ToolRegistry,
};
pub use executor::{DEFAULT_OUTPUT_CAP, ExecLimits, SAFE_PATH};

/// Marker appended to a capped output stream
const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Terminal disposition of one tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Exit 0 / HTTP 2xx
    Ok,
    /// Wall-clock budget exceeded; the process group was killed
    Timeout,
    /// Failed validation or sanitization; nothing was executed
    Rejected,
    /// Ran but failed (nonzero exit, non-2xx status, transport failure)
    Error,
}

/// What one tool invocation produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Tool that was invoked
    pub tool_name: String,

    /// Terminal disposition
    pub outcome: Outcome,

    /// Exit code for script tools that ran to completion
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_status: Option<i32>,

    /// Status code for HTTP tools that got a response
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,

    /// Captured stdout or response body (size-capped)
    pub stdout: String,

    /// Captured stderr, or the rejection/error message (size-capped)
    pub stderr: String,

    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

impl ExecutionResult {
    fn rejected(tool_name: &str, reason: &str) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            outcome: Outcome::Rejected,
            exit_status: None,
            http_status: None,
            stdout: String::new(),
            stderr: reason.to_string(),
            duration_ms: 0,
        }
    }

    /// HTTP-equivalent status code for relaying this result
    #[must_use]
    pub const fn status_code(&self) -> u16 {
        match self.outcome {
            Outcome::Ok => 200,
            Outcome::Timeout => 504,
            Outcome::Rejected => 422,
            Outcome::Error => 502,
        }
    }
}

/// Sandbox configuration knobs
#[derive(Debug, Clone)]
pub struct SandboxLimits {
    /// Captured-output byte cap per stream
    pub output_cap: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            output_cap: DEFAULT_OUTPUT_CAP,
        }
    }
}

/// The sandbox: a tool registry plus execution constraints
pub struct Sandbox {
    registry: Arc<ToolRegistry>,
    limits: SandboxLimits,
}

impl Sandbox {
    /// Create a sandbox over a loaded tool registry
    #[must_use]
    pub fn new(registry: Arc<ToolRegistry>, limits: SandboxLimits) -> Self {
        Self { registry, limits }
    }

    /// The registry backing this sandbox
    #[must_use]
    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run a named tool with caller-supplied arguments
    ///
    /// Infallible by design: every failure mode reduces to an
    /// [`ExecutionResult`] so the caller always has a terminal answer to
    /// relay back.
    pub async fn run(&self, tool_name: &str, supplied: &Map<String, Value>) -> ExecutionResult {
        // Received -> Validating
        let Some(def) = self.registry.get(tool_name) else {
            return ExecutionResult::rejected(tool_name, &format!("unknown tool: {tool_name}"));
        };

        let args = match validate::validate_args(&def, supplied) {
            Ok(args) => args,
            Err(e) => return ExecutionResult::rejected(tool_name, &e.to_string()),
        };

        // Validating -> Executing (or Rejected inside the renderer)
        match def.execution.kind {
            ExecutionKind::Script => self.run_script_tool(&def, &args).await,
            ExecutionKind::Http => self.run_http_tool(&def, &args).await,
        }
    }

    async fn run_script_tool(
        &self,
        def: &ToolDefinition,
        args: &std::collections::BTreeMap<String, Value>,
    ) -> ExecutionResult {
        let template = def.execution.command.as_deref().unwrap_or_default();

        let argv = match render::render_command(template, args) {
            Ok(argv) => argv,
            Err(e) => return ExecutionResult::rejected(&def.name, &e.to_string()),
        };

        if let Err(e) = render::check_denylist(&argv.join(" ")) {
            tracing::warn!(tool = %def.name, error = %e, "destructive command rejected");
            return ExecutionResult::rejected(&def.name, &e.to_string());
        }

        let limits = ExecLimits {
            timeout: def.execution.effective_timeout(),
            output_cap: self.limits.output_cap,
        };

        tracing::debug!(tool = %def.name, ?limits.timeout, "executing script tool");

        match executor::run_script(&argv, &limits).await {
            Ok(out) => {
                let outcome = if out.timed_out {
                    Outcome::Timeout
                } else if out.exit_code == Some(0) {
                    Outcome::Ok
                } else {
                    Outcome::Error
                };

                ExecutionResult {
                    tool_name: def.name.clone(),
                    outcome,
                    exit_status: out.exit_code,
                    http_status: None,
                    stdout: capped_string(&out.stdout, out.stdout_truncated),
                    stderr: capped_string(&out.stderr, out.stderr_truncated),
                    duration_ms: duration_ms(out.duration),
                }
            }
            Err(e) => ExecutionResult {
                tool_name: def.name.clone(),
                outcome: Outcome::Error,
                exit_status: None,
                http_status: None,
                stdout: String::new(),
                stderr: e.to_string(),
                duration_ms: 0,
            },
        }
    }

    async fn run_http_tool(
        &self,
        def: &ToolDefinition,
        args: &std::collections::BTreeMap<String, Value>,
    ) -> ExecutionResult {
        let template = def.execution.url.as_deref().unwrap_or_default();

        let url = match render::render_url(template, args) {
            Ok(url) => url,
            Err(e) => return ExecutionResult::rejected(&def.name, &e.to_string()),
        };

        let method = def.execution.method.as_deref().unwrap_or("GET");
        let headers = def.execution.headers.clone().unwrap_or_default();
        let limits = ExecLimits {
            timeout: def.execution.effective_timeout(),
            output_cap: self.limits.output_cap,
        };

        tracing::debug!(tool = %def.name, %url, "executing http tool");

        match executor::run_http(&url, method, &headers, None, &limits).await {
            Ok(out) => {
                let outcome = if (200..300).contains(&out.status) {
                    Outcome::Ok
                } else {
                    Outcome::Error
                };

                ExecutionResult {
                    tool_name: def.name.clone(),
                    outcome,
                    exit_status: None,
                    http_status: Some(out.status),
                    stdout: capped_string(&out.body, out.truncated),
                    stderr: String::new(),
                    duration_ms: duration_ms(out.duration),
                }
            }
            Err(Error::Timeout(message)) => ExecutionResult {
                tool_name: def.name.clone(),
                outcome: Outcome::Timeout,
                exit_status: None,
                http_status: None,
                stdout: String::new(),
                stderr: message,
                duration_ms: duration_ms(def.execution.effective_timeout()),
            },
            Err(e) => ExecutionResult {
                tool_name: def.name.clone(),
                outcome: Outcome::Error,
                exit_status: None,
                http_status: None,
                stdout: String::new(),
                stderr: e.to_string(),
                duration_ms: 0,
            },
        }
    }
}

fn capped_string(bytes: &[u8], truncated: bool) -> String {
    let mut text = String::from_utf8_lossy(bytes).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    text
}

#[allow(clippy::cast_possible_truncation)]
fn duration_ms(duration: std::time::Duration) -> u64 {
    duration.as_millis() as u64
}
