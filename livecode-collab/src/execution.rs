//! Shared code execution for a session.
//!
//! Any peer may submit code; the relay runs it through an [`Executor`] and
//! broadcasts one `execution-result` to every peer. At most one execution
//! runs per session:
//!
//! ```text
//! submit ──► slot free? ──no──► ExecutionBusy (requester only)
//!               │yes
//!               ├──► execution-status {executing}  (all peers)
//!               ▼
//!        executor.execute() bounded by timeout
//!               │
//!               ├──► execution-result {output, success}  (all peers)
//!               ▼
//!          slot released
//! ```
//!
//! The executor is untrusted; sandboxing is its own business. A requester
//! disconnecting does not cancel its execution.

use std::collections::BTreeMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::FutureExt;
use livecode_core::SiteId;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::config::{CommandSpec, ExecutionConfig};
use crate::protocol::{Envelope, ExecutionState};
use crate::registry::{RelayError, Session};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub code: String,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutput {
    pub output: String,
    /// Process exit code, `None` if killed by a signal
    pub exit_status: Option<i32>,
}

impl ExecutionOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

/// Runs submitted code.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutorError>;
}

/// Pipes code into a local interpreter and captures its output.
pub struct ProcessExecutor {
    languages: BTreeMap<String, CommandSpec>,
    default_language: String,
    max_output_bytes: usize,
}

impl ProcessExecutor {
    pub fn new(config: &ExecutionConfig) -> Self {
        Self {
            languages: config.languages.clone(),
            default_language: config.default_language.clone(),
            max_output_bytes: config.max_output_bytes,
        }
    }

    fn command_for(&self, language: Option<&str>) -> Result<&CommandSpec, ExecutorError> {
        let language = language.unwrap_or(self.default_language.as_str());
        self.languages
            .get(language)
            .ok_or_else(|| ExecutorError::UnsupportedLanguage(language.to_string()))
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn execute(&self, request: ExecutionRequest) -> Result<ExecutionOutput, ExecutorError> {
        let spec = self.command_for(request.language.as_deref())?;
        log::debug!("Running {} {:?}", spec.program, spec.args);

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        // Feed stdin concurrently so a chatty child cannot deadlock on a full pipe
        if let Some(mut stdin) = child.stdin.take() {
            let code = request.code.into_bytes();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&code).await {
                    log::debug!("Executor stdin closed early: {e}");
                }
            });
        }

        let limit = self.max_output_bytes.saturating_add(1);
        let (mut captured, stderr) = tokio::try_join!(
            read_capped(child.stdout.take(), limit),
            read_capped(child.stderr.take(), limit),
        )?;
        let status = child.wait().await?;
        captured.extend_from_slice(&stderr);

        Ok(ExecutionOutput {
            output: truncate_output(&captured, self.max_output_bytes),
            exit_status: status.code(),
        })
    }
}

/// Keep at most `limit` bytes of a stream and discard the rest, so the
/// child never blocks on a full pipe.
async fn read_capped<R>(reader: Option<R>, limit: usize) -> io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };
    let mut kept = Vec::new();
    (&mut reader).take(limit as u64).read_to_end(&mut kept).await?;
    let discarded = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await?;
    if discarded > 0 {
        log::debug!("Discarded {discarded} bytes of executor output");
    }
    Ok(kept)
}

fn truncate_output(bytes: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(bytes);
    if text.len() <= limit {
        return text.into_owned();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}\n[output truncated]", &text[..cut])
}

/// Releases the session's execution slot, even if the task unwinds.
struct SlotGuard(Arc<Session>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.finish_execution();
    }
}

pub struct ExecutionRelay {
    executor: Arc<dyn Executor>,
    timeout: Duration,
}

impl ExecutionRelay {
    pub fn new(executor: Arc<dyn Executor>, timeout: Duration) -> Self {
        Self { executor, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Start an execution for `requester`. Fails with `ExecutionBusy` if the
    /// session already has one in flight; the running one is unaffected.
    ///
    /// The returned handle resolves to the broadcast `(output, success)`.
    pub fn submit(
        &self,
        session: Arc<Session>,
        requester: SiteId,
        request: ExecutionRequest,
    ) -> Result<JoinHandle<(String, bool)>, RelayError> {
        if !session.try_begin_execution(requester) {
            log::info!("Rejected execution from {requester}: session {} busy", session.id());
            return Err(RelayError::ExecutionBusy(session.id()));
        }

        log::info!(
            "Executing {} bytes of {} for {requester} in session {}",
            request.code.len(),
            request.language.as_deref().unwrap_or("default"),
            session.id()
        );
        session.group().broadcast(Envelope::ExecutionStatus {
            state: ExecutionState::Executing,
            requester,
        });

        let executor = self.executor.clone();
        let timeout = self.timeout;
        Ok(tokio::spawn(async move {
            let guard = SlotGuard(session);
            let run = AssertUnwindSafe(executor.execute(request)).catch_unwind();
            let (output, success) = match tokio::time::timeout(timeout, run).await {
                Ok(Ok(Ok(result))) => {
                    let success = result.success();
                    let output = if !success && result.output.is_empty() {
                        match result.exit_status {
                            Some(code) => format!("Process exited with status {code}"),
                            None => "Process terminated by signal".to_string(),
                        }
                    } else {
                        result.output
                    };
                    (output, success)
                }
                Ok(Ok(Err(e))) => {
                    log::warn!("Execution failed: {e}");
                    (format!("Execution failed: {e}"), false)
                }
                Ok(Err(_)) => {
                    log::error!("Executor panicked in session {}", guard.0.id());
                    ("Execution failed: executor panicked".to_string(), false)
                }
                Err(_) => {
                    let e = ExecutorError::Timeout(timeout);
                    log::warn!("Execution {e}");
                    (format!("Execution {e}"), false)
                }
            };

            let delivered = guard.0.group().broadcast(Envelope::ExecutionResult {
                requester,
                output: output.clone(),
                success,
            });
            log::debug!("Execution result delivered to {delivered} peers");
            drop(guard);
            (output, success)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerInfo;
    use crate::registry::SessionRegistry;
    use uuid::Uuid;

    fn sh_executor() -> ProcessExecutor {
        let mut config = ExecutionConfig::default();
        config.languages.insert("sh".to_string(), CommandSpec::new("sh", &[]));
        config.default_language = "sh".to_string();
        config.max_output_bytes = 32;
        ProcessExecutor::new(&config)
    }

    fn request(code: &str) -> ExecutionRequest {
        ExecutionRequest {
            code: code.to_string(),
            language: None,
        }
    }

    #[test]
    fn test_truncate_on_char_boundary() {
        assert_eq!(truncate_output(b"short", 10), "short");
        let cut = truncate_output("ééééé".as_bytes(), 3);
        assert!(cut.starts_with('é'));
        assert!(cut.ends_with("[output truncated]"));
    }

    #[tokio::test]
    async fn test_process_executor_captures_output() {
        let result = sh_executor().execute(request("echo hello")).await.unwrap();
        assert_eq!(result.output, "hello\n");
        assert!(result.success());
    }

    #[tokio::test]
    async fn test_process_executor_reports_failure() {
        let result = sh_executor()
            .execute(request("echo oops >&2; exit 3"))
            .await
            .unwrap();
        assert_eq!(result.output, "oops\n");
        assert_eq!(result.exit_status, Some(3));
        assert!(!result.success());
    }

    #[tokio::test]
    async fn test_process_executor_truncates() {
        let result = sh_executor()
            .execute(request("i=0; while [ $i -lt 50 ]; do echo line; i=$((i+1)); done"))
            .await
            .unwrap();
        assert!(result.output.ends_with("[output truncated]"));
        assert!(result.output.len() < 64);
    }

    #[tokio::test]
    async fn test_process_executor_drains_past_the_limit() {
        // Far more than a pipe buffer: the child must not stall once we stop keeping output
        let result = sh_executor()
            .execute(request(
                "i=0; while [ $i -lt 20000 ]; do echo xxxxxxxxxxxxxxxx; i=$((i+1)); done; echo done >&2",
            ))
            .await
            .unwrap();
        assert!(result.success());
        assert!(result.output.starts_with("xxxx"));
        assert!(result.output.ends_with("[output truncated]"));
        assert!(result.output.len() < 64);
    }

    struct PanickingExecutor;

    #[async_trait]
    impl Executor for PanickingExecutor {
        async fn execute(&self, _request: ExecutionRequest) -> Result<ExecutionOutput, ExecutorError> {
            panic!("interpreter crashed");
        }
    }

    #[tokio::test]
    async fn test_executor_panic_still_reports_result() {
        let registry = SessionRegistry::new(10, 16);
        let id = registry.create_session();
        let session = registry.get(&id).unwrap();
        let ada = Uuid::new_v4();
        let (_token, mut outbox) = session.group().join(PeerInfo::new(ada, "ada"));

        let relay = ExecutionRelay::new(Arc::new(PanickingExecutor), Duration::from_secs(5));
        let handle = relay.submit(session.clone(), ada, request("boom")).unwrap();
        let (output, success) = handle.await.unwrap();
        assert!(!success);
        assert!(output.contains("panicked"));

        assert!(matches!(
            &*outbox.recv().await.unwrap(),
            Envelope::ExecutionStatus { requester, .. } if *requester == ada
        ));
        assert!(matches!(
            &*outbox.recv().await.unwrap(),
            Envelope::ExecutionResult { success: false, .. }
        ));
        // Slot is free again
        assert!(session.try_begin_execution(ada));
    }

    #[tokio::test]
    async fn test_unknown_language() {
        let err = sh_executor()
            .execute(ExecutionRequest {
                code: String::new(),
                language: Some("cobol".into()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::UnsupportedLanguage(lang) if lang == "cobol"));
    }
}
