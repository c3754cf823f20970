//! Supervised worker
//!
//! A [`Worker`] wraps either an external process or an in-process task with
//! the same three operations: observe exit, read why it exited, terminate.
//! A supervising task owns the child or join handle; callers only see the
//! tokens it signals.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Max stderr kept from a worker process
const MAX_STDERR_SIZE: usize = 64 * 1024;

/// Handle to a supervised process or task
///
/// Cloning shares the same underlying worker.
#[derive(Clone)]
pub struct Worker {
    name: Arc<str>,
    terminate: CancellationToken,
    exited: CancellationToken,
    exit_reason: Arc<parking_lot::RwLock<Option<String>>>,
}

impl Worker {
    /// Supervise a spawned process. On terminate it gets SIGTERM, then a
    /// kill once `grace` has passed.
    ///
    /// If the child was spawned with piped stderr, the last stderr line is
    /// folded into the exit reason.
    pub fn process(name: impl Into<String>, mut child: Child, grace: Duration) -> Self {
        let worker = Self::new(name.into());
        let supervisor = worker.clone();

        let stderr_task = child.stderr.take().map(|mut stderr| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if buf.len() < MAX_STDERR_SIZE {
                                buf.extend_from_slice(&chunk[..n]);
                            }
                        }
                    }
                }
                buf
            })
        });

        tokio::spawn(async move {
            let pid = child.id();
            debug!("Worker {} started (pid {:?})", supervisor.name, pid);

            let (status, terminated) = tokio::select! {
                status = child.wait() => (status, false),
                _ = supervisor.terminate.cancelled() => {
                    send_terminate(&mut child, pid);
                    let status = match tokio::time::timeout(grace, child.wait()).await {
                        Ok(status) => status,
                        Err(_) => {
                            warn!("Worker {} ignored SIGTERM, killing", supervisor.name);
                            let _ = child.kill().await;
                            child.wait().await
                        }
                    };
                    (status, true)
                }
            };

            let stderr = match stderr_task {
                Some(task) => task.await.unwrap_or_default(),
                None => Vec::new(),
            };
            let last_line = String::from_utf8_lossy(&stderr)
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .last()
                .map(str::to_string);

            let reason = match (terminated, status) {
                (true, _) => "terminated".to_string(),
                (false, Ok(status)) => match last_line {
                    Some(line) => format!("exited with {}: {}", status, line),
                    None => format!("exited with {}", status),
                },
                (false, Err(e)) => format!("wait failed: {}", e),
            };
            supervisor.finish(reason);
        });

        worker
    }

    /// Supervise an in-process task. Terminate aborts it.
    pub fn task<F>(name: impl Into<String>, future: F) -> Self
    where
        F: Future<Output = Result<(), String>> + Send + 'static,
    {
        let worker = Self::new(name.into());
        let supervisor = worker.clone();
        let mut handle: JoinHandle<Result<(), String>> = tokio::spawn(future);

        tokio::spawn(async move {
            let reason = tokio::select! {
                result = &mut handle => match result {
                    Ok(Ok(())) => "finished".to_string(),
                    Ok(Err(e)) => format!("failed: {}", e),
                    Err(e) => format!("panicked: {}", e),
                },
                _ = supervisor.terminate.cancelled() => {
                    handle.abort();
                    let _ = handle.await;
                    "terminated".to_string()
                }
            };
            supervisor.finish(reason);
        });

        worker
    }

    fn new(name: String) -> Self {
        Self {
            name: name.into(),
            terminate: CancellationToken::new(),
            exited: CancellationToken::new(),
            exit_reason: Arc::new(parking_lot::RwLock::new(None)),
        }
    }

    fn finish(&self, reason: String) {
        info!("Worker {} {}", self.name, reason);
        *self.exit_reason.write() = Some(reason);
        self.exited.cancel();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resolves once the worker has exited for any reason
    pub async fn exited(&self) {
        self.exited.cancelled().await
    }

    pub fn has_exited(&self) -> bool {
        self.exited.is_cancelled()
    }

    /// Why the worker exited, once it has
    pub fn exit_reason(&self) -> Option<String> {
        self.exit_reason.read().clone()
    }

    /// Ask the worker to stop and wait until it has
    pub async fn terminate(&self) {
        self.terminate.cancel();
        self.exited().await;
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child, pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = pid.and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
        debug!("SIGTERM to {} failed: {}, killing", pid, e);
        let _ = child.start_kill();
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child, _pid: Option<u32>) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_worker_reports_failure() {
        let worker = Worker::task("failing", async { Err("boom".to_string()) });
        worker.exited().await;
        assert!(worker.has_exited());
        assert_eq!(worker.exit_reason().as_deref(), Some("failed: boom"));
    }

    #[tokio::test]
    async fn test_task_worker_terminate() {
        let worker = Worker::task("idle", std::future::pending());
        assert!(!worker.has_exited());
        worker.terminate().await;
        assert_eq!(worker.exit_reason().as_deref(), Some("terminated"));
        // A second terminate returns immediately
        worker.terminate().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_worker_captures_stderr() {
        let child = tokio::process::Command::new("sh")
            .args(["-c", "echo 'bind failed' >&2; exit 3"])
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let worker = Worker::process("sh", child, Duration::from_millis(500));
        worker.exited().await;
        let reason = worker.exit_reason().unwrap();
        assert!(reason.contains("bind failed"), "{}", reason);
        assert!(reason.contains('3'), "{}", reason);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_worker_terminate() {
        let child = tokio::process::Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();

        let worker = Worker::process("sleep", child, Duration::from_secs(2));
        tokio::time::timeout(Duration::from_secs(5), worker.terminate())
            .await
            .unwrap();
        assert_eq!(worker.exit_reason().as_deref(), Some("terminated"));
    }
}
