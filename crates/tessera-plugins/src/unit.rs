//! Isolated execution units hosting plugin workers.
//!
//! An inline unit is a dedicated tokio task that owns its worker and drains
//! a mailbox one call at a time; a panic inside the worker stops that unit
//! only. A process unit is a child process spoken to over stdio, which also
//! contains crashes and memory faults.
//!
//! Either kind is torn down with [`ExecutionUnit::terminate`].

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, anyhow};
use futures_util::FutureExt;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::RpcError;
use crate::protocol::{self, Request, Response};
use crate::rpc::{Envelope, RpcProxy};
use crate::worker::{self, WorkerModule};

/// How a unit isolates its worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Inline,
    Process,
}

impl std::fmt::Display for UnitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inline => f.write_str("inline"),
            Self::Process => f.write_str("process"),
        }
    }
}

/// Owning handle to a running execution unit
pub struct ExecutionUnit {
    id: Uuid,
    plugin_id: String,
    kind: UnitKind,
    task: AbortHandle,
    terminated: Arc<AtomicBool>,
}

impl ExecutionUnit {
    fn new(id: Uuid, plugin_id: &str, kind: UnitKind, task: AbortHandle) -> Self {
        Self {
            id,
            plugin_id: plugin_id.to_string(),
            kind,
            task,
            terminated: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn kind(&self) -> UnitKind {
        self.kind
    }

    /// Stop the unit. Returns `true` only for the call that actually
    /// terminated it; later calls are no-ops.
    ///
    /// Aborting the driving task drops the worker, or for process units the
    /// child handle, which kills the process.
    pub fn terminate(&self) -> bool {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }

        self.task.abort();
        info!(
            plugin_id = %self.plugin_id,
            unit_id = %self.id,
            kind = %self.kind,
            "Execution unit terminated"
        );
        true
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    /// Whether the unit stopped, either by termination or on its own
    pub fn has_exited(&self) -> bool {
        self.task.is_finished()
    }

    /// Shareable view of the termination flag
    pub fn monitor(&self) -> UnitMonitor {
        UnitMonitor {
            id: self.id,
            terminated: Arc::clone(&self.terminated),
        }
    }
}

impl Drop for ExecutionUnit {
    fn drop(&mut self) {
        if !self.is_terminated() {
            warn!(
                plugin_id = %self.plugin_id,
                unit_id = %self.id,
                "Execution unit dropped while running"
            );
            self.terminate();
        }
    }
}

impl std::fmt::Debug for ExecutionUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionUnit")
            .field("id", &self.id)
            .field("plugin_id", &self.plugin_id)
            .field("kind", &self.kind)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Read-only observer of a unit's termination state
#[derive(Debug, Clone)]
pub struct UnitMonitor {
    id: Uuid,
    terminated: Arc<AtomicBool>,
}

impl UnitMonitor {
    pub fn unit_id(&self) -> Uuid {
        self.id
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Host `module` on a dedicated task
pub fn spawn_inline(plugin_id: &str, module: Box<dyn WorkerModule>) -> (ExecutionUnit, RpcProxy) {
    let unit_id = Uuid::new_v4();
    let (proxy, mailbox) = RpcProxy::channel(plugin_id);
    let handle = tokio::spawn(run_inline(plugin_id.to_string(), unit_id, module, mailbox));

    debug!(plugin_id, unit_id = %unit_id, "Spawned inline execution unit");
    let unit = ExecutionUnit::new(unit_id, plugin_id, UnitKind::Inline, handle.abort_handle());
    (unit, proxy)
}

async fn run_inline(
    plugin_id: String,
    unit_id: Uuid,
    mut module: Box<dyn WorkerModule>,
    mut mailbox: mpsc::Receiver<Envelope>,
) {
    while let Some(Envelope {
        method,
        params,
        reply,
    }) = mailbox.recv().await
    {
        trace!(plugin_id = %plugin_id, method = %method, "Inline call");

        let outcome = AssertUnwindSafe(worker::dispatch(module.as_mut(), &method, params))
            .catch_unwind()
            .await;

        match outcome {
            Ok(result) => {
                let _ = reply.send(result);
            }
            Err(_) => {
                error!(
                    plugin_id = %plugin_id,
                    unit_id = %unit_id,
                    method = %method,
                    "Worker panicked, stopping execution unit"
                );
                let _ = reply.send(Err(RpcError::remote(
                    "panic",
                    format!("worker panicked while handling '{method}'"),
                )));
                break;
            }
        }
    }

    debug!(plugin_id = %plugin_id, unit_id = %unit_id, "Inline execution unit stopped");
}

/// Start `program` as a child process speaking the stdio protocol
pub fn spawn_process(
    plugin_id: &str,
    program: &Path,
    args: &[String],
    working_dir: Option<&Path>,
) -> anyhow::Result<(ExecutionUnit, RpcProxy)> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    if let Some(dir) = working_dir {
        command.current_dir(dir);
    }

    let mut child = command
        .spawn()
        .with_context(|| format!("failed to spawn {}", program.display()))?;

    let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
        (Some(stdin), Some(stdout)) => (stdin, stdout),
        _ => {
            let _ = child.start_kill();
            return Err(anyhow!("failed to capture stdio of {}", program.display()));
        }
    };

    let unit_id = Uuid::new_v4();
    let (proxy, mailbox) = RpcProxy::channel(plugin_id);
    info!(
        plugin_id,
        unit_id = %unit_id,
        pid = child.id(),
        program = %program.display(),
        "Spawned worker process"
    );

    let handle = tokio::spawn(run_process(
        plugin_id.to_string(),
        unit_id,
        child,
        stdin,
        stdout,
        mailbox,
    ));
    let unit = ExecutionUnit::new(unit_id, plugin_id, UnitKind::Process, handle.abort_handle());
    Ok((unit, proxy))
}

async fn run_process(
    plugin_id: String,
    unit_id: Uuid,
    mut child: Child,
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    mut mailbox: mpsc::Receiver<Envelope>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut pending: HashMap<u64, oneshot::Sender<Result<Value, RpcError>>> = HashMap::new();
    let mut next_id: u64 = 1;

    loop {
        tokio::select! {
            envelope = mailbox.recv() => {
                let Some(Envelope { method, params, reply }) = envelope else {
                    debug!(plugin_id = %plugin_id, "All proxies dropped");
                    break;
                };

                let id = next_id;
                next_id += 1;
                let request = Request::new(id, method, params);

                match protocol::write_message(&mut stdin, &request).await {
                    Ok(()) => {
                        pending.insert(id, reply);
                    }
                    Err(e) => {
                        warn!(plugin_id = %plugin_id, error = %e, "Failed to write to worker");
                        let _ = reply.send(Err(RpcError::Closed));
                        break;
                    }
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<Response>(&line) {
                            Ok(response) => match pending.remove(&response.id) {
                                Some(reply) => {
                                    let _ = reply.send(response.into_result());
                                }
                                None => {
                                    debug!(plugin_id = %plugin_id, id = response.id, "Response for unknown request");
                                }
                            },
                            Err(_) => {
                                trace!(plugin_id = %plugin_id, line = %line, "Ignoring non-protocol output");
                            }
                        }
                    }
                    Ok(None) => {
                        debug!(plugin_id = %plugin_id, "Worker closed stdout");
                        break;
                    }
                    Err(e) => {
                        warn!(plugin_id = %plugin_id, error = %e, "Failed to read from worker");
                        break;
                    }
                }
            }
        }
    }

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(RpcError::Closed));
    }

    let _ = child.start_kill();
    debug!(plugin_id = %plugin_id, unit_id = %unit_id, "Process execution unit stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RpcError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    use crate::manifest::Settings;

    struct Fragile {
        drops: Arc<AtomicUsize>,
    }

    impl Drop for Fragile {
        fn drop(&mut self) {
            self.drops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl WorkerModule for Fragile {
        async fn set_settings(&mut self, _settings: Settings) -> Result<(), RpcError> {
            Ok(())
        }

        async fn initialize(&mut self) -> Result<(), RpcError> {
            Ok(())
        }

        async fn get_data(&mut self) -> Result<Value, RpcError> {
            Ok(json!("alive"))
        }

        async fn invoke(&mut self, operation: &str, _params: Value) -> Result<Value, RpcError> {
            match operation {
                "explode" => panic!("boom"),
                "stall" => std::future::pending().await,
                other => Err(RpcError::UnsupportedOperation(other.to_string())),
            }
        }
    }

    fn fragile() -> (Box<dyn WorkerModule>, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        let module = Box::new(Fragile {
            drops: Arc::clone(&drops),
        });
        (module, drops)
    }

    #[tokio::test]
    async fn inline_unit_answers_calls() {
        let (module, _) = fragile();
        let (unit, proxy) = spawn_inline("fragile", module);

        assert_eq!(proxy.get_data().await.unwrap(), json!("alive"));
        assert_eq!(unit.kind(), UnitKind::Inline);
        assert!(unit.terminate());
    }

    #[tokio::test]
    async fn panic_stops_only_that_unit() {
        let (first, _) = fragile();
        let (second, _) = fragile();
        let (unit_a, proxy_a) = spawn_inline("a", first);
        let (unit_b, proxy_b) = spawn_inline("b", second);

        let err = proxy_a.call("explode", Value::Null).await.unwrap_err();
        assert!(matches!(err, RpcError::Remote { ref code, .. } if code == "panic"));
        assert!(matches!(proxy_a.get_data().await, Err(RpcError::Closed)));

        assert_eq!(proxy_b.get_data().await.unwrap(), json!("alive"));

        unit_a.terminate();
        unit_b.terminate();
    }

    #[tokio::test]
    async fn terminate_is_exactly_once() {
        let (module, drops) = fragile();
        let (unit, proxy) = spawn_inline("fragile", module);
        proxy.initialize().await.unwrap();

        assert!(unit.terminate());
        assert!(!unit.terminate());
        assert!(unit.is_terminated());

        let err = proxy.get_data().await.unwrap_err();
        assert!(matches!(err, RpcError::Closed));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn terminate_releases_stalled_callers() {
        let (module, _) = fragile();
        let (unit, proxy) = spawn_inline("fragile", module);

        let stalled = tokio::spawn({
            let proxy = proxy.clone();
            async move { proxy.call("stall", Value::Null).await }
        });
        tokio::task::yield_now().await;

        unit.terminate();
        let result = stalled.await.unwrap();
        assert!(matches!(result, Err(RpcError::Closed)));
    }

    #[tokio::test]
    async fn dropping_a_running_unit_terminates_it() {
        let (module, _) = fragile();
        let (unit, _proxy) = spawn_inline("fragile", module);
        let monitor = unit.monitor();

        drop(unit);
        assert!(monitor.is_terminated());
    }

    #[tokio::test]
    async fn spawning_a_missing_program_fails() {
        let result = spawn_process(
            "ghost",
            Path::new("/definitely/not/a/worker"),
            &[],
            None,
        );
        assert!(result.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_unit_round_trips_requests() {
        let script = r#"while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9]*\).*/\1/p')
  printf '{"id":%s,"result":"pong"}\n' "$id"
done"#;
        let (unit, proxy) = spawn_process(
            "shell",
            Path::new("/bin/sh"),
            &["-c".to_string(), script.to_string()],
            None,
        )
        .unwrap();

        assert_eq!(proxy.call("ping", Value::Null).await.unwrap(), json!("pong"));
        assert_eq!(proxy.get_data().await.unwrap(), json!("pong"));
        assert_eq!(unit.kind(), UnitKind::Process);

        assert!(unit.terminate());
        assert!(matches!(proxy.get_data().await, Err(RpcError::Closed)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_exit_closes_pending_calls() {
        let (unit, proxy) = spawn_process(
            "quitter",
            Path::new("/bin/sh"),
            &["-c".to_string(), "read -r line; exit 0".to_string()],
            None,
        )
        .unwrap();

        let result = proxy.initialize().await;
        assert!(matches!(result, Err(RpcError::Closed)));
        unit.terminate();
    }
}
