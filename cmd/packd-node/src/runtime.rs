//! Pack execution on this host.
//!
//! The sandbox proper is outside the control plane's concern; this runtime
//! executes a pack's entrypoint as a child process of the agent, tracks
//! every run, and reports lifecycle events. A graceful stop sends SIGTERM
//! and escalates to SIGKILL after the grace deadline.

use dashmap::DashMap;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use pkg_constants::channel::GRACEFUL_STOP_SECS;
use pkg_types::error::Error;
use pkg_types::protocol::DeployPayload;

/// Lifecycle signals surfaced to the agent loop for `pod:status:update`.
#[derive(Debug)]
pub enum RunEvent {
    Started { pod_id: Uuid, pid: u32 },
    /// The process ended on its own.
    Exited { pod_id: Uuid, code: Option<i32> },
    /// The process ended because we asked it to.
    Stopped { pod_id: Uuid },
    Failed { pod_id: Uuid, reason: String },
}

struct RunHandle {
    pid: u32,
    stop: CancellationToken,
    graceful: Arc<std::sync::atomic::AtomicBool>,
}

pub struct ProcessRuntime {
    base_dir: PathBuf,
    interpreter: String,
    events: mpsc::Sender<RunEvent>,
    runs: Arc<DashMap<Uuid, RunHandle>>,
}

impl ProcessRuntime {
    pub fn new(base_dir: PathBuf, interpreter: String) -> (Self, mpsc::Receiver<RunEvent>) {
        let (events, events_rx) = mpsc::channel(64);
        (
            Self {
                base_dir,
                interpreter,
                events,
                runs: Arc::new(DashMap::new()),
            },
            events_rx,
        )
    }

    pub fn running(&self) -> u32 {
        self.runs.len() as u32
    }

    /// Materialize the bundle and start the pack. The spawned monitor task
    /// owns the child and emits [`RunEvent`]s until it ends.
    pub async fn launch(&self, deploy: &DeployPayload) -> Result<u32, Error> {
        let pod_id = deploy.pod_id;
        let bytes = deploy
            .pack
            .decode_bytes()
            .map_err(|e| Error::Validation(format!("bundle bytes: {e}")))?
            .ok_or_else(|| Error::Validation("deploy carried no bundle bytes".into()))?;

        let dir = self.base_dir.join("pods").join(pod_id.to_string());
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| Error::Validation(format!("workdir {}: {e}", dir.display())))?;
        let entrypoint = if deploy.pack.metadata.entrypoint.is_empty() {
            "main.js".to_string()
        } else {
            deploy.pack.metadata.entrypoint.clone()
        };
        tokio::fs::write(dir.join(&entrypoint), &bytes)
            .await
            .map_err(|e| Error::Validation(format!("write bundle: {e}")))?;

        let mut child = tokio::process::Command::new(&self.interpreter)
            .arg(&entrypoint)
            .envs(&deploy.env)
            .current_dir(&dir)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Validation(format!("spawn {}: {e}", self.interpreter)))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::Validation("child exited before it had a pid".into()))?;

        let stop = CancellationToken::new();
        let graceful = Arc::new(std::sync::atomic::AtomicBool::new(true));
        self.runs.insert(
            pod_id,
            RunHandle {
                pid,
                stop: stop.clone(),
                graceful: graceful.clone(),
            },
        );
        info!(pod = %pod_id, pid, "pack started");
        let _ = self.events.send(RunEvent::Started { pod_id, pid }).await;

        let events = self.events.clone();
        let runs = self.runs.clone();
        let timeout = deploy.timeout_secs.map(Duration::from_secs);
        tokio::spawn(async move {
            let event = monitor(&mut child, pod_id, pid, stop, graceful, timeout).await;
            runs.remove(&pod_id);
            let _ = events.send(event).await;
        });
        Ok(pid)
    }

    /// Ask a running pack to stop. Returns whether it was known.
    pub fn stop(&self, pod_id: Uuid, graceful: bool) -> bool {
        if let Some(handle) = self.runs.get(&pod_id) {
            handle
                .graceful
                .store(graceful, std::sync::atomic::Ordering::Release);
            handle.stop.cancel();
            true
        } else {
            false
        }
    }

    /// Stop everything; used on agent shutdown.
    pub fn stop_all(&self) {
        for entry in self.runs.iter() {
            entry.value().stop.cancel();
        }
    }
}

async fn monitor(
    child: &mut tokio::process::Child,
    pod_id: Uuid,
    pid: u32,
    stop: CancellationToken,
    graceful: Arc<std::sync::atomic::AtomicBool>,
    timeout: Option<Duration>,
) -> RunEvent {
    let deadline = async {
        match timeout {
            Some(t) => tokio::time::sleep(t).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        status = child.wait() => match status {
            Ok(status) => RunEvent::Exited {
                pod_id,
                code: status.code(),
            },
            Err(e) => RunEvent::Failed {
                pod_id,
                reason: format!("wait: {e}"),
            },
        },
        _ = stop.cancelled() => {
            if graceful.load(std::sync::atomic::Ordering::Acquire) {
                if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                    warn!(pod = %pod_id, error = %e, "SIGTERM failed");
                }
                if tokio::time::timeout(Duration::from_secs(GRACEFUL_STOP_SECS), child.wait())
                    .await
                    .is_err()
                {
                    warn!(pod = %pod_id, "grace period expired, killing");
                    let _ = child.kill().await;
                }
            } else {
                let _ = child.kill().await;
            }
            RunEvent::Stopped { pod_id }
        }
        _ = deadline => {
            warn!(pod = %pod_id, "pack exceeded its timeout");
            let _ = child.kill().await;
            RunEvent::Failed { pod_id, reason: "pack timeout exceeded".into() }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pkg_types::pack::PackMetadata;
    use pkg_types::protocol::DeployPack;
    use std::collections::HashMap;

    fn deploy(script: &str, timeout_secs: Option<u64>) -> DeployPayload {
        let mut metadata = PackMetadata::default();
        metadata.entrypoint = "main.sh".to_string();
        DeployPayload {
            pod_id: Uuid::new_v4(),
            pack: DeployPack::with_bytes(Uuid::new_v4(), "1.0.0".into(), script.as_bytes(), metadata),
            env: HashMap::new(),
            timeout_secs,
        }
    }

    fn runtime() -> (ProcessRuntime, mpsc::Receiver<RunEvent>) {
        let dir = std::env::temp_dir().join(format!("packd-test-{}", Uuid::new_v4()));
        ProcessRuntime::new(dir, "sh".to_string())
    }

    #[tokio::test]
    async fn pack_runs_and_exits_cleanly() {
        let (runtime, mut events) = runtime();
        let deploy = deploy("exit 0\n", None);
        runtime.launch(&deploy).await.unwrap();

        match events.recv().await.unwrap() {
            RunEvent::Started { pod_id, .. } => assert_eq!(pod_id, deploy.pod_id),
            other => panic!("expected Started, got {other:?}"),
        }
        match events.recv().await.unwrap() {
            RunEvent::Exited { code, .. } => assert_eq!(code, Some(0)),
            other => panic!("expected Exited, got {other:?}"),
        }
        assert_eq!(runtime.running(), 0);
    }

    #[tokio::test]
    async fn nonzero_exit_is_reported() {
        let (runtime, mut events) = runtime();
        runtime.launch(&deploy("exit 3\n", None)).await.unwrap();

        let _started = events.recv().await.unwrap();
        match events.recv().await.unwrap() {
            RunEvent::Exited { code, .. } => assert_eq!(code, Some(3)),
            other => panic!("expected Exited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn graceful_stop_terminates_the_pack() {
        let (runtime, mut events) = runtime();
        let deploy = deploy("sleep 30\n", None);
        runtime.launch(&deploy).await.unwrap();
        let _started = events.recv().await.unwrap();

        assert!(runtime.stop(deploy.pod_id, true));
        match events.recv().await.unwrap() {
            RunEvent::Stopped { pod_id } => assert_eq!(pod_id, deploy.pod_id),
            other => panic!("expected Stopped, got {other:?}"),
        }
        assert_eq!(runtime.running(), 0);
        assert!(!runtime.stop(deploy.pod_id, true), "run already gone");
    }

    #[tokio::test]
    async fn timeout_kills_the_pack() {
        let (runtime, mut events) = runtime();
        runtime.launch(&deploy("sleep 30\n", Some(1))).await.unwrap();
        let _started = events.recv().await.unwrap();

        match events.recv().await.unwrap() {
            RunEvent::Failed { reason, .. } => assert!(reason.contains("timeout")),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_bundle_bytes_fail_fast() {
        let (runtime, _events) = runtime();
        let mut deploy = deploy("exit 0\n", None);
        deploy.pack.bundle_bytes = None;
        assert!(runtime.launch(&deploy).await.is_err());
    }
}
