//! Local process backend for workers
//!
//! Each worker is a child process exposing a small HTTP surface:
//! a health/activity endpoint, a log tail endpoint and a kill endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use super::runtime::{ProcessRef, WorkerRuntime};
use crate::config::RuntimeConfig;
use crate::domain::WorkerActivity;
use crate::error::{Result, RuntimeError};

/// Bound on the kill request sent before signalling the process
const KILL_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

struct WorkerProcess {
    child: Child,
    pid: Option<u32>,
    port: u16,
    base_url: Url,
}

#[derive(Debug, Deserialize)]
struct LogResponse {
    #[serde(default)]
    logs: Vec<String>,
}

pub struct ProcessRuntime {
    config: RuntimeConfig,
    client: reqwest::Client,
    processes: Mutex<HashMap<Uuid, WorkerProcess>>,
}

impl ProcessRuntime {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        let client = reqwest::Client::builder().build()?;
        Ok(Self {
            config,
            client,
            processes: Mutex::new(HashMap::new()),
        })
    }

    fn build_command(&self, agent_id: &str, port: u16) -> Command {
        let mut cmd = Command::new(&self.config.command);
        let port_str = port.to_string();

        for arg in &self.config.args {
            cmd.arg(substitute(arg, agent_id, &port_str));
        }

        cmd.env("MAYA_AGENT_ID", agent_id)
            .env("MAYA_WORKER_PORT", &port_str)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn endpoint(&self, base: &Url, path: &str) -> std::result::Result<Url, RuntimeError> {
        base.join(path)
            .map_err(|e| RuntimeError::Unreachable(format!("bad endpoint {}{}: {}", base, path, e)))
    }

    async fn base_url(&self, process: &ProcessRef) -> std::result::Result<Url, RuntimeError> {
        let mut processes = self.processes.lock().await;
        let worker = processes
            .get_mut(&process.instance_id())
            .ok_or_else(|| RuntimeError::UnknownProcess(process.to_string()))?;

        if let Ok(Some(status)) = worker.child.try_wait() {
            return Err(RuntimeError::Unreachable(format!(
                "process exited with {}",
                status
            )));
        }
        Ok(worker.base_url.clone())
    }

    async fn request_exit(&self, base_url: &Url) -> bool {
        let url = match self.endpoint(base_url, &self.config.kill_path) {
            Ok(url) => url,
            Err(_) => return false,
        };
        match self
            .client
            .post(url)
            .timeout(KILL_REQUEST_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Kill request to {} failed: {}", base_url, e);
                false
            }
        }
    }
}

/// Lowest port at or above `base` not held by a live worker and free to bind
/// on `host`. Another process may still grab it before the worker binds.
fn allocate_port(
    host: &str,
    base: u16,
    processes: &HashMap<Uuid, WorkerProcess>,
) -> Option<u16> {
    (base..=u16::MAX).find(|port| {
        processes.values().all(|w| w.port != *port)
            && std::net::TcpListener::bind((host, *port)).is_ok()
    })
}

fn substitute(arg: &str, agent_id: &str, port: &str) -> String {
    arg.replace("{agent_id}", agent_id).replace("{port}", port)
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!("SIGTERM to {} failed: {}", pid, e);
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32) {}

#[async_trait]
impl WorkerRuntime for ProcessRuntime {
    async fn spawn(&self, agent_id: &str) -> std::result::Result<ProcessRef, RuntimeError> {
        let mut processes = self.processes.lock().await;

        let port = allocate_port(&self.config.host, self.config.base_port, &processes)
            .ok_or_else(|| RuntimeError::SpawnFailed("no free worker port".to_string()))?;
        let base_url = Url::parse(&format!("http://{}:{}/", self.config.host, port))
            .map_err(|e| RuntimeError::SpawnFailed(format!("bad worker address: {}", e)))?;

        let child = self
            .build_command(agent_id, port)
            .spawn()
            .map_err(|e| RuntimeError::SpawnFailed(format!("{} (port {})", e, port)))?;
        let pid = child.id();

        let process = ProcessRef::new(agent_id);
        info!(
            "Spawned worker {} (pid {:?}) on {}",
            process, pid, base_url
        );
        processes.insert(
            process.instance_id(),
            WorkerProcess {
                child,
                pid,
                port,
                base_url,
            },
        );
        Ok(process)
    }

    async fn health_check(
        &self,
        process: &ProcessRef,
        timeout: Duration,
    ) -> std::result::Result<WorkerActivity, RuntimeError> {
        let base_url = self.base_url(process).await?;
        let url = self.endpoint(&base_url, &self.config.health_path)?;

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RuntimeError::Timeout {
                        elapsed_ms: timeout.as_millis() as u64,
                    }
                } else {
                    RuntimeError::Unreachable(format!("{}: {}", base_url, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RuntimeError::BadStatus(status.as_u16()));
        }

        // The activity body is informational; a healthy answer without one still counts
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        Ok(parse_activity(&body))
    }

    async fn terminate(
        &self,
        process: &ProcessRef,
        grace: Duration,
    ) -> std::result::Result<(), RuntimeError> {
        let worker = self.processes.lock().await.remove(&process.instance_id());
        let Some(mut worker) = worker else {
            debug!("Terminate for unknown worker {}, nothing to do", process);
            return Ok(());
        };

        if !self.request_exit(&worker.base_url).await {
            if let Some(pid) = worker.pid {
                send_sigterm(pid);
            }
        }

        match tokio::time::timeout(grace, worker.child.wait()).await {
            Ok(Ok(status)) => {
                info!("Worker {} exited with {}", process, status);
                Ok(())
            }
            Ok(Err(e)) => Err(RuntimeError::TerminateFailed(e.to_string())),
            Err(_) => {
                warn!(
                    "Worker {} still alive after {:?}, killing",
                    process, grace
                );
                worker
                    .child
                    .kill()
                    .await
                    .map_err(|e| RuntimeError::TerminateFailed(e.to_string()))
            }
        }
    }

    async fn logs(
        &self,
        process: &ProcessRef,
        timeout: Duration,
    ) -> std::result::Result<Vec<String>, RuntimeError> {
        let base_url = self.base_url(process).await?;
        let url = self.endpoint(&base_url, &self.config.log_path)?;

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))?;
        if !response.status().is_success() {
            return Err(RuntimeError::BadStatus(response.status().as_u16()));
        }

        let body: LogResponse = response
            .json()
            .await
            .map_err(|e| RuntimeError::Unreachable(format!("unreadable log response: {}", e)))?;
        Ok(body.logs)
    }
}

/// Pull activity fields out of a worker's probe body
///
/// Accepts `{"opportunity": {"name": ...}, "runtime_hrs": .., "roi_hrs": ..}`
/// or a plain string opportunity.
pub fn parse_activity(body: &serde_json::Value) -> WorkerActivity {
    let opportunity = match body.get("opportunity") {
        Some(serde_json::Value::String(name)) => Some(name.clone()),
        Some(value) => value
            .get("name")
            .and_then(|n| n.as_str())
            .map(str::to_string),
        None => None,
    };

    WorkerActivity {
        opportunity,
        runtime_hrs: body.get("runtime_hrs").and_then(|v| v.as_f64()),
        roi_hrs: body.get("roi_hrs").and_then(|v| v.as_f64()),
    }
}
