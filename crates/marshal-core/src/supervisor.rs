//! Process supervisor.
//!
//! Keeps the long-running component loops alive as child processes. Each
//! tracked process gets a sliding window of restart timestamps; once the
//! window holds `max_restarts` entries the process is flagged exhausted and
//! left down for an operator — a crash-looping component never takes the
//! supervisor down with it.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::{Child, Command};
use tracing::{error, info, warn};

use crate::error::{MarshalError, Result};
use crate::runtime::Shutdown;

// ---------------------------------------------------------------------------
// ProcessSpec / ProcessStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub max_restarts: u32,
    pub restart_window: Duration,
    pub restart_on_failure: bool,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args,
            max_restarts: 3,
            restart_window: Duration::from_secs(300),
            restart_on_failure: true,
        }
    }

    pub fn with_restart_policy(mut self, max_restarts: u32, restart_window: Duration) -> Self {
        self.max_restarts = max_restarts;
        self.restart_window = restart_window;
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessStatus {
    pub name: String,
    pub pid: Option<u32>,
    pub running: bool,
    pub restarts_in_window: usize,
    pub exhausted: bool,
}

// ---------------------------------------------------------------------------
// Supervisor
// ---------------------------------------------------------------------------

struct Supervised {
    spec: ProcessSpec,
    child: Option<Child>,
    restart_timestamps: VecDeque<Instant>,
    exhausted: bool,
}

impl Supervised {
    /// Prune timestamps older than the window, bounding crash-loop
    /// accounting to the trailing window only.
    fn prune_window(&mut self) {
        let window = self.spec.restart_window;
        while let Some(front) = self.restart_timestamps.front() {
            if front.elapsed() >= window {
                self.restart_timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn is_running(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(None) => true,
                Ok(Some(_)) | Err(_) => false,
            },
            None => false,
        }
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SupervisorReport {
    pub running: usize,
    pub restarted: Vec<String>,
    pub exhausted: Vec<String>,
}

pub struct Supervisor {
    procs: Vec<Supervised>,
    settle_delay: Duration,
}

impl Supervisor {
    pub fn new(settle_delay: Duration) -> Self {
        Self {
            procs: Vec::new(),
            settle_delay,
        }
    }

    pub fn add_process(&mut self, spec: ProcessSpec) {
        info!(name = %spec.name, command = %spec.command, "process tracked");
        self.procs.push(Supervised {
            spec,
            child: None,
            restart_timestamps: VecDeque::new(),
            exhausted: false,
        });
    }

    /// Spawn every tracked process that isn't already running. Initial
    /// starts don't count against the restart window.
    pub async fn start_all(&mut self) -> Result<()> {
        for idx in 0..self.procs.len() {
            if !self.procs[idx].is_running() {
                self.spawn(idx).await?;
            }
        }
        Ok(())
    }

    /// One supervision pass: restart dead processes still inside their
    /// restart budget, flag the rest exhausted.
    pub async fn check_and_restart(&mut self) -> Result<SupervisorReport> {
        let mut report = SupervisorReport::default();
        for idx in 0..self.procs.len() {
            self.procs[idx].prune_window();

            if self.procs[idx].is_running() {
                report.running += 1;
                continue;
            }
            if self.procs[idx].exhausted {
                report.exhausted.push(self.procs[idx].spec.name.clone());
                continue;
            }
            if !self.procs[idx].spec.restart_on_failure {
                continue;
            }

            let name = self.procs[idx].spec.name.clone();
            let in_window = self.procs[idx].restart_timestamps.len();
            if in_window >= self.procs[idx].spec.max_restarts as usize {
                error!(
                    name = %name,
                    restarts = in_window,
                    window_seconds = self.procs[idx].spec.restart_window.as_secs(),
                    "restart budget exhausted, leaving process down"
                );
                self.procs[idx].exhausted = true;
                report.exhausted.push(name);
                continue;
            }

            warn!(name = %name, "process not running, restarting");
            self.stop(idx).await;
            tokio::time::sleep(self.settle_delay).await;
            self.procs[idx].restart_timestamps.push_back(Instant::now());
            self.spawn(idx).await?;
            report.restarted.push(name);
            report.running += 1;
        }
        Ok(report)
    }

    /// Clear the exhausted flag and window after operator intervention.
    pub fn reset(&mut self, name: &str) -> Result<()> {
        let proc = self
            .procs
            .iter_mut()
            .find(|p| p.spec.name == name)
            .ok_or_else(|| MarshalError::ProcessNotFound(name.to_string()))?;
        proc.exhausted = false;
        proc.restart_timestamps.clear();
        Ok(())
    }

    pub fn status(&mut self) -> Vec<ProcessStatus> {
        (0..self.procs.len())
            .map(|idx| {
                self.procs[idx].prune_window();
                let running = self.procs[idx].is_running();
                let proc = &self.procs[idx];
                ProcessStatus {
                    name: proc.spec.name.clone(),
                    pid: proc.child.as_ref().and_then(|c| c.id()),
                    running,
                    restarts_in_window: proc.restart_timestamps.len(),
                    exhausted: proc.exhausted,
                }
            })
            .collect()
    }

    pub async fn stop_all(&mut self) {
        for idx in 0..self.procs.len() {
            self.stop(idx).await;
        }
    }

    async fn spawn(&mut self, idx: usize) -> Result<()> {
        let spec = &self.procs[idx].spec;
        let child = Command::new(&spec.command)
            .args(&spec.args)
            .spawn()
            .map_err(|e| {
                error!(name = %spec.name, error = %e, "failed to spawn process");
                MarshalError::Io(e)
            })?;
        info!(name = %spec.name, pid = child.id(), "process started");
        self.procs[idx].child = Some(child);
        Ok(())
    }

    async fn stop(&mut self, idx: usize) {
        if let Some(mut child) = self.procs[idx].child.take() {
            // Best-effort kill; the process may already be gone.
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    /// The component loop: supervise until shutdown, then stop children.
    pub async fn run(mut self, mut shutdown: Shutdown, check_interval: Duration) -> Result<()> {
        self.start_all().await?;
        let mut ticker = tokio::time::interval(check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.check_and_restart().await {
                        warn!(error = %e, "supervision pass failed");
                    }
                }
                _ = shutdown.triggered() => {
                    info!("supervisor stopping, terminating children");
                    self.stop_all().await;
                    return Ok(());
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
