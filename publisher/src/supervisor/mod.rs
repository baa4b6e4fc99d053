//! Lifecycle of local bot runtime processes.
//!
//! The [`ProcessSupervisor`] owns the registry of running bots. Every record
//! carries a launch generation; background watchers (stdout/stderr readers,
//! exit watcher, readiness probe) only touch the record they were created for,
//! so a stopped or replaced bot can never be mutated by a late callback.

pub mod kill;

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    process::{ExitStatus, Stdio},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use shared_types::{STATUS_FAILED, STATUS_RUNNING, STATUS_STARTING};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpStream,
    process::{Child, Command},
    sync::{watch, Mutex},
    task::JoinHandle,
    time::{sleep, timeout, Instant},
};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::{PublishError, Result};
use crate::port::PortAllocator;
use kill::{detach, kill_process_tree, KillOutcome, Signal};

const STDERR_MAX_LINES: usize = 200;
/// How long the exit watcher waits for stderr to drain before reporting.
const STDERR_DRAIN: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotState {
    Starting,
    Running,
    Failed,
}

impl BotState {
    /// HTTP-style status code reported to callers.
    pub fn code(self) -> u16 {
        match self {
            BotState::Starting => STATUS_STARTING,
            BotState::Running => STATUS_RUNNING,
            BotState::Failed => STATUS_FAILED,
        }
    }
}

impl std::fmt::Display for BotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BotState::Starting => write!(f, "starting"),
            BotState::Running => write!(f, "running"),
            BotState::Failed => write!(f, "failed"),
        }
    }
}

/// What to run for a bot. The per-port arguments are appended at spawn time.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    /// Port the runtime is pinned to; allocated when absent.
    pub port: Option<u16>,
}

/// Read-only view of a registry record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotStatus {
    pub bot_id: String,
    pub state: BotState,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitInfo {
    code: Option<i32>,
}

#[derive(Debug, Default)]
struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > STDERR_MAX_LINES {
            self.lines.pop_front();
        }
    }

    fn joined(&self) -> String {
        self.lines.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

struct BotProcessRecord {
    state: BotState,
    port: Option<u16>,
    pid: Option<u32>,
    message: String,
    generation: u64,
    stderr: Arc<Mutex<StderrTail>>,
    exited: Option<watch::Receiver<Option<ExitInfo>>>,
}

impl BotProcessRecord {
    fn status_only(state: BotState, message: String, generation: u64) -> Self {
        Self {
            state,
            port: None,
            pid: None,
            message,
            generation,
            stderr: Arc::new(Mutex::new(StderrTail::default())),
            exited: None,
        }
    }

    /// The process can no longer be waited on; release its pid and port.
    fn lose_track(&mut self, err: &std::io::Error) {
        self.pid = None;
        self.port = None;
        self.state = BotState::Failed;
        self.message = format!("Lost track of bot runtime: {err}");
    }

    fn snapshot(&self, bot_id: &str) -> BotStatus {
        BotStatus {
            bot_id: bot_id.to_string(),
            state: self.state,
            port: self.port,
            pid: self.pid,
            message: self.message.clone(),
        }
    }
}

/// Spawns, probes, and terminates bot runtimes; sole owner of the registry.
pub struct ProcessSupervisor {
    ports: PortAllocator,
    readiness_timeout: Duration,
    readiness_interval: Duration,
    stop_grace: Duration,
    /// bot_id → record
    registry: Mutex<HashMap<String, BotProcessRecord>>,
    next_generation: AtomicU64,
}

impl ProcessSupervisor {
    pub fn new(
        ports: PortAllocator,
        readiness_timeout: Duration,
        readiness_interval: Duration,
        stop_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            ports,
            readiness_timeout,
            readiness_interval,
            stop_grace,
            registry: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
        })
    }

    pub fn from_config(config: &Config) -> Arc<Self> {
        Self::new(
            PortAllocator::new(config.bot_port_default, config.bot_port_max),
            config.readiness_timeout,
            config.readiness_interval,
            config.stop_grace,
        )
    }

    fn generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Launch a runtime for `bot_id` and wait until it accepts TCP connections.
    ///
    /// Any live process for the bot is retired first. `args_for_port` supplies
    /// the arguments that depend on the port chosen for this launch.
    pub async fn start<F>(
        self: &Arc<Self>,
        bot_id: &str,
        spec: LaunchSpec,
        args_for_port: F,
    ) -> Result<u16>
    where
        F: FnOnce(u16) -> Vec<String>,
    {
        self.retire(bot_id).await?;

        let stderr = Arc::new(Mutex::new(StderrTail::default()));

        // Port choice and the STARTING record are published under one lock so
        // concurrent launches see each other's ports. Status and stop calls
        // wait out the port scan.
        let (generation, port) = {
            let mut registry = self.registry.lock().await;
            let port = match spec.port {
                Some(port) => port,
                None => {
                    let active: Vec<u16> = registry
                        .iter()
                        .filter(|(id, _)| id.as_str() != bot_id)
                        .filter_map(|(_, r)| r.port)
                        .collect();
                    self.ports.allocate(&active).await?
                }
            };
            let generation = self.generation();
            registry.insert(
                bot_id.to_string(),
                BotProcessRecord {
                    state: BotState::Starting,
                    port: Some(port),
                    pid: None,
                    message: format!("Starting bot runtime on port {port}"),
                    generation,
                    stderr: Arc::clone(&stderr),
                    exited: None,
                },
            );
            (generation, port)
        };

        let extra_args = args_for_port(port);
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .args(&extra_args)
            .current_dir(&spec.cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        detach(&mut cmd);

        let program = spec.program.display().to_string();
        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                error!(bot_id, port, program = %program, "failed to spawn bot runtime: {source}");
                let err = PublishError::ProcessSpawn { program, source };
                self.fail(bot_id, generation, err.to_string()).await;
                return Err(err);
            }
        };
        let pid = child.id();
        info!(bot_id, port, ?pid, program = %program, "bot runtime spawned");

        let stderr_task = self.capture_output(bot_id, &mut child, Arc::clone(&stderr));
        let (exit_tx, mut exit_rx) = watch::channel(None);

        {
            let mut registry = self.registry.lock().await;
            match registry.get_mut(bot_id) {
                Some(record) if record.generation == generation => {
                    record.pid = pid;
                    record.exited = Some(exit_rx.clone());
                }
                _ => {
                    drop(registry);
                    warn!(bot_id, "bot was stopped while its runtime was spawning; discarding process");
                    if let Some(pid) = pid {
                        signal_quietly(pid, Signal::Kill);
                    }
                    let _ = child.wait().await;
                    return Err(PublishError::Superseded(bot_id.to_string()));
                }
            }
        }

        {
            let this = Arc::clone(self);
            let id = bot_id.to_string();
            tokio::spawn(async move {
                let status = child.wait().await;
                if let Some(task) = stderr_task {
                    let _ = timeout(STDERR_DRAIN, task).await;
                }
                let code = match &status {
                    Ok(s) => s.code(),
                    Err(_) => None,
                };
                let _ = exit_tx.send(Some(ExitInfo { code }));
                this.on_exit(&id, generation, status).await;
            });
        }

        match self.wait_until_ready(port, &mut exit_rx, &stderr).await {
            Ok(()) => {
                let mut registry = self.registry.lock().await;
                match registry.get_mut(bot_id) {
                    Some(record) if record.generation == generation => {
                        record.state = BotState::Running;
                        record.message = "Running".to_string();
                        info!(bot_id, port, "bot runtime is ready");
                        Ok(port)
                    }
                    _ => Err(PublishError::Superseded(bot_id.to_string())),
                }
            }
            Err(err) => {
                if matches!(err, PublishError::ReadinessTimeout { .. }) {
                    error!(bot_id, port, "bot runtime did not become ready; killing it");
                    if let Some(pid) = pid {
                        signal_quietly(pid, Signal::Kill);
                    }
                }
                if !self.fail(bot_id, generation, err.to_string()).await {
                    debug!(bot_id, "launch ended after the bot was stopped: {err}");
                    return Err(PublishError::Superseded(bot_id.to_string()));
                }
                Err(err)
            }
        }
    }

    /// Pipe stdout into the log and keep a tail of stderr for diagnostics.
    fn capture_output(
        &self,
        bot_id: &str,
        child: &mut Child,
        stderr: Arc<Mutex<StderrTail>>,
    ) -> Option<JoinHandle<()>> {
        if let Some(out) = child.stdout.take() {
            let id = bot_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(bot_id = %id, "{line}");
                }
            });
        }

        child.stderr.take().map(|err| {
            let id = bot_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!(bot_id = %id, "{line}");
                    stderr.lock().await.push_line(line);
                }
            })
        })
    }

    /// Poll TCP connectivity until the runtime answers, exits, or time runs out.
    async fn wait_until_ready(
        &self,
        port: u16,
        exit_rx: &mut watch::Receiver<Option<ExitInfo>>,
        stderr: &Mutex<StderrTail>,
    ) -> Result<()> {
        let deadline = Instant::now() + self.readiness_timeout;
        loop {
            let exited = *exit_rx.borrow();
            if let Some(exit) = exited {
                return Err(PublishError::ProcessExit {
                    code: exit.code,
                    stderr: stderr.lock().await.joined(),
                });
            }

            if TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
                return Ok(());
            }

            if Instant::now() >= deadline {
                return Err(PublishError::ReadinessTimeout {
                    port,
                    secs: self.readiness_timeout.as_secs(),
                });
            }

            tokio::select! {
                _ = sleep(self.readiness_interval) => {}
                _ = exit_rx.changed() => {}
            }
        }
    }

    async fn on_exit(&self, bot_id: &str, generation: u64, status: std::io::Result<ExitStatus>) {
        let mut registry = self.registry.lock().await;
        let Some(record) = registry.get_mut(bot_id) else {
            return;
        };
        if record.generation != generation {
            return;
        }

        match status {
            // Exiting before readiness is a failed launch, whatever the code.
            Ok(status) if status.success() && record.state == BotState::Running => {
                info!(bot_id, "bot runtime exited cleanly");
                registry.remove(bot_id);
            }
            Ok(status) => {
                record.pid = None;
                record.port = None;
                if record.state != BotState::Failed {
                    let stderr = record.stderr.lock().await.joined();
                    let err = PublishError::ProcessExit {
                        code: status.code(),
                        stderr,
                    };
                    error!(bot_id, code = ?status.code(), "bot runtime exited");
                    record.state = BotState::Failed;
                    record.message = err.to_string();
                }
            }
            Err(e) => {
                error!(bot_id, "waiting on bot runtime failed: {e}");
                record.lose_track(&e);
            }
        }
    }

    /// Mark the record of `generation` failed. False when the record was
    /// stopped or replaced in the meantime.
    async fn fail(&self, bot_id: &str, generation: u64, message: String) -> bool {
        let mut registry = self.registry.lock().await;
        match registry.get_mut(bot_id) {
            Some(record) if record.generation == generation => {
                record.state = BotState::Failed;
                record.message = message;
                record.pid = None;
                record.port = None;
                true
            }
            _ => false,
        }
    }

    /// Stop the live process of `bot_id`, if any, keeping status-only records.
    async fn retire(&self, bot_id: &str) -> Result<()> {
        let record = {
            let mut registry = self.registry.lock().await;
            match registry.get(bot_id) {
                Some(record) if record.pid.is_some() => registry.remove(bot_id),
                _ => None,
            }
        };
        if let Some(record) = record {
            info!(bot_id, "retiring previous bot runtime");
            self.terminate(bot_id, record).await?;
        }
        Ok(())
    }

    /// Stop a bot: drop its record, then take down its process tree.
    /// A process that is already gone counts as stopped.
    pub async fn stop(&self, bot_id: &str) -> Result<()> {
        let record = { self.registry.lock().await.remove(bot_id) };
        let Some(record) = record else {
            return Ok(());
        };
        self.terminate(bot_id, record).await?;
        info!(bot_id, "bot stopped");
        Ok(())
    }

    async fn terminate(&self, bot_id: &str, record: BotProcessRecord) -> Result<()> {
        let Some(pid) = record.pid else {
            return Ok(());
        };

        match kill_process_tree(pid, Signal::Terminate) {
            Ok(KillOutcome::Signalled) => {}
            Ok(KillOutcome::NotFound) => {
                debug!(bot_id, pid, "bot runtime already exited");
                return Ok(());
            }
            Err(source) => return Err(PublishError::Signal { pid, source }),
        }

        let exited = match record.exited {
            Some(mut rx) => timeout(self.stop_grace, rx.wait_for(Option::is_some))
                .await
                .is_ok(),
            None => false,
        };
        if !exited {
            warn!(bot_id, pid, "bot runtime ignored SIGTERM; killing");
        }
        // Reap stragglers that outlived the group leader.
        signal_quietly(pid, Signal::Kill);
        Ok(())
    }

    /// Record publish-level progress for a bot, keeping any live process.
    pub async fn mark_starting(&self, bot_id: &str, message: impl Into<String>) {
        let message = message.into();
        let mut registry = self.registry.lock().await;
        match registry.get_mut(bot_id) {
            Some(record) => {
                record.state = BotState::Starting;
                record.message = message;
            }
            None => {
                let generation = self.generation();
                registry.insert(
                    bot_id.to_string(),
                    BotProcessRecord::status_only(BotState::Starting, message, generation),
                );
            }
        }
    }

    /// Record a terminal failure. Callers stop the bot first.
    pub async fn mark_failed(&self, bot_id: &str, message: impl Into<String>) {
        let message = message.into();
        let mut registry = self.registry.lock().await;
        match registry.get_mut(bot_id) {
            Some(record) => {
                record.state = BotState::Failed;
                record.message = message;
            }
            None => {
                let generation = self.generation();
                registry.insert(
                    bot_id.to_string(),
                    BotProcessRecord::status_only(BotState::Failed, message, generation),
                );
            }
        }
    }

    pub async fn status(&self, bot_id: &str) -> Option<BotStatus> {
        let registry = self.registry.lock().await;
        registry.get(bot_id).map(|r| r.snapshot(bot_id))
    }

    /// Snapshot of every tracked bot, sorted by id.
    pub async fn active_bots(&self) -> Vec<BotStatus> {
        let registry = self.registry.lock().await;
        let mut out: Vec<BotStatus> = registry
            .iter()
            .map(|(id, record)| record.snapshot(id))
            .collect();
        out.sort_by(|a, b| a.bot_id.cmp(&b.bot_id));
        out
    }

    /// Stop every tracked bot. Errors are logged and the sweep continues.
    pub async fn stop_all(&self) {
        let ids: Vec<String> = {
            let registry = self.registry.lock().await;
            registry.keys().cloned().collect()
        };
        for id in ids {
            if let Err(e) = self.stop(&id).await {
                error!(bot_id = %id, "failed to stop bot: {e}");
            }
        }
    }
}

fn signal_quietly(pid: u32, signal: Signal) {
    match kill_process_tree(pid, signal) {
        Ok(_) => {}
        Err(e) => warn!(pid, ?signal, "failed to signal bot runtime: {e}"),
    }
}
