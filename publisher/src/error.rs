use std::path::PathBuf;

/// Everything that can go wrong while provisioning, packaging, starting or
/// stopping a local bot runtime.
///
/// The orchestrator turns all of these into a `500` status record; callers
/// see them only by polling status.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("{0}")]
    Configuration(String),

    #[error("Runtime build failed: {0}")]
    Build(String),

    #[error("No free port found between {start} and {end}")]
    PortExhaustion { start: u16, end: u16 },

    #[error("No archive found for bot {bot_id} version {version}")]
    ArchiveNotFound { bot_id: String, version: String },

    #[error("Bot runtime did not become reachable on port {port} within {secs}s")]
    ReadinessTimeout { port: u16, secs: u64 },

    #[error("Failed to start bot runtime `{program}`: {source}")]
    ProcessSpawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Bot runtime exited with {}: {stderr}", exit_label(.code))]
    ProcessExit { code: Option<i32>, stderr: String },

    #[error("Failed to signal process group {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: std::io::Error,
    },

    #[error("Directory not found: {}", .0.display())]
    NotFound(PathBuf),

    /// The bot was stopped or restarted while this launch was in flight.
    #[error("Launch of bot {0} was superseded")]
    Superseded(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid settings JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

pub type Result<T> = std::result::Result<T, PublishError>;

fn exit_label(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("code {code}"),
        None => "a signal".to_string(),
    }
}
