use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the publisher HTTP API listens on
    pub port: u16,
    /// Base directory holding one `<bot_id>/` folder per hosted bot
    pub hosted_bots_dir: PathBuf,
    /// Runtime template copied into each managed bot installation
    pub runtime_template_dir: PathBuf,
    /// Build step run inside a runtime directory. Empty skips the build.
    pub build_command: String,
    /// Command that launches a managed runtime from its directory
    pub start_command: String,
    /// First port tried when no bots are running
    pub bot_port_default: u16,
    /// Port search gives up once it reaches this bound
    pub bot_port_max: u16,
    /// How long a spawned runtime has to accept TCP connections
    pub readiness_timeout: Duration,
    /// Delay between readiness connection attempts
    pub readiness_interval: Duration,
    /// How long `stop` waits after SIGTERM before escalating to SIGKILL
    pub stop_grace: Duration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            port: env_parse("PUBLISHER_PORT", 5000)?,
            hosted_bots_dir: PathBuf::from(env_str("LOCAL_PUBLISH_PATH", "./hostedBots")),
            runtime_template_dir: PathBuf::from(env_str(
                "RUNTIME_TEMPLATE_DIR",
                "./runtime/dotnet",
            )),
            build_command: env_str("RUNTIME_BUILD_COMMAND", "dotnet build"),
            start_command: env_str("RUNTIME_START_COMMAND", "dotnet run --no-build"),
            bot_port_default: env_parse("BOT_PORT_DEFAULT", 3979)?,
            bot_port_max: env_parse("BOT_PORT_MAX", 6000)?,
            readiness_timeout: Duration::from_secs(env_parse("READINESS_TIMEOUT_SECS", 120)?),
            readiness_interval: Duration::from_millis(env_parse("READINESS_INTERVAL_MS", 500)?),
            stop_grace: Duration::from_millis(env_parse("STOP_GRACE_MS", 3000)?),
        })
    }

    /// Defaults rooted at `hosted_bots_dir`, without consulting the environment.
    pub fn with_base_dir(hosted_bots_dir: impl Into<PathBuf>) -> Self {
        Self {
            port: 5000,
            hosted_bots_dir: hosted_bots_dir.into(),
            runtime_template_dir: PathBuf::from("./runtime/dotnet"),
            build_command: "dotnet build".to_string(),
            start_command: "dotnet run --no-build".to_string(),
            bot_port_default: 3979,
            bot_port_max: 6000,
            readiness_timeout: Duration::from_secs(120),
            readiness_interval: Duration::from_millis(500),
            stop_grace: Duration::from_millis(3000),
        }
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}
