//! Bot settings as seen by the publisher: runtime selection, generated
//! settings files, and the command line handed to a launched runtime.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use crate::error::{PublishError, Result};

pub const INCOMPLETE_CUSTOM_RUNTIME: &str =
    "Custom runtime settings are incomplete. Please specify path and command.";

/// Directory (inside the serving dir) holding build-generated settings files.
pub const GENERATED_DIR: &str = "generated";

static LOCALHOST_URL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^https?://(localhost|127\.0\.0\.1)(:\d+)?(/|$)").expect("valid regex")
});

static GENERATED_SETTINGS_FILE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9_-]+\.settings\.[A-Za-z0-9_.-]+\.json$").expect("valid regex")
});

/// The `runtime` section of the bot settings.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RuntimeSettings {
    /// User-owned (ejected) runtime instead of the managed template
    pub custom_runtime: bool,
    pub path: Option<String>,
    pub command: Option<String>,
    /// Runtime kind; a change forces a managed rebuild
    pub key: Option<String>,
}

impl RuntimeSettings {
    /// Read `runtime` from the full settings, falling back to project settings.
    pub fn from_settings(full_settings: &Value, project_settings: &Value) -> Result<Self> {
        let section = full_settings
            .get("runtime")
            .or_else(|| project_settings.get("runtime"));
        match section {
            Some(v) if !v.is_null() => Ok(serde_json::from_value(v.clone())?),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.custom_runtime && (is_blank(&self.path) || is_blank(&self.command)) {
            return Err(PublishError::Configuration(
                INCOMPLETE_CUSTOM_RUNTIME.to_string(),
            ));
        }
        Ok(())
    }

    pub fn kind(&self) -> &str {
        self.key.as_deref().unwrap_or_default()
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |s| s.trim().is_empty())
}

/// A program plus arguments, parsed from a whitespace separated command string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
    /// Port given explicitly via `--port N` / `--port=N`; removed from `args`.
    pub port: Option<u16>,
}

impl CommandLine {
    pub fn parse(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| {
            PublishError::Configuration("Runtime command is empty".to_string())
        })?;

        let mut args = Vec::new();
        let mut port = None;
        while let Some(arg) = parts.next() {
            let value = if arg == "--port" {
                parts.next()
            } else if let Some(v) = arg.strip_prefix("--port=") {
                Some(v.to_string())
            } else {
                args.push(arg);
                continue;
            };
            let raw = value.unwrap_or_default();
            port = Some(raw.parse::<u16>().map_err(|_| {
                PublishError::Configuration(format!("Invalid --port value '{raw}' in command"))
            })?);
        }

        Ok(Self {
            program,
            args,
            port,
        })
    }

    /// Relative program paths like `./run.sh` are resolved against `cwd`;
    /// bare names are left for PATH lookup.
    pub fn resolve_program(&self, cwd: &Path) -> PathBuf {
        let program = Path::new(&self.program);
        if program.is_relative() && program.components().count() > 1 {
            cwd.join(program)
        } else {
            program.to_path_buf()
        }
    }
}

/// Merge every `<name>.settings.<suffix>.json` under `<dir>/generated` into
/// `settings`, in file-name order. Returns how many files were merged.
pub async fn merge_generated_settings(settings: &mut Value, dir: &Path) -> Result<usize> {
    let generated = dir.join(GENERATED_DIR);
    let mut read_dir = match tokio::fs::read_dir(&generated).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    while let Some(entry) = read_dir.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if GENERATED_SETTINGS_FILE.is_match(&name) && entry.file_type().await?.is_file() {
            files.push((name, entry.path()));
        }
    }
    files.sort();

    for (name, path) in &files {
        let raw = tokio::fs::read_to_string(path).await?;
        let overlay: Value = serde_json::from_str(&raw).map_err(|e| {
            PublishError::Configuration(format!("Generated settings file {name} is invalid: {e}"))
        })?;
        debug!(file = %name, "merging generated settings");
        deep_merge(settings, overlay);
    }
    Ok(files.len())
}

/// Recursively merge `overlay` into `target`; objects merge key by key,
/// everything else is replaced.
pub fn deep_merge(target: &mut Value, overlay: Value) {
    match (target, overlay) {
        (Value::Object(dst), Value::Object(src)) => {
            for (key, value) in src {
                deep_merge(dst.entry(key).or_insert(Value::Null), value);
            }
        }
        (dst, src) => *dst = src,
    }
}

pub fn skill_host_endpoint_for(port: u16) -> String {
    format!("http://127.0.0.1:{port}/api/skills")
}

/// Point `skillHostEndpoint` at this instance when it is unset or already
/// local. Tunnelled endpoints are left alone. Returns the effective value.
pub fn rewrite_skill_host_endpoint(settings: &mut Value, port: u16) -> String {
    let current = settings
        .get("skillHostEndpoint")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .trim()
        .to_string();

    if current.is_empty() || LOCALHOST_URL.is_match(&current) {
        let endpoint = skill_host_endpoint_for(port);
        if let Value::Object(map) = settings {
            map.insert(
                "skillHostEndpoint".to_string(),
                Value::String(endpoint.clone()),
            );
        } else {
            *settings = serde_json::json!({ "skillHostEndpoint": endpoint.clone() });
        }
        endpoint
    } else {
        current
    }
}

/// Arguments every launched runtime receives, in the order it expects them.
pub fn runtime_args(port: u16, settings: &Value) -> Vec<String> {
    let mut args = vec![
        "--port".to_string(),
        port.to_string(),
        "--urls".to_string(),
        format!("http://0.0.0.0:{port}"),
    ];

    let optional = [
        ("--MicrosoftAppPassword", settings.pointer("/MicrosoftAppPassword")),
        ("--luis:endpointKey", settings.pointer("/luis/endpointKey")),
        ("--qna:endpointKey", settings.pointer("/qna/endpointKey")),
        ("--SkillHostEndpoint", settings.pointer("/skillHostEndpoint")),
    ];
    for (flag, value) in optional {
        if let Some(v) = value.and_then(Value::as_str).filter(|v| !v.is_empty()) {
            args.push(flag.to_string());
            args.push(v.to_string());
        }
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn custom_runtime_without_command_is_incomplete() {
        let settings = json!({ "runtime": { "customRuntime": true, "path": "/bots/rt" } });
        let runtime = RuntimeSettings::from_settings(&settings, &Value::Null).unwrap();
        let err = runtime.validate().unwrap_err();
        assert!(err.to_string().ends_with("Please specify path and command."));
    }

    #[test]
    fn runtime_section_falls_back_to_project_settings() {
        let project = json!({ "runtime": { "key": "csharp-azurewebapp" } });
        let runtime = RuntimeSettings::from_settings(&json!({}), &project).unwrap();
        assert!(!runtime.custom_runtime);
        assert_eq!(runtime.kind(), "csharp-azurewebapp");
        assert!(runtime.validate().is_ok());
    }

    #[test]
    fn command_line_extracts_explicit_port() {
        let cmd = CommandLine::parse("dotnet run --project ./BotProject.csproj --port 3988").unwrap();
        assert_eq!(cmd.program, "dotnet");
        assert_eq!(cmd.args, vec!["run", "--project", "./BotProject.csproj"]);
        assert_eq!(cmd.port, Some(3988));

        let cmd = CommandLine::parse("node index.js --port=4001").unwrap();
        assert_eq!(cmd.port, Some(4001));
        assert_eq!(cmd.args, vec!["index.js"]);
    }

    #[test]
    fn command_line_rejects_bad_input() {
        assert!(CommandLine::parse("   ").is_err());
        assert!(CommandLine::parse("node --port abc").is_err());
    }

    #[test]
    fn resolve_program_only_joins_relative_paths() {
        let cwd = Path::new("/bots/custom");
        let script = CommandLine::parse("./run.sh").unwrap();
        assert_eq!(script.resolve_program(cwd), PathBuf::from("/bots/custom/./run.sh"));
        let bare = CommandLine::parse("dotnet").unwrap();
        assert_eq!(bare.resolve_program(cwd), PathBuf::from("dotnet"));
    }

    #[test]
    fn skill_host_endpoint_defaults_to_allocated_port() {
        let mut settings = json!({});
        rewrite_skill_host_endpoint(&mut settings, 4000);
        let args = runtime_args(4000, &settings);
        let joined = args.join(" ");
        assert!(joined.starts_with("--port 4000 --urls http://0.0.0.0:4000"));
        assert!(joined.contains("--SkillHostEndpoint http://127.0.0.1:4000/api/skills"));
    }

    #[test]
    fn skill_host_endpoint_rewrites_stale_localhost() {
        let mut settings = json!({ "skillHostEndpoint": "http://localhost:3979/api/skills" });
        let endpoint = rewrite_skill_host_endpoint(&mut settings, 3981);
        assert_eq!(endpoint, "http://127.0.0.1:3981/api/skills");
    }

    #[test]
    fn skill_host_endpoint_keeps_tunnel() {
        let tunnel = "https://abc123.ngrok.io/api/skills";
        let mut settings = json!({ "skillHostEndpoint": tunnel });
        rewrite_skill_host_endpoint(&mut settings, 3981);
        assert_eq!(settings["skillHostEndpoint"], tunnel);
    }

    #[test]
    fn runtime_args_include_secrets_when_present() {
        let settings = json!({
            "MicrosoftAppPassword": "pw",
            "luis": { "endpointKey": "lk" },
            "qna": { "endpointKey": "" }
        });
        let args = runtime_args(3979, &settings);
        assert!(args.windows(2).any(|w| w == ["--MicrosoftAppPassword", "pw"]));
        assert!(args.windows(2).any(|w| w == ["--luis:endpointKey", "lk"]));
        assert!(!args.iter().any(|a| a == "--qna:endpointKey"));
    }

    #[tokio::test]
    async fn generated_settings_merge_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        let generated = dir.path().join(GENERATED_DIR);
        std::fs::create_dir_all(&generated).unwrap();
        std::fs::write(
            generated.join("luis.settings.development.westus.json"),
            r#"{"luis": {"bot1_en-us_lu": "app-id"}}"#,
        )
        .unwrap();
        std::fs::write(
            generated.join("qnamaker.settings.development.westus.json"),
            r#"{"qna": {"hostname": "https://qna.example"}}"#,
        )
        .unwrap();
        std::fs::write(generated.join("notes.json"), "not settings").unwrap();

        let mut settings = json!({ "luis": { "endpointKey": "lk" } });
        let merged = merge_generated_settings(&mut settings, dir.path()).await.unwrap();

        assert_eq!(merged, 2);
        assert_eq!(settings["luis"]["endpointKey"], "lk");
        assert_eq!(settings["luis"]["bot1_en-us_lu"], "app-id");
        assert_eq!(settings["qna"]["hostname"], "https://qna.example");
    }

    #[tokio::test]
    async fn malformed_generated_settings_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let generated = dir.path().join(GENERATED_DIR);
        std::fs::create_dir_all(&generated).unwrap();
        std::fs::write(generated.join("luis.settings.dev.westus.json"), "{ nope").unwrap();

        let mut settings = json!({});
        let err = merge_generated_settings(&mut settings, dir.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("luis.settings.dev.westus.json"));
    }
}
