//! Per-bot runtime installations.
//!
//! Managed bots get a private copy of the runtime template under
//! `<hosted_bots>/<bot_id>/runtime`, built once and rebuilt only when the
//! configured runtime kind changes. Custom (ejected) bots run user-owned code
//! in place; only the build step is run against it.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::process::Command;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::archive::RUNTIME_DIR;
use crate::config::Config;
use crate::error::{PublishError, Result};
use crate::settings::{CommandLine, RuntimeSettings};

/// Directory inside a managed runtime that serves the restored bot assets.
pub const SERVING_DIR: &str = "ComposerDialogs";
const SETTINGS_DIR: &str = "settings";
const SETTINGS_FILE: &str = "appsettings.json";
const BUILD_OUTPUT_TAIL: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    Managed,
    Custom,
}

/// A runtime ready to be launched.
#[derive(Debug, Clone)]
pub struct RuntimeInstallation {
    pub mode: RuntimeMode,
    /// Working directory of the runtime process
    pub dir: PathBuf,
    pub command: CommandLine,
}

#[derive(Debug, Clone)]
pub struct RuntimeProvisioner {
    base_dir: PathBuf,
    template_dir: PathBuf,
    build_command: String,
    start_command: String,
}

impl RuntimeProvisioner {
    pub fn new(
        base_dir: impl Into<PathBuf>,
        template_dir: impl Into<PathBuf>,
        build_command: impl Into<String>,
        start_command: impl Into<String>,
    ) -> Self {
        Self {
            base_dir: base_dir.into(),
            template_dir: template_dir.into(),
            build_command: build_command.into(),
            start_command: start_command.into(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            &config.hosted_bots_dir,
            &config.runtime_template_dir,
            &config.build_command,
            &config.start_command,
        )
    }

    pub fn bot_dir(&self, bot_id: &str) -> PathBuf {
        self.base_dir.join(bot_id)
    }

    pub fn runtime_dir(&self, bot_id: &str) -> PathBuf {
        self.bot_dir(bot_id).join(RUNTIME_DIR)
    }

    pub fn serving_dir(&self, bot_id: &str) -> PathBuf {
        self.runtime_dir(bot_id).join(SERVING_DIR)
    }

    fn settings_file(&self, bot_id: &str) -> PathBuf {
        self.bot_dir(bot_id).join(SETTINGS_DIR).join(SETTINGS_FILE)
    }

    /// Make sure a runnable runtime exists for `bot_id`.
    ///
    /// On failure the whole bot directory is removed so the next attempt
    /// starts from scratch.
    pub async fn provision(
        &self,
        bot_id: &str,
        runtime: &RuntimeSettings,
        settings: &Value,
    ) -> Result<RuntimeInstallation> {
        match self.try_provision(bot_id, runtime, settings).await {
            Ok(installation) => Ok(installation),
            Err(err) => {
                warn!(bot_id, "runtime provisioning failed, cleaning up: {err}");
                if let Err(cleanup) = self.remove_bot_dir(bot_id).await {
                    warn!(bot_id, "failed to clean up bot directory: {cleanup}");
                }
                Err(err)
            }
        }
    }

    async fn try_provision(
        &self,
        bot_id: &str,
        runtime: &RuntimeSettings,
        settings: &Value,
    ) -> Result<RuntimeInstallation> {
        runtime.validate()?;

        let installation = if runtime.custom_runtime {
            let dir = PathBuf::from(runtime.path.as_deref().unwrap_or_default());
            if !dir.is_dir() {
                return Err(PublishError::Configuration(format!(
                    "Custom runtime path {} does not exist",
                    dir.display()
                )));
            }
            let command = CommandLine::parse(runtime.command.as_deref().unwrap_or_default())?;
            self.build(bot_id, &dir).await?;
            RuntimeInstallation {
                mode: RuntimeMode::Custom,
                dir,
                command,
            }
        } else {
            let dir = self.runtime_dir(bot_id);
            if dir.is_dir() {
                let previous = self.saved_settings(bot_id).await?;
                let previous_kind = previous
                    .as_ref()
                    .map(|s| RuntimeSettings::from_settings(s, &Value::Null))
                    .transpose()?
                    .map(|r| r.kind().to_string());
                if previous_kind.as_deref() != Some(runtime.kind()) {
                    info!(
                        bot_id,
                        previous = ?previous_kind,
                        current = runtime.kind(),
                        "runtime kind changed, rebuilding"
                    );
                    tokio::fs::remove_dir_all(&dir).await?;
                }
            }

            if !dir.is_dir() {
                self.install_template(bot_id, &dir).await?;
                self.build(bot_id, &dir).await?;
            }

            RuntimeInstallation {
                mode: RuntimeMode::Managed,
                dir,
                command: CommandLine::parse(&self.start_command)?,
            }
        };

        self.save_settings(bot_id, settings).await?;
        Ok(installation)
    }

    async fn install_template(&self, bot_id: &str, dest: &Path) -> Result<()> {
        if !self.template_dir.is_dir() {
            return Err(PublishError::Build(format!(
                "Runtime template not found at {}",
                self.template_dir.display()
            )));
        }
        info!(bot_id, template = %self.template_dir.display(), "installing runtime template");
        let source = self.template_dir.clone();
        let target = dest.to_path_buf();
        tokio::task::spawn_blocking(move || copy_tree(&source, &target)).await??;
        Ok(())
    }

    /// Run the configured build command inside `dir`.
    async fn build(&self, bot_id: &str, dir: &Path) -> Result<()> {
        if self.build_command.trim().is_empty() {
            return Ok(());
        }
        let command = CommandLine::parse(&self.build_command)?;
        info!(bot_id, dir = %dir.display(), command = %self.build_command, "building runtime");

        let output = Command::new(command.resolve_program(dir))
            .args(&command.args)
            .current_dir(dir)
            .output()
            .await
            .map_err(|e| PublishError::Build(format!("failed to run `{}`: {e}", self.build_command)))?;

        if !output.status.success() {
            // Some toolchains report compile errors on stdout.
            let raw = if output.stderr.is_empty() {
                &output.stdout
            } else {
                &output.stderr
            };
            let text = String::from_utf8_lossy(raw);
            let lines: Vec<&str> = text.lines().collect();
            let tail = lines[lines.len().saturating_sub(BUILD_OUTPUT_TAIL)..].join("\n");
            return Err(PublishError::Build(format!(
                "`{}` exited with {}: {tail}",
                self.build_command, output.status
            )));
        }
        Ok(())
    }

    /// The already-provisioned managed runtime of `bot_id`.
    pub fn managed_installation(&self, bot_id: &str) -> Result<RuntimeInstallation> {
        let dir = self.runtime_dir(bot_id);
        if !dir.is_dir() {
            return Err(PublishError::NotFound(dir));
        }
        Ok(RuntimeInstallation {
            mode: RuntimeMode::Managed,
            dir,
            command: CommandLine::parse(&self.start_command)?,
        })
    }

    /// Settings persisted by the last successful provision, if any.
    pub async fn saved_settings(&self, bot_id: &str) -> Result<Option<Value>> {
        match tokio::fs::read_to_string(self.settings_file(bot_id)).await {
            Ok(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save_settings(&self, bot_id: &str, settings: &Value) -> Result<()> {
        let path = self.settings_file(bot_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, serde_json::to_vec_pretty(settings)?).await?;
        Ok(())
    }

    /// Delete everything stored for a bot. Missing directories are fine.
    pub async fn remove_bot_dir(&self, bot_id: &str) -> Result<()> {
        match tokio::fs::remove_dir_all(self.bot_dir(bot_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).follow_links(true) {
        let entry = entry.map_err(|e| PublishError::Io(io::Error::other(e)))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| PublishError::Io(io::Error::other(e)))?;
        let target = dest.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn template() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(dir.path().join("src/Program.cs"), "class Program {}").unwrap();
        dir
    }

    fn managed(kind: &str) -> (RuntimeSettings, Value) {
        let settings = json!({ "runtime": { "key": kind } });
        let runtime = RuntimeSettings::from_settings(&settings, &Value::Null).unwrap();
        (runtime, settings)
    }

    #[tokio::test]
    async fn managed_install_copies_template_and_builds_once() {
        let base = tempfile::tempdir().unwrap();
        let template = template();
        // The build step leaves a marker so a second build would be visible.
        let provisioner =
            RuntimeProvisioner::new(base.path(), template.path(), "touch built", "./run.sh");
        let (runtime, settings) = managed("csharp-azurewebapp");

        let installation = provisioner.provision("bot1", &runtime, &settings).await.unwrap();
        assert_eq!(installation.mode, RuntimeMode::Managed);
        assert_eq!(installation.dir, base.path().join("bot1/runtime"));
        assert!(installation.dir.join("src/Program.cs").is_file());
        assert!(installation.dir.join("built").is_file());
        assert_eq!(installation.command.program, "./run.sh");

        fs::remove_file(installation.dir.join("built")).unwrap();
        provisioner.provision("bot1", &runtime, &settings).await.unwrap();
        assert!(!installation.dir.join("built").exists());

        let saved = provisioner.saved_settings("bot1").await.unwrap().unwrap();
        assert_eq!(saved["runtime"]["key"], "csharp-azurewebapp");
    }

    #[tokio::test]
    async fn managed_runtime_rebuilds_when_kind_changes() {
        let base = tempfile::tempdir().unwrap();
        let template = template();
        let provisioner = RuntimeProvisioner::new(base.path(), template.path(), "", "./run.sh");

        let (runtime, settings) = managed("csharp-azurewebapp");
        provisioner.provision("bot1", &runtime, &settings).await.unwrap();
        let stale = base.path().join("bot1/runtime/stale.txt");
        fs::write(&stale, "left over").unwrap();

        let (runtime, settings) = managed("js-azurewebapp");
        provisioner.provision("bot1", &runtime, &settings).await.unwrap();
        assert!(!stale.exists());
        assert!(base.path().join("bot1/runtime/src/Program.cs").is_file());
    }

    #[tokio::test]
    async fn failed_build_removes_bot_directory() {
        let base = tempfile::tempdir().unwrap();
        let template = template();
        let provisioner = RuntimeProvisioner::new(base.path(), template.path(), "false", "./run.sh");
        let (runtime, settings) = managed("csharp-azurewebapp");

        let err = provisioner
            .provision("bot1", &runtime, &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Build(_)));
        assert!(!base.path().join("bot1").exists());
    }

    #[tokio::test]
    async fn custom_runtime_requires_path_and_command() {
        let base = tempfile::tempdir().unwrap();
        let provisioner = RuntimeProvisioner::new(base.path(), "/nonexistent", "", "");
        let settings = json!({ "runtime": { "customRuntime": true, "path": "/somewhere" } });
        let runtime = RuntimeSettings::from_settings(&settings, &Value::Null).unwrap();

        let err = provisioner
            .provision("bot1", &runtime, &settings)
            .await
            .unwrap_err();
        assert!(matches!(err, PublishError::Configuration(_)));
    }

    #[tokio::test]
    async fn custom_runtime_builds_in_place() {
        let base = tempfile::tempdir().unwrap();
        let custom = tempfile::tempdir().unwrap();
        let provisioner = RuntimeProvisioner::new(base.path(), "/nonexistent", "touch built", "");
        let settings = json!({ "runtime": {
            "customRuntime": true,
            "path": custom.path().to_string_lossy(),
            "command": "./run.sh --port 4100",
        }});
        let runtime = RuntimeSettings::from_settings(&settings, &Value::Null).unwrap();

        let installation = provisioner.provision("bot1", &runtime, &settings).await.unwrap();
        assert_eq!(installation.mode, RuntimeMode::Custom);
        assert_eq!(installation.dir, custom.path());
        assert_eq!(installation.command.port, Some(4100));
        assert!(custom.path().join("built").is_file());
        assert!(!base.path().join("bot1/runtime").exists());
    }
}
