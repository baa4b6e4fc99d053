//! Entry point used by the rest of the application to publish bots locally.
//!
//! `publish` and `rollback` only validate and acknowledge; the actual work
//! runs on a spawned task and its outcome is observable through
//! [`PublishOrchestrator::get_status`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use shared_types::{
    HistoryEntry, JobId, ProjectInfo, PublishConfig, PublishMetadata, PublishResponse,
    PublishResult, RemoveResponse, StatusResponse, StatusResult, STATUS_FAILED,
    STATUS_STARTING,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::archive::{validate_bot_id, validate_version, ContentVersioner};
use crate::config::Config;
use crate::error::{PublishError, Result};
use crate::runtime::{RuntimeInstallation, RuntimeMode, RuntimeProvisioner};
use crate::settings::{
    merge_generated_settings, rewrite_skill_host_endpoint, runtime_args, RuntimeSettings,
};
use crate::supervisor::{BotState, LaunchSpec, ProcessSupervisor};

pub struct PublishOrchestrator {
    supervisor: Arc<ProcessSupervisor>,
    provisioner: RuntimeProvisioner,
    versioner: ContentVersioner,
    /// Serializes background jobs per bot id.
    bot_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl PublishOrchestrator {
    pub fn new(config: &Config) -> Arc<Self> {
        Arc::new(Self {
            supervisor: ProcessSupervisor::from_config(config),
            provisioner: RuntimeProvisioner::from_config(config),
            versioner: ContentVersioner::new(&config.hosted_bots_dir),
            bot_locks: DashMap::new(),
        })
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    fn bot_lock(&self, bot_id: &str) -> Arc<Mutex<()>> {
        self.bot_locks.entry(bot_id.to_string()).or_default().clone()
    }

    /// Accept a publish job and run it in the background.
    ///
    /// Returns `202` once the job is queued, or `500` straight away when the
    /// runtime configuration is unusable.
    pub async fn publish(
        self: &Arc<Self>,
        config: PublishConfig,
        project: ProjectInfo,
        metadata: PublishMetadata,
    ) -> PublishResponse {
        let bot_id = config.bot_id.clone();
        let version = config.version.clone();

        let runtime = match validate_publish(&config, &project) {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(bot_id = %bot_id, version = %version, "publish rejected: {err}");
                self.supervisor.mark_failed(&bot_id, err.to_string()).await;
                return failed_response(&version, &err);
            }
        };

        self.supervisor.mark_starting(&bot_id, "Reloading...").await;
        let job = JobId::new();
        info!(
            bot_id = %bot_id,
            version = %version,
            job = job.as_str(),
            custom_runtime = runtime.custom_runtime,
            comment = ?metadata.comment,
            "publish accepted"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let bot_id = config.bot_id.clone();
            let lock = this.bot_lock(&bot_id);
            let _guard = lock.lock().await;
            let outcome = this.deploy(&config, &project, &runtime).await;
            this.settle(&bot_id, outcome).await;
        });

        PublishResponse {
            status: STATUS_STARTING,
            result: PublishResult {
                id: Some(job),
                version: Some(version),
                message: "Local publish accepted".to_string(),
            },
        }
    }

    /// provision → package → restore → start
    async fn deploy(
        &self,
        config: &PublishConfig,
        project: &ProjectInfo,
        runtime: &RuntimeSettings,
    ) -> Result<u16> {
        let bot_id = config.bot_id.as_str();
        let installation = self
            .provisioner
            .provision(bot_id, runtime, &config.full_settings)
            .await?;

        let mut settings = config.full_settings.clone();
        match installation.mode {
            RuntimeMode::Managed => {
                self.versioner
                    .package_version(bot_id, &config.version, Path::new(&project.data_dir))
                    .await?;
                self.restore_into_serving_dir(bot_id, &config.version, &mut settings)
                    .await?;
            }
            RuntimeMode::Custom => {
                merge_generated_settings(&mut settings, Path::new(&project.data_dir)).await?;
            }
        }

        self.launch(bot_id, &installation, settings).await
    }

    /// Replace the serving directory with exactly the contents of `version`.
    async fn restore_into_serving_dir(
        &self,
        bot_id: &str,
        version: &str,
        settings: &mut Value,
    ) -> Result<()> {
        let serving = self.provisioner.serving_dir(bot_id);
        match tokio::fs::remove_dir_all(&serving).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.versioner
            .restore_version(bot_id, version, &serving)
            .await?;
        let merged = merge_generated_settings(settings, &serving).await?;
        debug!(bot_id, merged, "generated settings merged");
        Ok(())
    }

    async fn launch(
        &self,
        bot_id: &str,
        installation: &RuntimeInstallation,
        mut settings: Value,
    ) -> Result<u16> {
        let spec = LaunchSpec {
            program: installation.command.resolve_program(&installation.dir),
            args: installation.command.args.clone(),
            cwd: installation.dir.clone(),
            port: installation.command.port,
        };
        let id = bot_id.to_string();
        self.supervisor
            .start(bot_id, spec, move |port| {
                let endpoint = rewrite_skill_host_endpoint(&mut settings, port);
                debug!(bot_id = %id, port, skill_host_endpoint = %endpoint, "runtime arguments prepared");
                runtime_args(port, &settings)
            })
            .await
    }

    /// Turn the outcome of a background job into the bot's final status.
    async fn settle(&self, bot_id: &str, outcome: Result<u16>) {
        match outcome {
            Ok(port) => info!(bot_id, port, "local publish complete"),
            Err(PublishError::Superseded(_)) => {
                info!(bot_id, "publish superseded by a later stop or restart");
            }
            Err(err) => {
                error!(bot_id, "local publish failed: {err}");
                if let Err(stop_err) = self.supervisor.stop(bot_id).await {
                    warn!(bot_id, "failed to stop bot after publish failure: {stop_err}");
                }
                self.supervisor.mark_failed(bot_id, err.to_string()).await;
            }
        }
    }

    pub async fn get_status(&self, bot_id: &str) -> StatusResponse {
        let Some(status) = self.supervisor.status(bot_id).await else {
            return StatusResponse::not_found(bot_id);
        };
        let endpoint_url = match (status.state, status.port) {
            (BotState::Running, Some(port)) => Some(format!("http://localhost:{port}")),
            _ => None,
        };
        StatusResponse {
            status: status.state.code(),
            result: StatusResult {
                message: status.message,
                endpoint_url,
            },
        }
    }

    /// Stop a bot's runtime. Provisioning already in flight is not cancelled.
    pub async fn stop_bot(&self, bot_id: &str) -> Result<()> {
        self.supervisor.stop(bot_id).await
    }

    /// Restart a managed bot from a previously packaged version.
    pub async fn rollback(self: &Arc<Self>, bot_id: &str, version: &str) -> PublishResponse {
        let checked = validate_bot_id(bot_id)
            .and_then(|()| validate_version(version))
            .and_then(|()| self.provisioner.managed_installation(bot_id))
            .and_then(|installation| {
                if self.versioner.archive_path(bot_id, version).is_file() {
                    Ok(installation)
                } else {
                    Err(PublishError::ArchiveNotFound {
                        bot_id: bot_id.to_string(),
                        version: version.to_string(),
                    })
                }
            });
        let installation = match checked {
            Ok(installation) => installation,
            Err(err) => {
                error!(bot_id, version, "rollback rejected: {err}");
                return failed_response(version, &err);
            }
        };

        self.supervisor
            .mark_starting(bot_id, format!("Rolling back to version {version}..."))
            .await;
        let job = JobId::new();
        info!(bot_id, version, job = job.as_str(), "rollback accepted");

        let this = Arc::clone(self);
        let id = bot_id.to_string();
        let target = version.to_string();
        tokio::spawn(async move {
            let lock = this.bot_lock(&id);
            let _guard = lock.lock().await;
            let outcome = this.redeploy(&id, &target, &installation).await;
            this.settle(&id, outcome).await;
        });

        PublishResponse {
            status: STATUS_STARTING,
            result: PublishResult {
                id: Some(job),
                version: Some(version.to_string()),
                message: format!("Rollback to version {version} accepted"),
            },
        }
    }

    async fn redeploy(
        &self,
        bot_id: &str,
        version: &str,
        installation: &RuntimeInstallation,
    ) -> Result<u16> {
        let mut settings = self
            .provisioner
            .saved_settings(bot_id)
            .await?
            .unwrap_or_else(|| Value::Object(Default::default()));
        self.restore_into_serving_dir(bot_id, version, &mut settings)
            .await?;
        self.launch(bot_id, installation, settings).await
    }

    pub async fn history(&self, bot_id: &str) -> Result<Vec<HistoryEntry>> {
        validate_bot_id(bot_id)?;
        self.versioner.list_versions(bot_id).await
    }

    /// Stop the bot and delete everything stored for it.
    pub async fn remove_runtime_data(&self, bot_id: &str) -> Result<RemoveResponse> {
        if validate_bot_id(bot_id).is_err() {
            return Err(PublishError::NotFound(PathBuf::from(bot_id)));
        }
        let dir = self.provisioner.bot_dir(bot_id);

        // The lock entry stays in the map: queued jobs still hold this mutex.
        let lock = self.bot_lock(bot_id);
        let _guard = lock.lock().await;
        if !dir.is_dir() {
            return Err(PublishError::NotFound(dir));
        }
        self.supervisor.stop(bot_id).await?;
        tokio::fs::remove_dir_all(&dir).await?;

        info!(bot_id, dir = %dir.display(), "runtime data removed");
        Ok(RemoveResponse {
            msg: format!("Successfully removed runtime data for {bot_id}"),
        })
    }

    /// Stop every running bot.
    pub async fn shutdown(&self) {
        info!("stopping all local bot runtimes");
        self.supervisor.stop_all().await;
    }
}

fn validate_publish(config: &PublishConfig, project: &ProjectInfo) -> Result<RuntimeSettings> {
    validate_bot_id(&config.bot_id)?;
    validate_version(&config.version)?;
    let runtime = RuntimeSettings::from_settings(&config.full_settings, &project.settings)?;
    runtime.validate()?;
    Ok(runtime)
}

fn failed_response(version: &str, err: &PublishError) -> PublishResponse {
    PublishResponse {
        status: STATUS_FAILED,
        result: PublishResult {
            id: None,
            version: Some(version.to_string()),
            message: err.to_string(),
        },
    }
}
