//! Shared types between the publisher service and its clients
//!
//! These types are used by both:
//! - the local publisher (native Rust, axum handlers)
//! - the authoring web client (TypeScript bindings generated by ts-rs)
//!
//! Serializable with serde for JSON over HTTP

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

// ============================================================================
// Status codes
// ============================================================================

/// Bot process is up and accepting connections.
pub const STATUS_RUNNING: u16 = 200;
/// Publish accepted, or the runtime is still booting.
pub const STATUS_STARTING: u16 = 202;
/// No runtime is tracked for the bot.
pub const STATUS_NOT_FOUND: u16 = 404;
/// Publish or runtime failed; the message explains why.
pub const STATUS_FAILED: u16 = 500;

// ============================================================================
// Core Types
// ============================================================================

/// Identifier handed back for each accepted publish job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[ts(export, export_to = "../../client/src/types/publish.ts")]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Publish
// ============================================================================

/// Target of a publish: which bot, which snapshot version, with what settings.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../client/src/types/publish.ts")]
pub struct PublishConfig {
    pub bot_id: String,
    pub version: String,
    /// Fully merged bot settings (appsettings shape)
    #[ts(type = "unknown")]
    pub full_settings: serde_json::Value,
}

/// The project being published.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../client/src/types/publish.ts")]
pub struct ProjectInfo {
    pub id: String,
    /// Root of the editable bot asset tree
    pub data_dir: String,
    #[serde(default)]
    #[ts(type = "unknown")]
    pub settings: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../client/src/types/publish.ts")]
pub struct PublishMetadata {
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
}

/// HTTP body of `POST /bots/{bot_id}/publish`
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../client/src/types/publish.ts")]
pub struct PublishRequest {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    #[ts(type = "unknown")]
    pub full_settings: serde_json::Value,
    pub project: ProjectPayload,
    #[serde(default)]
    pub metadata: PublishMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../client/src/types/publish.ts")]
pub struct ProjectPayload {
    pub data_dir: String,
    #[serde(default)]
    #[ts(type = "unknown")]
    pub settings: serde_json::Value,
}

impl PublishRequest {
    /// Split the request body into the publish config and project halves.
    pub fn into_parts(self, bot_id: &str) -> (PublishConfig, ProjectInfo, PublishMetadata) {
        let config = PublishConfig {
            bot_id: bot_id.to_string(),
            version: self.version,
            full_settings: self.full_settings,
        };
        let project = ProjectInfo {
            id: bot_id.to_string(),
            data_dir: self.project.data_dir,
            settings: self.project.settings,
        };
        (config, project, self.metadata)
    }
}

fn default_version() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../client/src/types/publish.ts")]
pub struct PublishResult {
    pub id: Option<JobId>,
    pub version: Option<String>,
    pub message: String,
}

/// Acknowledgment of a publish or rollback job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../client/src/types/publish.ts")]
pub struct PublishResponse {
    pub status: u16,
    pub result: PublishResult,
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../client/src/types/publish.ts")]
pub struct StatusResult {
    pub message: String,
    #[serde(
        rename = "endpointURL",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    #[ts(optional)]
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../client/src/types/publish.ts")]
pub struct StatusResponse {
    pub status: u16,
    pub result: StatusResult,
}

impl StatusResponse {
    pub fn not_found(bot_id: &str) -> Self {
        Self {
            status: STATUS_NOT_FOUND,
            result: StatusResult {
                message: format!("No runtime found for bot {bot_id}"),
                endpoint_url: None,
            },
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == STATUS_RUNNING
    }
}

// ============================================================================
// Rollback / History / Cleanup
// ============================================================================

/// HTTP body of `POST /bots/{bot_id}/rollback`
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export, export_to = "../../client/src/types/publish.ts")]
pub struct RollbackRequest {
    pub version: String,
}

/// One packaged snapshot under `history/`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[serde(rename_all = "camelCase")]
#[ts(export, export_to = "../../client/src/types/publish.ts")]
pub struct HistoryEntry {
    pub version: String,
    pub packaged_at: DateTime<Utc>,
    #[ts(type = "number")]
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, TS)]
#[ts(export, export_to = "../../client/src/types/publish.ts")]
pub struct RemoveResponse {
    pub msg: String,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use ts_rs::Config;

    #[test]
    fn test_job_id_generation() {
        let id1 = JobId::new();
        let id2 = JobId::new();
        assert_ne!(id1, id2);
        assert_eq!(id1.0.len(), 36); // UUID length
    }

    #[test]
    fn test_status_endpoint_url_wire_name() {
        let status = StatusResponse {
            status: STATUS_RUNNING,
            result: StatusResult {
                message: "Running".to_string(),
                endpoint_url: Some("http://localhost:3979".to_string()),
            },
        };

        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["result"]["endpointURL"], "http://localhost:3979");
        assert!(status.is_running());
    }

    #[test]
    fn test_not_found_omits_endpoint() {
        let json = serde_json::to_value(StatusResponse::not_found("bot1")).unwrap();
        assert_eq!(json["status"], 404);
        assert!(json["result"].get("endpointURL").is_none());
    }

    #[test]
    fn test_publish_request_defaults() {
        let body = serde_json::json!({
            "project": { "dataDir": "/tmp/bot1" }
        });
        let req: PublishRequest = serde_json::from_value(body).unwrap();
        let (config, project, metadata) = req.into_parts("bot1");

        assert_eq!(config.bot_id, "bot1");
        assert_eq!(config.version, "default");
        assert!(config.full_settings.is_null());
        assert_eq!(project.id, "bot1");
        assert_eq!(project.data_dir, "/tmp/bot1");
        assert!(metadata.comment.is_none());
    }

    #[test]
    fn export_types() {
        // The export_to attribute in each type's #[ts] macro specifies the output file
        let config = Config::default();
        JobId::export(&config).unwrap();
        PublishConfig::export(&config).unwrap();
        ProjectInfo::export(&config).unwrap();
        PublishMetadata::export(&config).unwrap();
        PublishRequest::export(&config).unwrap();
        ProjectPayload::export(&config).unwrap();
        PublishResult::export(&config).unwrap();
        PublishResponse::export(&config).unwrap();
        StatusResult::export(&config).unwrap();
        StatusResponse::export(&config).unwrap();
        RollbackRequest::export(&config).unwrap();
        HistoryEntry::export(&config).unwrap();
        RemoveResponse::export(&config).unwrap();
    }
}
