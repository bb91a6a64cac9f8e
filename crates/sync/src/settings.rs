use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tether_gateway::{DEFAULT_ENDPOINT, HttpGatewayConfig, UserId};

pub const SETTINGS_DIRECTORY_NAME: &str = "tether";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const SETTINGS_ENV_PREFIX: &str = "TETHER_";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 15_000;

/// What happens to an optimistically deleted message when the gateway refuses the delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeleteFailurePolicy {
    #[default]
    KeepRemoved,
    Restore,
}

/// How new messages enter the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppendStrategy {
    /// Always at the tail, in arrival order.
    #[default]
    Tail,
    /// Ordered insert by `created_at`; ties go after existing messages.
    Chronological,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub local_user_id: String,
    /// Zero disables the per-request timeout.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default)]
    pub delete_failure_policy: DeleteFailurePolicy,
    #[serde(default)]
    pub append_strategy: AppendStrategy,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            local_user_id: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
            delete_failure_policy: DeleteFailurePolicy::default(),
            append_strategy: AppendStrategy::default(),
        }
    }
}

impl SyncSettings {
    pub fn normalized(mut self) -> Self {
        self.endpoint = if self.endpoint.trim().is_empty() {
            default_endpoint()
        } else {
            self.endpoint.trim().to_string()
        };
        self.local_user_id = self.local_user_id.trim().to_string();
        self
    }

    pub fn local_user_id(&self) -> Option<UserId> {
        UserId::parse(&self.local_user_id).ok()
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_ms > 0).then(|| Duration::from_millis(self.request_timeout_ms))
    }

    pub fn http_config(&self) -> HttpGatewayConfig {
        let config = HttpGatewayConfig::new(self.endpoint.clone());
        match self.request_timeout() {
            Some(timeout) => config.with_request_timeout(timeout),
            None => config,
        }
    }
}

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<SyncSettings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".tether"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_sources(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &PathBuf {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<SyncSettings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: SyncSettings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_sources(path: &PathBuf) -> SyncSettings {
        let mut figment = Figment::from(Serialized::defaults(SyncSettings::default()));
        if path.exists() {
            figment = figment.merge(Json::file(path));
        } else {
            tracing::info!("settings file not found at {:?}, using defaults", path);
        }
        figment = figment.merge(Env::prefixed(SETTINGS_ENV_PREFIX));

        match figment.extract::<SyncSettings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    "failed to parse settings from {:?}: {}. using defaults",
                    path,
                    error
                );
                SyncSettings::default()
            }
        }
    }

    /// Writes the settings next to the target as `settings.json.tmp`, then swaps it in.
    fn persist(&self, settings: &SyncSettings) -> Result<(), SettingsError> {
        let target = self.config_path.as_path();
        if let Some(directory) = target.parent() {
            std::fs::create_dir_all(directory).context(CreateSettingsDirSnafu {
                stage: "persist-settings-dir",
                directory,
            })?;
        }

        let encoded = serde_json::to_vec_pretty(settings).context(EncodeSettingsSnafu {
            stage: "persist-encode",
        })?;
        let staged = target.with_extension("json.tmp");
        std::fs::write(&staged, encoded).context(StageSettingsSnafu {
            stage: "persist-stage",
            staged: staged.as_path(),
        })?;
        std::fs::rename(&staged, target).context(CommitSettingsSnafu {
            stage: "persist-commit",
            staged: staged.as_path(),
            target,
        })?;

        tracing::info!(path = %target.display(), "tether settings saved");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display(
        "cannot create the tether settings directory {} on `{stage}`: {source}",
        directory.display()
    ))]
    CreateSettingsDir {
        stage: &'static str,
        directory: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("cannot encode tether settings as JSON on `{stage}`: {source}"))]
    EncodeSettings {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display(
        "cannot stage tether settings at {} on `{stage}`: {source}",
        staged.display()
    ))]
    StageSettings {
        stage: &'static str,
        staged: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "cannot move staged tether settings {} over {} on `{stage}`: {source}",
        staged.display(),
        target.display()
    ))]
    CommitSettings {
        stage: &'static str,
        staged: PathBuf,
        target: PathBuf,
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SettingsStore::new(dir.path().join("settings.json"));
        let settings = store.settings();
        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(settings.delete_failure_policy, DeleteFailurePolicy::KeepRemoved);
        assert_eq!(settings.append_strategy, AppendStrategy::Tail);
        assert!(settings.local_user_id().is_none());
    }

    #[test]
    fn update_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("settings.json");
        let store = SettingsStore::new(path.clone());

        store
            .update(SyncSettings {
                endpoint: "  https://chat.example/api  ".to_string(),
                local_user_id: " me ".to_string(),
                request_timeout_ms: 0,
                delete_failure_policy: DeleteFailurePolicy::Restore,
                append_strategy: AppendStrategy::Chronological,
            })
            .expect("persist settings");
        assert!(!path.with_extension("json.tmp").exists());

        let reloaded = SettingsStore::new(path).settings();
        assert_eq!(reloaded.endpoint, "https://chat.example/api");
        assert_eq!(reloaded.local_user_id(), Some(UserId::new("me")));
        assert_eq!(reloaded.request_timeout(), None);
        assert_eq!(reloaded.delete_failure_policy, DeleteFailurePolicy::Restore);
        assert_eq!(reloaded.append_strategy, AppendStrategy::Chronological);
    }

    #[test]
    fn partial_file_is_merged_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{ "delete_failure_policy": "restore", "endpoint": " " }"#)
            .expect("write settings");

        let settings = SettingsStore::new(path).settings();
        assert_eq!(settings.delete_failure_policy, DeleteFailurePolicy::Restore);
        assert_eq!(settings.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(
            settings.http_config().request_timeout,
            Some(Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS))
        );
    }

    #[test]
    fn unwritable_location_reports_settings_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "not a directory").expect("write blocker");
        let store = SettingsStore::new(blocker.join("settings.json"));

        let error = store
            .update(SyncSettings::default())
            .expect_err("parent is a file");
        assert!(matches!(
            &error,
            SettingsError::CreateSettingsDir { directory, .. } if *directory == blocker
        ));
        assert!(error.to_string().contains("tether settings directory"));
    }

    #[test]
    fn malformed_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{ not json").expect("write settings");

        assert_eq!(*SettingsStore::new(path).settings(), SyncSettings::default());
    }
}
