use anyhow::{Context, Result};
use conclave_core::concept::{build_concept_workflow, AnalysisPanel, ConceptReports};
use conclave_core::ingest::{DocumentParser, PlainTextParser};
use conclave_core::storage::{ArtifactStore, FilesystemArtifactStore};
use conclave_core::workflow::{WorkflowDefinition, WorkflowRunner};
use conclave_core::EngineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(skip)]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub reports: ReportsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory under the data dir where final reports are written
    #[serde(default = "default_artifact_dir")]
    pub artifact_dir: String,

    /// Directory under the data dir holding uploaded concept files. Concept
    /// submissions by path may only read from here.
    #[serde(default = "default_upload_dir")]
    pub upload_dir: String,
}

fn default_artifact_dir() -> String {
    "artifacts".to_string()
}

fn default_upload_dir() -> String {
    "uploads".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            artifact_dir: default_artifact_dir(),
            upload_dir: default_upload_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportsConfig {
    /// Name printed on approval reports and rejection emails
    #[serde(default = "default_organisation")]
    pub organisation: String,
}

fn default_organisation() -> String {
    "Conclave".to_string()
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            organisation: default_organisation(),
        }
    }
}

impl ServerConfig {
    pub fn load(config_path: &Path, data_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;

        let mut config: Self = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context("Failed to read configuration file")?;
            toml::from_str(&content).context("Failed to parse configuration file")?
        } else {
            tracing::info!("Configuration file not found, using defaults");
            Self::defaults()
        };

        config.data_dir = data_dir;

        Ok(config)
    }

    fn defaults() -> Self {
        Self {
            data_dir: PathBuf::new(),
            engine: EngineConfig::default(),
            storage: StorageConfig::default(),
            reports: ReportsConfig::default(),
        }
    }

    /// Get the artifact output path
    pub fn artifact_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.artifact_dir)
    }

    /// Get the concept upload path
    pub fn upload_path(&self) -> PathBuf {
        self.data_dir.join(&self.storage.upload_dir)
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub runner: WorkflowRunner,
    pub workflow: Arc<WorkflowDefinition>,
    pub parser: Arc<dyn DocumentParser>,
    pub artifacts: Arc<dyn ArtifactStore>,
    /// Canonical upload directory
    pub uploads: PathBuf,
}

impl AppState {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(
            FilesystemArtifactStore::new(config.artifact_path())
                .context("Failed to create artifact store")?,
        );

        let workflow = build_concept_workflow(
            &AnalysisPanel::keyword(),
            ConceptReports::new(config.reports.organisation.clone()),
            Some(artifacts.clone()),
        )
        .context("Failed to build concept workflow")?;

        std::fs::create_dir_all(config.upload_path()).context("Failed to create upload directory")?;
        let uploads = config
            .upload_path()
            .canonicalize()
            .context("Failed to resolve upload directory")?;

        tracing::info!(
            "Concept workflow '{}' ready, reports written to {}",
            workflow.name(),
            config.artifact_path().display()
        );

        Ok(Self {
            runner: WorkflowRunner::new(config.engine.clone()),
            workflow,
            parser: Arc::new(PlainTextParser),
            artifacts,
            uploads,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::TimeoutPolicy;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ServerConfig::load(
            &temp_dir.path().join("conclave.toml"),
            temp_dir.path().join("data"),
        )
        .unwrap();

        assert_eq!(config.engine, EngineConfig::default());
        assert_eq!(config.reports.organisation, "Conclave");
        assert_eq!(config.artifact_path(), temp_dir.path().join("data").join("artifacts"));
        assert_eq!(config.upload_path(), temp_dir.path().join("data").join("uploads"));
        assert!(temp_dir.path().join("data").exists());
    }

    #[test]
    fn test_app_state_creates_upload_dir() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conclave.toml");
        std::fs::write(&path, "[storage]\nupload_dir = \"incoming\"\n").unwrap();

        let config = ServerConfig::load(&path, temp_dir.path().to_path_buf()).unwrap();
        let state = AppState::new(&config).unwrap();
        assert!(state.uploads.is_absolute());
        assert!(state.uploads.ends_with("incoming"));
        assert!(state.uploads.is_dir());
    }

    #[test]
    fn test_load_partial_config() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conclave.toml");
        std::fs::write(
            &path,
            "[engine]\napproval_timeout_secs = 600\ntimeout_policy = \"fail\"\nretain_finished_secs = 3600\n\n[storage]\nartifact_dir = \"reports\"\n",
        )
        .unwrap();

        let config = ServerConfig::load(&path, temp_dir.path().to_path_buf()).unwrap();
        assert_eq!(config.engine.approval_timeout_secs, Some(600));
        assert_eq!(config.engine.timeout_policy, TimeoutPolicy::Fail);
        assert_eq!(config.engine.event_capacity, 256);
        assert_eq!(config.engine.retain_finished_secs, Some(3600));
        assert_eq!(config.storage.upload_dir, "uploads");
        assert_eq!(config.artifact_path(), temp_dir.path().join("reports"));
    }

    #[test]
    fn test_invalid_config_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("conclave.toml");
        std::fs::write(&path, "[engine\n").unwrap();

        let err = ServerConfig::load(&path, temp_dir.path().to_path_buf()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse configuration file"));
    }
}
