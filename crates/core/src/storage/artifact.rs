use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;

/// Where finished reports end up
#[async_trait::async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store an artifact and return the file name it was saved under
    async fn save(&self, prefix: &str, content: &str) -> Result<String>;

    /// Read a previously saved artifact
    async fn load(&self, filename: &str) -> Result<Option<String>>;
}

/// `<prefix>_<YYYYmmdd_HHMMSS>_<first 8 hex chars of sha256>.md`
pub fn artifact_name(prefix: &str, content: &str, at: DateTime<Utc>) -> String {
    let digest = hex::encode(Sha256::digest(content.as_bytes()));
    format!("{}_{}_{}.md", prefix, at.format("%Y%m%d_%H%M%S"), &digest[..8])
}

/// Markdown files in a single directory
#[derive(Clone)]
pub struct FilesystemArtifactStore {
    base_path: PathBuf,
}

impl FilesystemArtifactStore {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_path)
            .with_context(|| format!("Failed to create artifact directory {}", base_path.display()))?;
        Ok(Self { base_path })
    }

    pub fn base_path(&self) -> &PathBuf {
        &self.base_path
    }

    fn artifact_path(&self, filename: &str) -> Result<PathBuf> {
        if filename.is_empty() || filename.contains(['/', '\\']) || filename.starts_with('.') {
            bail!("Invalid artifact name: {}", filename);
        }
        Ok(self.base_path.join(filename))
    }
}

#[async_trait::async_trait]
impl ArtifactStore for FilesystemArtifactStore {
    async fn save(&self, prefix: &str, content: &str) -> Result<String> {
        let filename = artifact_name(prefix, content, Utc::now());
        let path = self.artifact_path(&filename)?;

        let mut file = tokio::fs::File::create(&path)
            .await
            .context("Failed to create artifact file")?;
        file.write_all(content.as_bytes())
            .await
            .context("Failed to write artifact")?;
        file.sync_all().await.context("Failed to sync artifact")?;

        tracing::info!("Saved artifact {}", path.display());
        Ok(filename)
    }

    async fn load(&self, filename: &str) -> Result<Option<String>> {
        let path = self.artifact_path(filename)?;
        if !path.exists() {
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .context("Failed to read artifact")?;
        Ok(Some(content))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_artifact_name_format() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let name = artifact_name("approved_concept", "hello", at);

        // sha256("hello") starts with 2cf24dba
        assert_eq!(name, "approved_concept_20240309_140507_2cf24dba.md");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemArtifactStore::new(temp_dir.path().join("artifacts")).unwrap();

        let filename = store.save("concept_rejection", "# Draft").await.unwrap();
        assert!(filename.starts_with("concept_rejection_"));
        assert!(filename.ends_with(".md"));

        let loaded = store.load(&filename).await.unwrap();
        assert_eq!(loaded.as_deref(), Some("# Draft"));
        assert!(store.load("missing.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_load_rejects_paths() {
        let temp_dir = TempDir::new().unwrap();
        let store = FilesystemArtifactStore::new(temp_dir.path().to_path_buf()).unwrap();

        assert!(store.load("../secret.md").await.is_err());
        assert!(store.load("nested/file.md").await.is_err());
    }
}
