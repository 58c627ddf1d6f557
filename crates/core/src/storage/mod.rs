pub mod artifact;

pub use artifact::{artifact_name, ArtifactStore, FilesystemArtifactStore};
