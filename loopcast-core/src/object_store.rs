//! Blob storage for uploaded audio and generated waveform images.
//!
//! Storage SDKs (S3, GCS, ...) are an explicit non-goal; the collaborator
//! contract only needs upload audio, upload waveform, and delete, and the
//! implementation here backs it with a local filesystem root. A production
//! deployment swaps the implementation, not the trait.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Result of a successful upload: the storage key, a servable URL, and the
/// byte size written.
#[derive(Debug, Clone)]
pub struct UploadedObject {
    pub key: String,
    pub url: String,
    pub size: u64,
}

/// Blob storage collaborator used by the audio processing queue.
pub trait ObjectStore: Send + Sync {
    fn upload_audio(
        &self,
        user_id: Uuid,
        filename: &str,
        bytes: &[u8],
    ) -> impl std::future::Future<Output = Result<UploadedObject>> + Send;

    fn upload_waveform(
        &self,
        audio_key: &str,
        png_bytes: &[u8],
    ) -> impl std::future::Future<Output = Result<UploadedObject>> + Send;

    fn delete(&self, key: &str) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Filesystem-backed object store rooted at `config.object_store.root`.
/// Keys are `<user_id>/<uuid>-<filename>` for audio and `<audio-key>.png`
/// for waveforms; URLs are `file://` paths under the root until a real CDN
/// front-end is wired up.
#[derive(Debug, Clone)]
pub struct FilesystemObjectStore {
    root: PathBuf,
}

impl FilesystemObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn url_for(&self, key: &str) -> String {
        format!("file://{}", self.root.join(key).display())
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<UploadedObject> {
        let path = self.root.join(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Internal(format!("creating object store directory: {}", e)))?;
        }
        let mut file = tokio::fs::File::create(&path)
            .await
            .map_err(|e| Error::Internal(format!("creating object {}: {}", key, e)))?;
        file.write_all(bytes)
            .await
            .map_err(|e| Error::Internal(format!("writing object {}: {}", key, e)))?;
        Ok(UploadedObject {
            key: key.to_string(),
            url: self.url_for(key),
            size: bytes.len() as u64,
        })
    }
}

impl ObjectStore for FilesystemObjectStore {
    async fn upload_audio(&self, user_id: Uuid, filename: &str, bytes: &[u8]) -> Result<UploadedObject> {
        let key = format!("{}/{}-{}", user_id, Uuid::new_v4(), sanitize_filename(filename));
        self.write(&key, bytes).await
    }

    async fn upload_waveform(&self, audio_key: &str, png_bytes: &[u8]) -> Result<UploadedObject> {
        let key = format!("{}.png", audio_key);
        self.write(&key, png_bytes).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.root.join(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Internal(format!("deleting object {}: {}", key, e))),
        }
    }
}

/// Strip path separators out of a user-supplied filename so it cannot
/// escape the object store root.
fn sanitize_filename(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("upload")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_audio_upload_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path());
        let user_id = Uuid::new_v4();

        let uploaded = store.upload_audio(user_id, "track.wav", b"riff-data").await.unwrap();
        assert_eq!(uploaded.size, 9);
        assert!(dir.path().join(&uploaded.key).exists());

        store.delete(&uploaded.key).await.unwrap();
        assert!(!dir.path().join(&uploaded.key).exists());
    }

    #[tokio::test]
    async fn waveform_key_is_derived_from_audio_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path());
        let user_id = Uuid::new_v4();

        let audio = store.upload_audio(user_id, "track.wav", b"data").await.unwrap();
        let waveform = store.upload_waveform(&audio.key, b"\x89PNG").await.unwrap();
        assert_eq!(waveform.key, format!("{}.png", audio.key));
    }

    #[test]
    fn sanitize_filename_strips_path_traversal() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("track.wav"), "track.wav");
    }

    #[tokio::test]
    async fn delete_of_missing_key_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FilesystemObjectStore::new(dir.path());
        store.delete("never-existed").await.unwrap();
    }
}
