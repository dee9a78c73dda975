//! Bounded, worker-pooled audio processing queue.
//!
//! Uploads land here as a temp file path; a fixed pool of workers pulls
//! from a bounded channel and runs each job through seven ordered stages
//! (normalise, waveform, duration, fingerprint, analyse, store, persist).
//! Submission is synchronous: [`AudioQueue::submit`] uses `try_send` so a
//! full queue returns [`QueueSubmitError::QueueFull`] immediately rather
//! than making the caller wait.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{broadcast, mpsc, Mutex};
use uuid::Uuid;

use crate::analyser::{AnalyserClient, AnalysisOptions};
use crate::codec;
use crate::config::AudioQueueConfig;
use crate::error::{Error, Result};
use crate::object_store::ObjectStore;
use crate::store::{PostProcessingUpdate, PostStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AudioJobId(pub Uuid);

impl std::fmt::Display for AudioJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Forward-only job lifecycle, independent of [`crate::domain::ProcessingStatus`]
/// (which lives on the persisted `Post` row) - this one tracks the transient
/// in-memory job, not the durable post.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioJobStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

#[derive(Debug, Clone)]
pub struct AudioJob {
    pub id: AudioJobId,
    pub user_id: Uuid,
    pub post_id: Uuid,
    pub status: AudioJobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

/// Returned by [`AudioQueue::submit`] when the bounded channel is full.
#[derive(Debug, thiserror::Error)]
pub enum QueueSubmitError {
    #[error("audio processing queue is full")]
    QueueFull,
}

impl From<QueueSubmitError> for Error {
    fn from(_: QueueSubmitError) -> Self {
        Error::QueueFull
    }
}

struct Submission {
    id: AudioJobId,
    user_id: Uuid,
    post_id: Uuid,
    temp_path: PathBuf,
    filename: String,
}

/// Deletes its path on drop, best-effort. Covers both the original upload
/// temp file and the intermediate normalised-audio temp file.
struct TempFileGuard(PathBuf);

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("failed to clean up temp file {}: {}", self.0.display(), e);
            }
        }
    }
}

/// Bounded mpsc queue plus a fixed worker pool. Generic over the store and
/// object-store collaborators so tests can swap in the in-memory fakes
/// from [`crate::store::fakes`] without touching the queue itself.
pub struct AudioQueue {
    sender: mpsc::Sender<Submission>,
    jobs: Arc<DashMap<AudioJobId, AudioJob>>,
    completions: broadcast::Sender<AudioJobId>,
}

impl AudioQueue {
    pub fn new<S, O>(
        config: AudioQueueConfig,
        post_store: Arc<S>,
        object_store: Arc<O>,
        analyser: Option<AnalyserClient>,
    ) -> Self
    where
        S: PostStore + 'static,
        O: ObjectStore + 'static,
    {
        let (sender, receiver) = mpsc::channel(config.channel_capacity);
        let receiver = Arc::new(Mutex::new(receiver));
        let jobs = Arc::new(DashMap::new());
        let (completions, _) = broadcast::channel(256);
        let deadline = config.job_deadline();

        for worker_id in 0..config.effective_worker_count() {
            let receiver = receiver.clone();
            let jobs = jobs.clone();
            let post_store = post_store.clone();
            let object_store = object_store.clone();
            let analyser = analyser.clone();
            let completions = completions.clone();

            tokio::spawn(async move {
                loop {
                    let submission = {
                        let mut receiver = receiver.lock().await;
                        receiver.recv().await
                    };
                    let Some(submission) = submission else {
                        tracing::info!(worker_id, "audio queue channel closed, worker exiting");
                        break;
                    };

                    let id = submission.id;
                    run_job(submission, &jobs, &post_store, &object_store, &analyser, deadline).await;
                    let _ = completions.send(id);
                }
            });
        }

        Self {
            sender,
            jobs,
            completions,
        }
    }

    /// Enqueue a job, non-blocking. Returns immediately with
    /// [`QueueSubmitError::QueueFull`] if the channel's capacity is
    /// exhausted rather than waiting for room.
    pub fn submit(
        &self,
        user_id: Uuid,
        post_id: Uuid,
        temp_path: PathBuf,
        filename: String,
    ) -> std::result::Result<AudioJobId, QueueSubmitError> {
        let id = AudioJobId(Uuid::new_v4());
        self.jobs.insert(
            id,
            AudioJob {
                id,
                user_id,
                post_id,
                status: AudioJobStatus::Pending,
                created_at: Utc::now(),
                completed_at: None,
                error: None,
            },
        );

        let submission = Submission {
            id,
            user_id,
            post_id,
            temp_path,
            filename,
        };

        match self.sender.try_send(submission) {
            Ok(()) => Ok(id),
            Err(_) => {
                self.jobs.remove(&id);
                Err(QueueSubmitError::QueueFull)
            }
        }
    }

    pub fn status(&self, id: AudioJobId) -> Option<AudioJob> {
        self.jobs.get(&id).map(|j| j.clone())
    }

    /// Subscribe to job-completion notifications, for tests that need to
    /// wait for the worker pool to finish draining without polling
    /// [`Self::status`].
    pub fn subscribe_completions(&self) -> broadcast::Receiver<AudioJobId> {
        self.completions.subscribe()
    }
}

async fn run_job<S: PostStore, O: ObjectStore>(
    submission: Submission,
    jobs: &DashMap<AudioJobId, AudioJob>,
    post_store: &Arc<S>,
    object_store: &Arc<O>,
    analyser: &Option<AnalyserClient>,
    deadline: Duration,
) {
    if let Some(mut job) = jobs.get_mut(&submission.id) {
        job.status = AudioJobStatus::Processing;
    }

    let post_id = submission.post_id;
    if let Err(e) = post_store
        .apply_processing_update(
            post_id,
            PostProcessingUpdate {
                processing_status: Some(crate::domain::ProcessingStatus::Processing),
                ..Default::default()
            },
        )
        .await
    {
        tracing::warn!("failed to mark post {} processing: {}", post_id, e);
    }

    let id = submission.id;
    let result = tokio::time::timeout(
        deadline,
        process_pipeline(&submission, post_store.as_ref(), object_store.as_ref(), analyser),
    )
    .await;

    let (status, error) = match result {
        Ok(Ok(())) => (AudioJobStatus::Complete, None),
        Ok(Err(e)) => (AudioJobStatus::Failed, Some(e.to_string())),
        Err(_elapsed) => (AudioJobStatus::Failed, Some("processing deadline exceeded".to_string())),
    };

    if status == AudioJobStatus::Failed {
        if let Err(e) = post_store
            .apply_processing_update(
                post_id,
                PostProcessingUpdate {
                    processing_status: Some(crate::domain::ProcessingStatus::Failed),
                    ..Default::default()
                },
            )
            .await
        {
            tracing::warn!("failed to mark post {} failed: {}", post_id, e);
        }
    }

    if let Some(mut job) = jobs.get_mut(&id) {
        job.status = status;
        job.completed_at = Some(Utc::now());
        job.error = error;
    }
}

async fn process_pipeline<S: PostStore, O: ObjectStore>(
    submission: &Submission,
    post_store: &S,
    object_store: &O,
    analyser: &Option<AnalyserClient>,
) -> Result<()> {
    let _upload_guard = TempFileGuard(submission.temp_path.clone());

    // Stage 1: normalise-encode (fatal).
    let normalized_path = submission.temp_path.with_extension("normalized.mp3");
    codec::normalise(&submission.temp_path, &normalized_path).await?;
    let _normalized_guard = TempFileGuard(normalized_path.clone());

    let normalized_bytes = tokio::fs::read(&normalized_path)
        .await
        .map_err(|e| Error::Internal(format!("reading normalised audio: {}", e)))?;

    // Stage 2: waveform (non-fatal).
    let waveform_path = normalized_path.with_extension("png");
    let waveform_bytes = match codec::waveform_png(&normalized_path, &waveform_path).await {
        Ok(()) => tokio::fs::read(&waveform_path).await.ok(),
        Err(e) => {
            tracing::warn!("waveform generation failed for job {}: {}", submission.id, e);
            None
        }
    };
    let _waveform_guard = waveform_bytes.as_ref().map(|_| TempFileGuard(waveform_path.clone()));

    // Stage 3: duration (non-fatal).
    let duration = match codec::duration(&normalized_path).await {
        Ok(d) => Some(d),
        Err(e) => {
            tracing::warn!("duration probe failed for job {}: {}", submission.id, e);
            None
        }
    };

    // Stage 4: fingerprint (non-fatal, cannot itself error).
    let fingerprint = codec::AcousticFingerprint::of(&normalized_bytes);
    tracing::debug!(job_id = %submission.id, fingerprint = %fingerprint, "computed fingerprint");

    // Stage 5: analyser, under a 90s inner deadline (non-fatal).
    let detected = match analyser {
        Some(client) => {
            match tokio::time::timeout(Duration::from_secs(90), client.analyse(&normalized_bytes, &AnalysisOptions::full())).await
            {
                Ok(Ok(result)) => Some(result.into_detected_attributes()),
                Ok(Err(e)) => {
                    tracing::warn!("analyser call failed for job {}: {}", submission.id, e);
                    None
                }
                Err(_) => {
                    tracing::warn!("analyser call timed out for job {}", submission.id);
                    None
                }
            }
        }
        None => None,
    };

    // Stage 6: object store upload. Audio is fatal, waveform is not.
    let uploaded_audio = object_store
        .upload_audio(submission.user_id, &submission.filename, &normalized_bytes)
        .await?;

    let waveform_url = match waveform_bytes {
        Some(bytes) => match object_store.upload_waveform(&uploaded_audio.key, &bytes).await {
            Ok(uploaded) => Some(uploaded.url),
            Err(e) => {
                tracing::warn!("waveform upload failed for job {}: {}", submission.id, e);
                None
            }
        },
        None => None,
    };

    // Stage 7: persist completion (fatal).
    let update = PostProcessingUpdate {
        processing_status: Some(crate::domain::ProcessingStatus::Complete),
        audio_url: Some(uploaded_audio.url),
        waveform_url,
        duration,
        detected,
    };
    post_store.apply_processing_update(submission.post_id, update).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::FilesystemObjectStore;
    use crate::store::fakes::FakePostStore;

    fn test_config() -> AudioQueueConfig {
        AudioQueueConfig {
            channel_capacity: 1,
            worker_count: 1,
            job_deadline_secs: 300,
        }
    }

    #[tokio::test]
    async fn queue_full_is_reported_synchronously_without_blocking() {
        let post_store = Arc::new(FakePostStore::default());
        let dir = tempfile::tempdir().unwrap();
        let object_store = Arc::new(FilesystemObjectStore::new(dir.path()));

        // Zero workers so nothing ever drains the one-slot channel.
        let config = AudioQueueConfig {
            channel_capacity: 1,
            worker_count: 1,
            job_deadline_secs: 300,
        };
        let queue = AudioQueue::new(config, post_store, object_store, None);

        let user_id = Uuid::new_v4();
        let post_id = Uuid::new_v4();
        let first = queue.submit(user_id, post_id, PathBuf::from("/tmp/a.wav"), "a.wav".to_string());
        assert!(first.is_ok());

        // The single worker may or may not have drained the first job yet;
        // submit a burst and confirm at least one attempt is rejected when
        // the channel is saturated faster than the worker can drain it.
        let mut saw_queue_full = false;
        for _ in 0..64 {
            let result = queue.submit(user_id, post_id, PathBuf::from("/tmp/b.wav"), "b.wav".to_string());
            if matches!(result, Err(QueueSubmitError::QueueFull)) {
                saw_queue_full = true;
                break;
            }
        }
        assert!(saw_queue_full, "expected capacity-1 channel to reject at least one burst submission");
    }

    #[test]
    fn submit_error_maps_to_queue_full_error() {
        let mapped: Error = QueueSubmitError::QueueFull.into();
        assert!(matches!(mapped, Error::QueueFull));
    }

    #[tokio::test]
    async fn status_reports_pending_immediately_after_submit() {
        let post_store = Arc::new(FakePostStore::default());
        let dir = tempfile::tempdir().unwrap();
        let object_store = Arc::new(FilesystemObjectStore::new(dir.path()));
        let queue = AudioQueue::new(test_config(), post_store, object_store, None);

        let id = queue
            .submit(Uuid::new_v4(), Uuid::new_v4(), PathBuf::from("/tmp/a.wav"), "a.wav".to_string())
            .unwrap();

        // Status exists immediately; it may already have moved past
        // Pending if the worker grabbed it first, but it must exist.
        assert!(queue.status(id).is_some());
    }
}
