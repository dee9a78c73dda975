//! Entities the core owns or reads: users, posts, play history and the
//! social-graph edges (block/mute/follow) consumed by feed composition.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A registered Loop user, as read by the recommendation gateway and
/// feed composition. Owned and written by the external user service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub display_name: String,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub daw_preference: Option<String>,
    #[serde(default)]
    pub follower_count: i64,
    pub is_private: bool,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

/// Forward-only processing state machine for an uploaded post.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Complete,
    Failed,
}

impl ProcessingStatus {
    /// Whether a transition to `next` is legal: strictly
    /// `pending -> processing -> (complete | failed)`, no backward moves.
    pub fn can_transition_to(self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Pending, Processing) | (Processing, Complete) | (Processing, Failed)
        )
    }
}

/// Acoustic BPM/key detection result attached to a post by the analyser.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectedAttributes {
    #[serde(default)]
    pub detected_bpm: Option<f32>,
    #[serde(default)]
    pub detected_bpm_confidence: Option<f32>,
    #[serde(default)]
    pub detected_key: Option<String>,
    #[serde(default)]
    pub detected_key_camelot: Option<String>,
    #[serde(default)]
    pub detected_key_confidence: Option<f32>,
    #[serde(default)]
    pub detected_tags: Vec<String>,
    #[serde(default)]
    pub detected_genres: Vec<String>,
    #[serde(default)]
    pub detected_moods: Vec<String>,
    #[serde(default)]
    pub detected_instruments: Vec<String>,
    #[serde(default)]
    pub has_vocals: Option<bool>,
    #[serde(default)]
    pub is_danceable: Option<bool>,
    #[serde(default)]
    pub arousal: Option<f32>,
    #[serde(default)]
    pub valence: Option<f32>,
}

/// One unit of user-uploaded audio with authoring metadata, owned through
/// the processing state machine by the audio queue and read by the
/// recommendation gateway and feed composition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Post {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub audio_url: String,
    #[serde(default)]
    pub waveform_url: String,
    #[serde(default)]
    pub duration: f32,
    #[serde(default)]
    pub bpm: Option<f32>,
    #[serde(default)]
    pub key: Option<String>,
    #[serde(flatten)]
    pub detected: DetectedAttributes,
    #[serde(default)]
    pub genre: Vec<String>,
    #[serde(default)]
    pub like_count: i64,
    #[serde(default)]
    pub play_count: i64,
    #[serde(default)]
    pub comment_count: i64,
    pub is_public: bool,
    pub is_archived: bool,
    pub processing_status: ProcessingStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Post {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// An implicit feedback signal: a user played a post, consumed by the
/// recommendation gateway as feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayHistoryEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub post_id: Uuid,
    pub duration_played: f32,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
}

/// The three visibility-affecting social-graph relations feed composition
/// reads: blocks, mutes, and follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SocialEdgeKind {
    Block,
    Mute,
    Follow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocialEdge {
    pub kind: SocialEdgeKind,
    pub actor_id: Uuid,
    pub target_id: Uuid,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_to_processing_is_legal() {
        assert!(ProcessingStatus::Pending.can_transition_to(ProcessingStatus::Processing));
    }

    #[test]
    fn processing_to_complete_or_failed_is_legal() {
        assert!(ProcessingStatus::Processing.can_transition_to(ProcessingStatus::Complete));
        assert!(ProcessingStatus::Processing.can_transition_to(ProcessingStatus::Failed));
    }

    #[test]
    fn backward_transitions_are_illegal() {
        assert!(!ProcessingStatus::Complete.can_transition_to(ProcessingStatus::Processing));
        assert!(!ProcessingStatus::Processing.can_transition_to(ProcessingStatus::Pending));
        assert!(!ProcessingStatus::Failed.can_transition_to(ProcessingStatus::Processing));
    }

    #[test]
    fn pending_cannot_skip_to_complete() {
        assert!(!ProcessingStatus::Pending.can_transition_to(ProcessingStatus::Complete));
    }
}
