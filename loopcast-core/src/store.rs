//! Read/write surfaces onto the relational store, expressed as traits so
//! feed composition, the recommendation gateway and the audio queue can be
//! tested against an in-memory fake without a database.
//!
//! Uses RPITIT (return-position `impl Trait` in traits) the same way
//! [`crate::repository::Repository`] does, but these traits are
//! service-shaped rather than generic CRUD: each method names the query
//! the caller actually needs.

use std::future::Future;
use uuid::Uuid;

use crate::domain::{Post, SocialEdgeKind, User};
use crate::error::Result;

/// Fields the audio queue is allowed to update once a post finishes
/// processing. `processing_status` transitions forward-only; callers are
/// expected to have already checked [`crate::domain::ProcessingStatus::can_transition_to`].
#[derive(Debug, Clone, Default)]
pub struct PostProcessingUpdate {
    pub processing_status: Option<crate::domain::ProcessingStatus>,
    pub audio_url: Option<String>,
    pub waveform_url: Option<String>,
    pub duration: Option<f32>,
    pub detected: Option<crate::domain::DetectedAttributes>,
}

/// Post persistence and lookup, consumed by feed composition (hydration)
/// and the audio processing queue (status transitions).
pub trait PostStore: Send + Sync {
    /// Fetch a single post, excluding soft-deleted rows.
    fn find_by_id(&self, id: Uuid) -> impl Future<Output = Result<Option<Post>>> + Send;

    /// Fetch many posts by id, excluding soft-deleted rows. Order is
    /// not guaranteed; callers that need to preserve recommender ranking
    /// must re-sort against their original id list.
    fn find_by_ids(&self, ids: &[Uuid]) -> impl Future<Output = Result<Vec<Post>>> + Send;

    /// Insert a new post row in `Pending` processing state.
    fn create_pending(
        &self,
        user_id: Uuid,
        audio_url: String,
    ) -> impl Future<Output = Result<Post>> + Send;

    /// Apply a processing update. Returns `Ok(false)` if no row matched
    /// `id`, never panics on an illegal transition - callers validate first.
    fn apply_processing_update(
        &self,
        id: Uuid,
        update: PostProcessingUpdate,
    ) -> impl Future<Output = Result<bool>> + Send;

    /// All public, non-archived, non-deleted posts for a user, newest first.
    fn find_public_by_user(
        &self,
        user_id: Uuid,
        limit: u32,
    ) -> impl Future<Output = Result<Vec<Post>>> + Send;

    /// Narrow `ids` down to the ones whose stored `bpm` falls within
    /// `[min_bpm, max_bpm]`, preserving `ids`' order. The recommender's own
    /// BPM filter is only a ranking hint; this is the authoritative check
    /// against the persisted value, since the gateway's index can lag a
    /// post's detected BPM. Posts with no detected BPM are excluded.
    fn filter_bpm_range(
        &self,
        ids: &[Uuid],
        min_bpm: f32,
        max_bpm: f32,
    ) -> impl Future<Output = Result<Vec<Uuid>>> + Send;
}

/// User persistence and lookup.
pub trait UserStore: Send + Sync {
    fn find_by_id(&self, id: Uuid) -> impl Future<Output = Result<Option<User>>> + Send;

    fn find_by_ids(&self, ids: &[Uuid]) -> impl Future<Output = Result<Vec<User>>> + Send;

    fn find_by_username(&self, username: &str) -> impl Future<Output = Result<Option<User>>> + Send;
}

/// Block/mute/follow relations, consumed by feed composition's visibility
/// filter.
pub trait SocialGraphStore: Send + Sync {
    /// True if either user has blocked the other (block is symmetric for
    /// visibility purposes even though it is stored as a directed edge).
    fn is_blocked(&self, a: Uuid, b: Uuid) -> impl Future<Output = Result<bool>> + Send;

    /// True if `actor` has muted `target`. Muting is directional and only
    /// affects `for_you`-style personalised feeds, never explicit profile
    /// browsing.
    fn is_muted(&self, actor: Uuid, target: Uuid) -> impl Future<Output = Result<bool>> + Send;

    /// True if `follower` follows `target`.
    fn is_following(&self, follower: Uuid, target: Uuid) -> impl Future<Output = Result<bool>> + Send;

    /// Record a new edge. Used by the follow/block/mute endpoints; exposed
    /// here so a single store handles all three relation kinds uniformly.
    fn record_edge(
        &self,
        kind: SocialEdgeKind,
        actor_id: Uuid,
        target_id: Uuid,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Remove an edge, if present. Returns `true` if a row was removed.
    fn remove_edge(
        &self,
        kind: SocialEdgeKind,
        actor_id: Uuid,
        target_id: Uuid,
    ) -> impl Future<Output = Result<bool>> + Send;
}

#[cfg(test)]
pub mod fakes {
    //! In-memory fakes for unit-testing feed composition and the
    //! recommendation gateway without a database.

    use super::*;
    use dashmap::DashMap;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakePostStore {
        pub posts: DashMap<Uuid, Post>,
    }

    impl PostStore for FakePostStore {
        async fn find_by_id(&self, id: Uuid) -> Result<Option<Post>> {
            Ok(self
                .posts
                .get(&id)
                .filter(|p| !p.is_deleted())
                .map(|p| p.clone()))
        }

        async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Post>> {
            Ok(ids
                .iter()
                .filter_map(|id| self.posts.get(id).filter(|p| !p.is_deleted()).map(|p| p.clone()))
                .collect())
        }

        async fn create_pending(&self, user_id: Uuid, audio_url: String) -> Result<Post> {
            use crate::domain::{DetectedAttributes, ProcessingStatus};
            let post = Post {
                id: Uuid::new_v4(),
                user_id,
                audio_url,
                waveform_url: String::new(),
                duration: 0.0,
                bpm: None,
                key: None,
                detected: DetectedAttributes::default(),
                genre: Vec::new(),
                like_count: 0,
                play_count: 0,
                comment_count: 0,
                is_public: true,
                is_archived: false,
                processing_status: ProcessingStatus::Pending,
                created_at: chrono::Utc::now(),
                deleted_at: None,
            };
            self.posts.insert(post.id, post.clone());
            Ok(post)
        }

        async fn apply_processing_update(&self, id: Uuid, update: PostProcessingUpdate) -> Result<bool> {
            let Some(mut entry) = self.posts.get_mut(&id) else {
                return Ok(false);
            };
            if let Some(status) = update.processing_status {
                entry.processing_status = status;
            }
            if let Some(url) = update.audio_url {
                entry.audio_url = url;
            }
            if let Some(url) = update.waveform_url {
                entry.waveform_url = url;
            }
            if let Some(d) = update.duration {
                entry.duration = d;
            }
            if let Some(detected) = update.detected {
                entry.detected = detected;
            }
            Ok(true)
        }

        async fn find_public_by_user(&self, user_id: Uuid, limit: u32) -> Result<Vec<Post>> {
            let mut posts: Vec<Post> = self
                .posts
                .iter()
                .filter(|p| {
                    p.user_id == user_id && p.is_public && !p.is_archived && !p.is_deleted()
                })
                .map(|p| p.clone())
                .collect();
            posts.sort_by_key(|p| std::cmp::Reverse(p.created_at));
            posts.truncate(limit as usize);
            Ok(posts)
        }

        async fn filter_bpm_range(&self, ids: &[Uuid], min_bpm: f32, max_bpm: f32) -> Result<Vec<Uuid>> {
            Ok(ids
                .iter()
                .filter(|id| {
                    self.posts
                        .get(id)
                        .and_then(|p| p.bpm)
                        .is_some_and(|bpm| bpm >= min_bpm && bpm <= max_bpm)
                })
                .copied()
                .collect())
        }
    }

    #[derive(Default)]
    pub struct FakeUserStore {
        pub users: DashMap<Uuid, User>,
    }

    impl UserStore for FakeUserStore {
        async fn find_by_id(&self, id: Uuid) -> Result<Option<User>> {
            Ok(self.users.get(&id).map(|u| u.clone()))
        }

        async fn find_by_ids(&self, ids: &[Uuid]) -> Result<Vec<User>> {
            Ok(ids.iter().filter_map(|id| self.users.get(id).map(|u| u.clone())).collect())
        }

        async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
            Ok(self.users.iter().find(|u| u.username == username).map(|u| u.clone()))
        }
    }

    #[derive(Default)]
    pub struct FakeSocialGraphStore {
        blocks: Mutex<HashSet<(Uuid, Uuid)>>,
        mutes: Mutex<HashSet<(Uuid, Uuid)>>,
        follows: Mutex<HashSet<(Uuid, Uuid)>>,
    }

    impl SocialGraphStore for FakeSocialGraphStore {
        async fn is_blocked(&self, a: Uuid, b: Uuid) -> Result<bool> {
            let blocks = self.blocks.lock().unwrap();
            Ok(blocks.contains(&(a, b)) || blocks.contains(&(b, a)))
        }

        async fn is_muted(&self, actor: Uuid, target: Uuid) -> Result<bool> {
            Ok(self.mutes.lock().unwrap().contains(&(actor, target)))
        }

        async fn is_following(&self, follower: Uuid, target: Uuid) -> Result<bool> {
            Ok(self.follows.lock().unwrap().contains(&(follower, target)))
        }

        async fn record_edge(&self, kind: SocialEdgeKind, actor_id: Uuid, target_id: Uuid) -> Result<()> {
            let set = match kind {
                SocialEdgeKind::Block => &self.blocks,
                SocialEdgeKind::Mute => &self.mutes,
                SocialEdgeKind::Follow => &self.follows,
            };
            set.lock().unwrap().insert((actor_id, target_id));
            Ok(())
        }

        async fn remove_edge(&self, kind: SocialEdgeKind, actor_id: Uuid, target_id: Uuid) -> Result<bool> {
            let set = match kind {
                SocialEdgeKind::Block => &self.blocks,
                SocialEdgeKind::Mute => &self.mutes,
                SocialEdgeKind::Follow => &self.follows,
            };
            Ok(set.lock().unwrap().remove(&(actor_id, target_id)))
        }
    }

    #[tokio::test]
    async fn block_is_symmetric_for_visibility() {
        let store = FakeSocialGraphStore::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        store.record_edge(SocialEdgeKind::Block, a, b).await.unwrap();
        assert!(store.is_blocked(a, b).await.unwrap());
        assert!(store.is_blocked(b, a).await.unwrap());
    }

    #[tokio::test]
    async fn find_by_ids_excludes_soft_deleted() {
        let store = FakePostStore::default();
        let post = store.create_pending(Uuid::new_v4(), "a.mp3".into()).await.unwrap();
        let id = post.id;
        if let Some(mut p) = store.posts.get_mut(&id) {
            p.deleted_at = Some(chrono::Utc::now());
        }
        let found = store.find_by_ids(&[id]).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn filter_bpm_range_drops_out_of_range_and_unset_bpm() {
        let store = FakePostStore::default();
        let user_id = Uuid::new_v4();

        let in_range = store.create_pending(user_id, "a.mp3".into()).await.unwrap();
        store.posts.get_mut(&in_range.id).unwrap().bpm = Some(128.0);

        let out_of_range = store.create_pending(user_id, "b.mp3".into()).await.unwrap();
        store.posts.get_mut(&out_of_range.id).unwrap().bpm = Some(80.0);

        let unset = store.create_pending(user_id, "c.mp3".into()).await.unwrap();

        let ids = [in_range.id, out_of_range.id, unset.id];
        let filtered = store.filter_bpm_range(&ids, 120.0, 135.0).await.unwrap();
        assert_eq!(filtered, vec![in_range.id]);
    }
}
