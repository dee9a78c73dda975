//! Feed composition: orchestrates the rate limiter, response cache,
//! recommendation gateway and the store traits into a single ranked,
//! hydrated, paginated response per request.
//!
//! The ordering in [`FeedService::get_feed`] is load-bearing: admission
//! before cache lookup before the recommender call before visibility
//! filtering before hydration before the cache write. Each stage can
//! short-circuit the ones after it, and visibility filtering must run
//! strictly after the recommender call (it can only drop candidates, never
//! ask the recommender for fewer).

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Post, User};
use crate::error::{Error, Result};
use crate::rate_limit::{derive_key, enforce, RateLimiter, RouteClass};
use crate::recommender::{RecommendedPost, RecommenderClient};
use crate::store::{PostStore, SocialGraphStore, UserStore};

#[cfg(feature = "cache")]
use crate::response_cache::{cache_key, ResponseCache};

fn unauthorized() -> Error {
    Error::Unauthorized("a personalised feed requires an authenticated viewer".to_string())
}

fn bad_request(message: &str) -> Error {
    Error::BadRequest(message.to_string())
}

/// TTL for a personalised (`for-you`) feed response: short, since a fresh
/// upload or follow should show up without a long stale window.
const PERSONALISED_CACHE_TTL_SECS: u64 = 30;

/// TTL for a global, viewer-independent feed response (`popular`,
/// `latest`): long, since many more requests can share one cached body.
const GLOBAL_CACHE_TTL_SECS: u64 = 300;

/// Which ranked list to compose. Mirrors the recommendation gateway's
/// feed operations one-for-one (`search`-class at the route layer for
/// genre/BPM/similarity queries, `default`-class for everything else).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedKind {
    ForYou,
    Popular,
    Latest,
    ByGenre,
    ByBpmRange,
    SimilarPosts,
    SimilarPostsByGenre,
}

impl FeedKind {
    fn route_class(self) -> RouteClass {
        match self {
            FeedKind::ByGenre
            | FeedKind::ByBpmRange
            | FeedKind::SimilarPosts
            | FeedKind::SimilarPostsByGenre => RouteClass::Search,
            FeedKind::ForYou | FeedKind::Popular | FeedKind::Latest => RouteClass::Default,
        }
    }

    /// Whether this kind's candidates come from the personalised
    /// for-you path rather than a global ranking - governs both the
    /// mute filter (for-you only) and the cache TTL.
    fn is_personalised(self) -> bool {
        matches!(self, FeedKind::ForYou | FeedKind::ByGenre | FeedKind::ByBpmRange)
    }
}

/// Extra parameters a [`FeedKind`] may need beyond `viewer`/`limit`/`offset`.
#[derive(Debug, Clone, Default)]
pub struct FeedParams {
    pub genre: Option<String>,
    pub min_bpm: Option<f32>,
    pub max_bpm: Option<f32>,
    pub similar_to_post_id: Option<Uuid>,
}

/// Opaque offset-based pagination cursor. The recommender only supports
/// offset pagination (see [`crate::recommender::RecommenderClient`]), so
/// the cursor is just the next offset, serialized so callers never need
/// to know that.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FeedCursor(pub u32);

impl FeedCursor {
    pub fn start() -> Self {
        Self(0)
    }
}

/// A hydrated post ready for serialization to a feed response, carrying
/// the recommender's score/rationale alongside the author projection the
/// response needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedItem {
    pub post: Post,
    pub author: User,
    pub score: f64,
    pub rationale: String,
}

/// A composed feed page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    pub next_cursor: Option<FeedCursor>,
    /// Whether the for-you -> popular -> latest fallback chain had to
    /// fall back past the kind the caller actually asked for.
    pub fallback_used: bool,
}

/// Orchestrates a single feed request across the rate limiter, response
/// cache, recommendation gateway and the store traits.
///
/// `P`/`U`/`G` are the concrete store backends, held as generic
/// parameters rather than trait objects (each has exactly one production
/// implementation); `rate_limiter` is the one collaborator held as
/// `Arc<dyn RateLimiter>`, since its backend is chosen at startup from
/// config and the kernel that builds this service doesn't know which one
/// until then.
pub struct FeedService<P, U, G> {
    post_store: P,
    user_store: U,
    social_graph: G,
    recommender: RecommenderClient,
    rate_limiter: Arc<dyn RateLimiter>,
    #[cfg(feature = "cache")]
    cache: Option<ResponseCache>,
}

impl<P, U, G> FeedService<P, U, G>
where
    P: PostStore,
    U: UserStore,
    G: SocialGraphStore,
{
    pub fn new(
        post_store: P,
        user_store: U,
        social_graph: G,
        recommender: RecommenderClient,
        rate_limiter: Arc<dyn RateLimiter>,
    ) -> Self {
        Self {
            post_store,
            user_store,
            social_graph,
            recommender,
            rate_limiter,
            #[cfg(feature = "cache")]
            cache: None,
        }
    }

    #[cfg(feature = "cache")]
    pub fn with_cache(mut self, cache: Option<ResponseCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Compose a feed page for `viewer` (`None` for anonymous requests).
    ///
    /// Order: admission -> cache lookup -> recommender call with fallback
    /// -> visibility filter -> rerank/paginate -> hydrate -> cache write.
    /// Impression tracking, once wired to a feedback sink, is recorded by
    /// the caller via [`Self::record_impressions`] as a fire-and-forget
    /// side effect - it must never be awaited on this path.
    pub async fn get_feed(
        &self,
        viewer: Option<&User>,
        kind: FeedKind,
        params: &FeedParams,
        cursor: FeedCursor,
        limit: u32,
        remote_addr: Option<&str>,
    ) -> Result<FeedPage> {
        let key = derive_key(viewer.map(|u| u.id), remote_addr);
        let decision = self.rate_limiter.check(&key, kind.route_class()).await?;
        enforce(decision)?;

        let raw_cache_key = self.raw_cache_key(viewer, kind, params, cursor, limit);
        #[cfg(feature = "cache")]
        if let Some(cached) = self.lookup_cache(&raw_cache_key).await {
            return Ok(cached);
        }

        let (candidates, fallback_used) = self.fetch_candidates(viewer, kind, params, cursor, limit).await?;

        let visible = self.filter_visible(viewer, kind, candidates).await?;

        let next_cursor = if (visible.len() as u32) >= limit {
            Some(FeedCursor(cursor.0 + limit))
        } else {
            None
        };

        let items = self.hydrate(visible).await?;

        let page = FeedPage {
            items,
            next_cursor,
            fallback_used,
        };

        #[cfg(feature = "cache")]
        self.store_cache(&raw_cache_key, viewer, kind, &page).await;

        Ok(page)
    }

    /// Submit impressions for the items a viewer was actually shown, as a
    /// detached background task. Never awaited by [`Self::get_feed`]'s
    /// caller - a dropped impression is a ranking-quality regression, not
    /// a request failure.
    pub fn record_impressions(&self, viewer_id: Uuid, post_ids: Vec<Uuid>) {
        let recommender = self.recommender.clone();
        tokio::spawn(async move {
            let now = chrono::Utc::now();
            let feedback: Vec<crate::recommender::SyncFeedback> = post_ids
                .into_iter()
                .map(|post_id| crate::recommender::SyncFeedback {
                    user_id: viewer_id,
                    item_id: post_id.to_string(),
                    kind: crate::recommender::FEEDBACK_KIND_IMPRESSION.to_string(),
                    weight: 0.1,
                    ts: now,
                })
                .collect();
            if let Err(e) = recommender.sync_feedback(&feedback).await {
                tracing::debug!("impression feedback sync failed: {}", e);
            }
        });
    }

    async fn fetch_candidates(
        &self,
        viewer: Option<&User>,
        kind: FeedKind,
        params: &FeedParams,
        cursor: FeedCursor,
        limit: u32,
    ) -> Result<(Vec<RecommendedPost>, bool)> {
        match kind {
            FeedKind::ForYou => {
                let viewer = viewer.ok_or_else(unauthorized)?;
                match self.recommender.for_you(viewer.id, limit, cursor.0).await {
                    Ok(candidates) if !candidates.is_empty() => Ok((candidates, false)),
                    _ => self.fallback_from_for_you(limit, cursor).await,
                }
            }
            FeedKind::ByGenre => {
                let viewer = viewer.ok_or_else(unauthorized)?;
                let genre = params.genre.as_deref().ok_or_else(|| bad_request("genre is required"))?;
                let candidates = self
                    .recommender
                    .for_you_by_genre(viewer.id, genre, limit, cursor.0)
                    .await?;
                Ok((candidates, false))
            }
            FeedKind::ByBpmRange => {
                let viewer = viewer.ok_or_else(unauthorized)?;
                let (min_bpm, max_bpm) = params
                    .min_bpm
                    .zip(params.max_bpm)
                    .ok_or_else(|| bad_request("min_bpm and max_bpm are required"))?;
                let candidates = self
                    .recommender
                    .for_you_by_bpm_range(viewer.id, min_bpm, max_bpm, limit, cursor.0)
                    .await?;

                // The recommender's own BPM filter is a ranking hint; the
                // store holds the authoritative detected BPM, so narrow the
                // candidates down against it before anything else sees them.
                let post_ids: Vec<Uuid> = candidates.iter().map(|c| c.post_id).collect();
                let in_range = self.post_store.filter_bpm_range(&post_ids, min_bpm, max_bpm).await?;
                let in_range: std::collections::HashSet<Uuid> = in_range.into_iter().collect();
                let candidates = candidates.into_iter().filter(|c| in_range.contains(&c.post_id)).collect();

                Ok((candidates, false))
            }
            FeedKind::SimilarPosts => {
                let post_id = params
                    .similar_to_post_id
                    .ok_or_else(|| bad_request("similar_to_post_id is required"))?;
                let candidates = self.recommender.similar_posts(post_id, limit).await?;
                Ok((candidates, false))
            }
            FeedKind::SimilarPostsByGenre => {
                let post_id = params
                    .similar_to_post_id
                    .ok_or_else(|| bad_request("similar_to_post_id is required"))?;
                let genre = params.genre.as_deref().ok_or_else(|| bad_request("genre is required"))?;
                let candidates = self
                    .recommender
                    .similar_posts_by_genre(post_id, genre, limit)
                    .await?;
                Ok((candidates, false))
            }
            FeedKind::Popular => {
                let candidates = self.recommender.popular(limit, cursor.0).await?;
                Ok((candidates, false))
            }
            FeedKind::Latest => {
                let candidates = self.recommender.latest(limit, cursor.0).await?;
                Ok((candidates, false))
            }
        }
    }

    /// `for-you -> popular -> latest` fallback chain, recording whether a
    /// fallback actually had to fire.
    async fn fallback_from_for_you(&self, limit: u32, cursor: FeedCursor) -> Result<(Vec<RecommendedPost>, bool)> {
        match self.recommender.popular(limit, cursor.0).await {
            Ok(candidates) if !candidates.is_empty() => Ok((candidates, true)),
            _ => {
                let candidates = self.recommender.latest(limit, cursor.0).await?;
                Ok((candidates, true))
            }
        }
    }

    /// Drop candidates the viewer must not see: blocks always (symmetric),
    /// mutes only for `for-you`-shaped kinds, private-account posts unless
    /// the viewer follows the author.
    async fn filter_visible(
        &self,
        viewer: Option<&User>,
        kind: FeedKind,
        candidates: Vec<RecommendedPost>,
    ) -> Result<Vec<RecommendedPost>> {
        let Some(viewer) = viewer else {
            return Ok(candidates);
        };

        let post_ids: Vec<Uuid> = candidates.iter().map(|c| c.post_id).collect();
        let posts = self.post_store.find_by_ids(&post_ids).await?;
        let posts_by_id: std::collections::HashMap<Uuid, Post> =
            posts.into_iter().map(|p| (p.id, p)).collect();

        let mut visible = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let Some(post) = posts_by_id.get(&candidate.post_id) else {
                continue;
            };

            if self.social_graph.is_blocked(viewer.id, post.user_id).await? {
                continue;
            }

            if kind.is_personalised() && self.social_graph.is_muted(viewer.id, post.user_id).await? {
                continue;
            }

            if post.user_id != viewer.id {
                let author = self.user_store.find_by_id(post.user_id).await?;
                if let Some(author) = author {
                    if author.is_private && !self.social_graph.is_following(viewer.id, author.id).await? {
                        continue;
                    }
                }
            }

            visible.push(candidate);
        }
        Ok(visible)
    }

    /// Hydrate candidates against the stores, preserving the
    /// recommender's original order - a stable filter-map, never a
    /// re-sort. Ids that no longer resolve (soft-deleted, missing) are
    /// dropped silently.
    async fn hydrate(&self, candidates: Vec<RecommendedPost>) -> Result<Vec<FeedItem>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let post_ids: Vec<Uuid> = candidates.iter().map(|c| c.post_id).collect();
        let posts = self.post_store.find_by_ids(&post_ids).await?;
        let posts_by_id: std::collections::HashMap<Uuid, Post> =
            posts.into_iter().map(|p| (p.id, p)).collect();

        let user_ids: Vec<Uuid> = posts_by_id.values().map(|p| p.user_id).collect();
        let users = self.user_store.find_by_ids(&user_ids).await?;
        let users_by_id: std::collections::HashMap<Uuid, User> =
            users.into_iter().map(|u| (u.id, u)).collect();

        let mut items = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let Some(post) = posts_by_id.get(&candidate.post_id) else {
                continue;
            };
            let Some(author) = users_by_id.get(&post.user_id) else {
                continue;
            };
            items.push(FeedItem {
                post: post.clone(),
                author: author.clone(),
                score: candidate.score,
                rationale: candidate.rationale,
            });
        }
        Ok(items)
    }

    fn raw_cache_key(
        &self,
        viewer: Option<&User>,
        kind: FeedKind,
        params: &FeedParams,
        cursor: FeedCursor,
        limit: u32,
    ) -> String {
        format!(
            "kind={:?}&genre={:?}&min_bpm={:?}&max_bpm={:?}&similar_to={:?}&cursor={}&limit={}&viewer={:?}",
            kind,
            params.genre,
            params.min_bpm,
            params.max_bpm,
            params.similar_to_post_id,
            cursor.0,
            limit,
            viewer.map(|u| u.id),
        )
    }

    #[cfg(feature = "cache")]
    async fn lookup_cache(&self, raw_query: &str) -> Option<FeedPage> {
        let cache = self.cache.as_ref()?;
        let key = cache_key("/feed", raw_query, None);
        let bytes = cache.get(&key).await?;
        serde_json::from_slice(&bytes).ok()
    }

    #[cfg(feature = "cache")]
    async fn store_cache(&self, raw_query: &str, viewer: Option<&User>, kind: FeedKind, page: &FeedPage) {
        let Some(cache) = self.cache.as_ref() else {
            return;
        };
        let Ok(bytes) = serde_json::to_vec(page) else {
            return;
        };
        let key = cache_key("/feed", raw_query, None);
        let ttl = if kind.is_personalised() && viewer.is_some() {
            PERSONALISED_CACHE_TTL_SECS
        } else {
            GLOBAL_CACHE_TTL_SECS
        };
        cache.put(&key, &bytes, ttl).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::fakes::{FakePostStore, FakeSocialGraphStore, FakeUserStore};

    fn make_user(is_private: bool) -> User {
        User {
            id: Uuid::new_v4(),
            username: "alice".to_string(),
            display_name: "Alice".to_string(),
            genres: vec![],
            daw_preference: None,
            follower_count: 0,
            is_private,
            is_admin: false,
            created_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn for_you_is_personalised_and_popular_is_not() {
        assert!(FeedKind::ForYou.is_personalised());
        assert!(!FeedKind::Popular.is_personalised());
        assert!(!FeedKind::Latest.is_personalised());
    }

    #[test]
    fn search_style_kinds_use_search_route_class() {
        assert_eq!(FeedKind::ByGenre.route_class(), RouteClass::Search);
        assert_eq!(FeedKind::SimilarPosts.route_class(), RouteClass::Search);
        assert_eq!(FeedKind::ForYou.route_class(), RouteClass::Default);
    }

    #[tokio::test]
    async fn filter_visible_drops_posts_from_blocked_authors() {
        let viewer = make_user(false);
        let author = make_user(false);

        let post_store = FakePostStore::default();
        let post = post_store.create_pending(author.id, "a.mp3".into()).await.unwrap();

        let social_graph = FakeSocialGraphStore::default();
        social_graph
            .record_edge(crate::domain::SocialEdgeKind::Block, viewer.id, author.id)
            .await
            .unwrap();

        let user_store = FakeUserStore::default();
        user_store.users.insert(author.id, author.clone());

        let service = test_service(post_store, user_store, social_graph);

        let candidates = vec![RecommendedPost {
            post_id: post.id,
            score: 0.9,
            rationale: "test".to_string(),
        }];
        let visible = service.filter_visible(Some(&viewer), FeedKind::Popular, candidates).await.unwrap();
        assert!(visible.is_empty());
    }

    #[tokio::test]
    async fn filter_visible_drops_private_author_unless_followed() {
        let viewer = make_user(false);
        let author = make_user(true);

        let post_store = FakePostStore::default();
        let post = post_store.create_pending(author.id, "a.mp3".into()).await.unwrap();

        let user_store = FakeUserStore::default();
        user_store.users.insert(author.id, author.clone());

        let social_graph = FakeSocialGraphStore::default();
        let service = test_service(post_store, user_store, social_graph);

        let candidates = vec![RecommendedPost {
            post_id: post.id,
            score: 0.9,
            rationale: "test".to_string(),
        }];
        let visible = service
            .filter_visible(Some(&viewer), FeedKind::Popular, candidates.clone())
            .await
            .unwrap();
        assert!(visible.is_empty());

        service
            .social_graph
            .record_edge(crate::domain::SocialEdgeKind::Follow, viewer.id, author.id)
            .await
            .unwrap();
        let visible = service.filter_visible(Some(&viewer), FeedKind::Popular, candidates).await.unwrap();
        assert_eq!(visible.len(), 1);
    }

    #[tokio::test]
    async fn hydrate_preserves_recommender_order_and_drops_unresolved() {
        let post_store = FakePostStore::default();
        let author = make_user(false);
        let user_store = FakeUserStore::default();
        user_store.users.insert(author.id, author.clone());

        let post_a = post_store.create_pending(author.id, "a.mp3".into()).await.unwrap();
        let post_b = post_store.create_pending(author.id, "b.mp3".into()).await.unwrap();
        let missing_id = Uuid::new_v4();

        let social_graph = FakeSocialGraphStore::default();
        let service = test_service(post_store, user_store, social_graph);

        let candidates = vec![
            RecommendedPost { post_id: post_b.id, score: 0.9, rationale: "b".to_string() },
            RecommendedPost { post_id: missing_id, score: 0.8, rationale: "missing".to_string() },
            RecommendedPost { post_id: post_a.id, score: 0.5, rationale: "a".to_string() },
        ];

        let items = service.hydrate(candidates).await.unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].post.id, post_b.id);
        assert_eq!(items[1].post.id, post_a.id);
    }

    fn test_service(
        post_store: FakePostStore,
        user_store: FakeUserStore,
        social_graph: FakeSocialGraphStore,
    ) -> FeedService<FakePostStore, FakeUserStore, FakeSocialGraphStore> {
        let recommender = RecommenderClient::new(reqwest::Client::new(), "http://127.0.0.1:1");
        let rate_limiter: Arc<dyn RateLimiter> = crate::rate_limit::TokenBucketLimiter::new(crate::config::RateLimitConfig::default());
        FeedService::new(post_store, user_store, social_graph, recommender, rate_limiter)
    }
}
