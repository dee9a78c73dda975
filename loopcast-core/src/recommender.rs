//! Typed client for the recommendation gateway: sync primitives that push
//! users/items/feedback into the recommender's index, and feed operations
//! that pull ranked candidate ids back out.
//!
//! The recommender only understands "items" and "users" as opaque ids; to
//! recommend users to follow we sync each [`User`] a second time as an item
//! under a `user:<uuid>` id (the user-as-item bridge) and query item
//! similarity against it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Post, User};
use crate::error::{Error, Result};

const SYNC_CHUNK_SIZE: usize = 100;
const USER_ITEM_PREFIX: &str = "user:";
const USERS_CATEGORY: &str = "users";

/// Feedback kind for an implicit view, recorded fire-and-forget by
/// [`crate::feed::FeedService::record_impressions`].
pub const FEEDBACK_KIND_IMPRESSION: &str = "impression";
/// Feedback kind for a follow event, translated through the user-as-item
/// bridge by [`RecommenderClient::sync_follow`].
pub const FEEDBACK_KIND_FOLLOW: &str = "follow";

fn user_item_id(user_id: Uuid) -> String {
    format!("{}{}", USER_ITEM_PREFIX, user_id)
}

/// A candidate the recommender ranked, before hydration against the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendedPost {
    pub post_id: Uuid,
    pub score: f64,
    pub rationale: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncUser {
    pub id: Uuid,
    pub genres: Vec<String>,
    pub follower_count: i64,
}

impl From<&User> for SyncUser {
    fn from(u: &User) -> Self {
        Self {
            id: u.id,
            genres: u.genres.clone(),
            follower_count: u.follower_count,
        }
    }
}

/// An item synced into the recommender's index: either a post, or - via the
/// user-as-item bridge - a user registered under a `user:<uuid>` id.
/// `categories` drives the gateway's faceted similarity search (`genres`,
/// `bpm_<n>` buckets, `key_<k>`, or `users` for bridge entries); `hidden`
/// keeps unlisted/archived posts and private users out of recommendations
/// while still letting them anchor similarity for their own owner.
#[derive(Debug, Clone, Serialize)]
pub struct SyncItem {
    pub id: String,
    pub genres: Vec<String>,
    pub bpm: Option<f32>,
    pub key: Option<String>,
    pub tags: Vec<String>,
    pub categories: Vec<String>,
    pub hidden: bool,
}

/// Bucket a BPM into the nearest multiple of 10, matching the category
/// naming the gateway indexes on (`bpm_120`, `bpm_130`, ...).
fn bpm_category(bpm: f32) -> String {
    format!("bpm_{}", ((bpm / 10.0).round() as i64) * 10)
}

impl From<&Post> for SyncItem {
    fn from(post: &Post) -> Self {
        let mut categories = post.genre.clone();
        if let Some(bpm) = post.bpm {
            categories.push(bpm_category(bpm));
        }
        if let Some(key) = &post.key {
            categories.push(format!("key_{}", key));
        }
        Self {
            id: post.id.to_string(),
            genres: post.genre.clone(),
            bpm: post.bpm,
            key: post.key.clone(),
            tags: Vec::new(),
            categories,
            hidden: !post.is_public || post.is_archived,
        }
    }
}

/// Build the `user:`-prefixed item entry for the user-as-item bridge.
/// Private users are hidden from follow recommendations the same way
/// unlisted/archived posts are hidden from feed ones.
fn user_bridge_item(user: &User) -> SyncItem {
    let mut tags = vec!["type:user".to_string(), format!("username:{}", user.username)];
    if let Some(daw) = &user.daw_preference {
        tags.push(format!("daw:{}", daw));
    }
    tags.push(format!("follower_count:{}", user.follower_count));
    tags.push(format!("is_private:{}", user.is_private));

    SyncItem {
        id: user_item_id(user.id),
        genres: user.genres.clone(),
        bpm: None,
        key: None,
        tags,
        categories: vec![USERS_CATEGORY.to_string()],
        hidden: user.is_private,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncFeedback {
    pub user_id: Uuid,
    pub item_id: String,
    pub kind: String,
    pub weight: f32,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RawCandidate {
    item_id: String,
    score: f64,
    #[serde(default)]
    genres: Vec<String>,
    #[serde(default)]
    bpm: Option<f32>,
    #[serde(default)]
    age_days: Option<f64>,
    #[serde(default)]
    popularity_percentile: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct FeedResponse {
    #[serde(default)]
    items: Vec<RawCandidate>,
}

/// HTTP client for the recommendation gateway. Built once in [`crate::kernel::Kernel`]
/// with a 10s request timeout; every method here assumes that timeout is
/// already configured on `http`.
#[derive(Clone)]
pub struct RecommenderClient {
    http: reqwest::Client,
    base_url: String,
}

impl RecommenderClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn sync_batch<T: Serialize>(&self, path: &str, items: &[T]) -> Result<()> {
        for chunk in items.chunks(SYNC_CHUNK_SIZE) {
            let response = self
                .http
                .post(self.url(path))
                .json(&serde_json::json!({ "items": chunk }))
                .send()
                .await
                .map_err(Error::from)?;
            ensure_success(&response, path)?;
        }
        Ok(())
    }

    /// Idempotent upsert of users into the recommender's index - syncing
    /// the same user twice is a no-op the second time.
    pub async fn sync_users(&self, users: &[SyncUser]) -> Result<()> {
        self.sync_batch("/sync/users", users).await
    }

    /// Idempotent upsert of posts paired with their author, syncing each
    /// author through the user-as-item bridge in the same batch.
    pub async fn sync_posts(&self, posts: &[(Post, User)]) -> Result<()> {
        let mut items = Vec::with_capacity(posts.len() * 2);
        for (post, author) in posts {
            items.push(SyncItem::from(post));
            items.push(user_bridge_item(author));
        }
        self.sync_items(&items).await
    }

    pub async fn sync_items(&self, items: &[SyncItem]) -> Result<()> {
        self.sync_batch("/sync/items", items).await
    }

    pub async fn sync_feedback(&self, feedback: &[SyncFeedback]) -> Result<()> {
        self.sync_batch("/sync/feedback", feedback).await
    }

    /// Translate a follow into feedback of kind `follow` from `follower`
    /// onto the followee's user-as-item bridge entry.
    pub async fn sync_follow(&self, follower_id: Uuid, followee_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let feedback = [SyncFeedback {
            user_id: follower_id,
            item_id: user_item_id(followee_id),
            kind: FEEDBACK_KIND_FOLLOW.to_string(),
            weight: 1.0,
            ts: at,
        }];
        self.sync_feedback(&feedback).await
    }

    /// Best-effort unfollow: removes the follow feedback record if one
    /// exists. Never surfaces an error - a dropped unfollow degrades
    /// ranking quality, not correctness, so failures are logged and
    /// swallowed rather than retried inline.
    pub async fn sync_unfollow(&self, follower_id: Uuid, followee_id: Uuid) {
        let path = format!(
            "/api/feedback/{}/{}?kind={}",
            follower_id,
            user_item_id(followee_id),
            FEEDBACK_KIND_FOLLOW
        );
        match self.http.delete(self.url(&path)).send().await {
            Ok(response) if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND => {}
            Ok(response) => tracing::debug!("unfollow feedback delete on {} returned {}", path, response.status()),
            Err(e) => tracing::debug!("unfollow feedback delete on {} failed: {}", path, e),
        }
    }

    /// Fetch one page of ranked candidates from `path`, emulating offset
    /// pagination the recommender itself does not support: request
    /// `limit + offset` candidates and slice off the head.
    async fn fetch_feed(
        &self,
        path: &str,
        query: &[(&str, String)],
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RecommendedPost>> {
        let requested = limit + offset;
        let mut params: Vec<(&str, String)> = query.to_vec();
        params.push(("limit", requested.to_string()));

        let response = self
            .http
            .get(self.url(path))
            .query(&params)
            .send()
            .await
            .map_err(Error::from)?;
        ensure_success(&response, path)?;

        let body: FeedResponse = response.json().await.map_err(Error::from)?;

        let requested_genre = find_param(query, "genre");
        let requested_bpm = find_param(query, "min_bpm")
            .and_then(|min| find_param(query, "max_bpm").map(|max| (min, max)))
            .and_then(|(min, max)| min.parse().ok().zip(max.parse().ok()));

        Ok(body
            .items
            .into_iter()
            .skip(offset as usize)
            .filter_map(|c| {
                Uuid::parse_str(&c.item_id).ok().map(|post_id| {
                    let rationale = rationale_for(&c, requested_genre, requested_bpm);
                    RecommendedPost {
                        post_id,
                        score: c.score,
                        rationale,
                    }
                })
            })
            .collect())
    }

    pub async fn for_you(&self, user_id: Uuid, limit: u32, offset: u32) -> Result<Vec<RecommendedPost>> {
        self.fetch_feed("/feed/for-you", &[("user_id", user_id.to_string())], limit, offset)
            .await
    }

    pub async fn for_you_by_genre(
        &self,
        user_id: Uuid,
        genre: &str,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RecommendedPost>> {
        self.fetch_feed(
            "/feed/for-you",
            &[("user_id", user_id.to_string()), ("genre", genre.to_string())],
            limit,
            offset,
        )
        .await
    }

    pub async fn for_you_by_bpm_range(
        &self,
        user_id: Uuid,
        min_bpm: f32,
        max_bpm: f32,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RecommendedPost>> {
        self.fetch_feed(
            "/feed/for-you",
            &[
                ("user_id", user_id.to_string()),
                ("min_bpm", min_bpm.to_string()),
                ("max_bpm", max_bpm.to_string()),
            ],
            limit,
            offset,
        )
        .await
    }

    pub async fn similar_posts(&self, post_id: Uuid, limit: u32) -> Result<Vec<RecommendedPost>> {
        self.fetch_feed("/feed/similar", &[("item_id", post_id.to_string())], limit, 0)
            .await
    }

    pub async fn similar_posts_by_genre(
        &self,
        post_id: Uuid,
        genre: &str,
        limit: u32,
    ) -> Result<Vec<RecommendedPost>> {
        self.fetch_feed(
            "/feed/similar",
            &[("item_id", post_id.to_string()), ("genre", genre.to_string())],
            limit,
            0,
        )
        .await
    }

    /// Candidate users to follow, via the user-as-item bridge: query item
    /// similarity against `user:<user_id>` and strip the prefix back off.
    pub async fn users_to_follow(&self, user_id: Uuid, limit: u32) -> Result<Vec<Uuid>> {
        let response = self
            .http
            .get(self.url("/feed/similar"))
            .query(&[("item_id", user_item_id(user_id)), ("limit", limit.to_string())])
            .send()
            .await
            .map_err(Error::from)?;
        ensure_success(&response, "/feed/similar")?;

        let body: FeedResponse = response.json().await.map_err(Error::from)?;
        Ok(body
            .items
            .into_iter()
            .filter_map(|c| c.item_id.strip_prefix(USER_ITEM_PREFIX).and_then(|id| Uuid::parse_str(id).ok()))
            .collect())
    }

    /// Per the open question on recommender partial outages: any failure
    /// here degrades to an empty result rather than surfacing an error,
    /// since "users you might know" is a secondary surface, not a blocking
    /// one.
    pub async fn similar_users(&self, user_id: Uuid, limit: u32) -> Vec<Uuid> {
        self.users_to_follow(user_id, limit).await.unwrap_or_default()
    }

    pub async fn popular(&self, limit: u32, offset: u32) -> Result<Vec<RecommendedPost>> {
        self.fetch_feed("/feed/popular", &[], limit, offset).await
    }

    pub async fn latest(&self, limit: u32, offset: u32) -> Result<Vec<RecommendedPost>> {
        self.fetch_feed("/feed/latest", &[], limit, offset).await
    }
}

fn find_param<'a>(query: &'a [(&str, String)], key: &str) -> Option<&'a str> {
    query.iter().find(|(k, _)| *k == key).map(|(_, v)| v.as_str())
}

/// Build the rationale string shown alongside a recommended item from its
/// actual attributes rather than the opaque ranking score: genre match
/// against the requested genre (or the candidate's own top genre when no
/// genre was requested), BPM match against a requested range, recency, and
/// popularity. Falls back to a score-banded description only when the
/// gateway returned none of those attributes.
fn rationale_for(candidate: &RawCandidate, requested_genre: Option<&str>, requested_bpm: Option<(f32, f32)>) -> String {
    let mut reasons = Vec::new();

    match requested_genre {
        Some(genre) if candidate.genres.iter().any(|g| g.eq_ignore_ascii_case(genre)) => {
            reasons.push(format!("matches your {} genre", genre));
        }
        None => {
            if let Some(genre) = candidate.genres.first() {
                reasons.push(format!("{} you've played before", genre));
            }
        }
        _ => {}
    }

    if let (Some((min, max)), Some(bpm)) = (requested_bpm, candidate.bpm) {
        if bpm >= min && bpm <= max {
            reasons.push(format!("{:.0} BPM is in your requested range", bpm));
        }
    }

    if candidate.age_days.is_some_and(|days| days <= 3.0) {
        reasons.push("posted recently".to_string());
    }

    if candidate.popularity_percentile.is_some_and(|p| p >= 0.8) {
        reasons.push("popular with other listeners".to_string());
    }

    if reasons.is_empty() {
        if candidate.score >= 0.8 {
            "strongly matches your listening history".to_string()
        } else if candidate.score >= 0.5 {
            "similar to posts you've played".to_string()
        } else {
            "popular with listeners like you".to_string()
        }
    } else {
        reasons.join("; ")
    }
}

fn ensure_success(response: &reqwest::Response, path: &str) -> Result<()> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(Error::Upstream {
            service: "recommender".to_string(),
            message: format!("{} returned {}", path, response.status()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(score: f64) -> RawCandidate {
        RawCandidate {
            item_id: Uuid::new_v4().to_string(),
            score,
            genres: Vec::new(),
            bpm: None,
            age_days: None,
            popularity_percentile: None,
        }
    }

    #[test]
    fn rationale_falls_back_to_score_bands_with_no_attributes() {
        assert!(rationale_for(&candidate(0.9), None, None).contains("strongly"));
        assert!(rationale_for(&candidate(0.6), None, None).contains("similar"));
        assert!(rationale_for(&candidate(0.1), None, None).contains("popular"));
    }

    #[test]
    fn rationale_cites_requested_genre_match() {
        let mut c = candidate(0.4);
        c.genres = vec!["techno".to_string()];
        assert!(rationale_for(&c, Some("techno"), None).contains("techno"));
    }

    #[test]
    fn rationale_cites_bpm_range_match() {
        let mut c = candidate(0.4);
        c.bpm = Some(128.0);
        assert!(rationale_for(&c, None, Some((120.0, 135.0))).contains("BPM"));
    }

    #[test]
    fn rationale_cites_recency_and_popularity() {
        let mut c = candidate(0.4);
        c.age_days = Some(1.0);
        c.popularity_percentile = Some(0.95);
        let rationale = rationale_for(&c, None, None);
        assert!(rationale.contains("recently"));
        assert!(rationale.contains("popular"));
    }

    #[test]
    fn bpm_category_rounds_to_nearest_ten() {
        assert_eq!(bpm_category(126.0), "bpm_130");
        assert_eq!(bpm_category(124.0), "bpm_120");
    }

    #[test]
    fn sync_item_from_post_is_hidden_when_unlisted_or_archived() {
        let mut post = test_post();
        post.is_public = false;
        assert!(SyncItem::from(&post).hidden);

        let mut post = test_post();
        post.is_archived = true;
        assert!(SyncItem::from(&post).hidden);

        let post = test_post();
        assert!(!SyncItem::from(&post).hidden);
    }

    #[test]
    fn sync_item_from_post_carries_genre_bpm_and_key_categories() {
        let mut post = test_post();
        post.genre = vec!["house".to_string()];
        post.bpm = Some(124.0);
        post.key = Some("Am".to_string());
        let item = SyncItem::from(&post);
        assert!(item.categories.contains(&"house".to_string()));
        assert!(item.categories.contains(&"bpm_120".to_string()));
        assert!(item.categories.contains(&"key_Am".to_string()));
    }

    #[test]
    fn user_bridge_item_is_hidden_for_private_users() {
        let mut user = test_user();
        user.is_private = true;
        let item = user_bridge_item(&user);
        assert!(item.hidden);
        assert_eq!(item.categories, vec![USERS_CATEGORY.to_string()]);
        assert_eq!(item.id, user_item_id(user.id));
    }

    #[test]
    fn user_item_id_round_trips_through_prefix() {
        let id = Uuid::new_v4();
        let wrapped = user_item_id(id);
        assert_eq!(wrapped.strip_prefix(USER_ITEM_PREFIX).unwrap(), id.to_string());
    }

    #[tokio::test]
    async fn similar_users_degrades_to_empty_on_transport_error() {
        let client = RecommenderClient::new(reqwest::Client::new(), "http://127.0.0.1:1");
        let result = client.similar_users(Uuid::new_v4(), 10).await;
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn sync_follow_sends_follow_kind_feedback() {
        let client = RecommenderClient::new(reqwest::Client::new(), "http://127.0.0.1:1");
        let result = client.sync_follow(Uuid::new_v4(), Uuid::new_v4(), Utc::now()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn sync_unfollow_never_panics_on_transport_error() {
        let client = RecommenderClient::new(reqwest::Client::new(), "http://127.0.0.1:1");
        client.sync_unfollow(Uuid::new_v4(), Uuid::new_v4()).await;
    }

    fn test_post() -> Post {
        use crate::domain::{DetectedAttributes, ProcessingStatus};
        Post {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            audio_url: String::new(),
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
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn test_user() -> User {
        User {
            id: Uuid::new_v4(),
            username: "dj".to_string(),
            display_name: "DJ".to_string(),
            genres: Vec::new(),
            daw_preference: None,
            follower_count: 0,
            is_private: false,
            is_admin: false,
            created_at: Utc::now(),
        }
    }
}
