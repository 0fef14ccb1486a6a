//! Per-post likes kept as a sorted set of user ids scored by like time.
//!
//! # Invariants
//! - A user appears at most once in `liked:{post_id}`, so a post can never
//!   be liked twice by the same user.
//! - Unliking removes the member; the like count is the set size.

use crate::clock::Clock;
use crate::kv::keys::liked_key;
use crate::kv::{KvResult, KvStore};
use crate::model::UserId;
use crate::service::feed_service::PostId;
use log::debug;
use std::sync::Arc;

pub struct LikeService {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl LikeService {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Flips the like of `user_id` on `post_id`. Returns whether the post is
    /// liked afterwards.
    pub fn toggle_like(&self, post_id: PostId, user_id: UserId) -> KvResult<bool> {
        let key = liked_key(post_id);
        let member = user_id.to_string();
        // Removal is the atomic membership test: it succeeds only for a liker.
        let liked = if self.store.zrem(&key, &member)? {
            false
        } else {
            let liked_at = self.clock.now().timestamp_millis();
            self.store.zadd(&key, &member, liked_at as f64)?;
            true
        };
        debug!(
            "event=like_toggle module=like status=ok post_id={} user_id={} liked={}",
            post_id, user_id, liked
        );
        Ok(liked)
    }

    pub fn is_liked(&self, post_id: PostId, user_id: UserId) -> KvResult<bool> {
        Ok(self
            .store
            .zscore(&liked_key(post_id), &user_id.to_string())?
            .is_some())
    }
}
