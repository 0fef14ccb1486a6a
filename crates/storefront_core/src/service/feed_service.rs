//! Follow feed: push-on-publish inboxes kept as sorted sets.
//!
//! # Invariants
//! - Inbox scores are publish times in epoch milliseconds.
//! - Scrolling resumes from `(min_time, offset)`; `offset` counts entries
//!   already returned at score `min_time`, so equal scores are neither
//!   repeated nor skipped across pages.

use crate::clock::Clock;
use crate::kv::keys::feed_key;
use crate::kv::{KvError, KvResult, KvStore};
use crate::model::UserId;
use log::debug;
use std::sync::Arc;

/// Identifier of a published post.
pub type PostId = i64;

/// One page of an inbox, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPage {
    pub post_ids: Vec<PostId>,
    /// Score of the last entry; pass back as `max_time`.
    pub min_time: i64,
    /// Pass back as `offset`.
    pub offset: usize,
}

pub struct FeedService {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
}

impl FeedService {
    pub fn new(store: Arc<dyn KvStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Pushes `post_id` into every follower inbox. Returns the publish time.
    pub fn publish(&self, post_id: PostId, followers: &[UserId]) -> KvResult<i64> {
        let published_at = self.clock.now().timestamp_millis();
        let member = post_id.to_string();
        for follower in followers {
            self.store
                .zadd(&feed_key(*follower), &member, published_at as f64)?;
        }
        debug!(
            "event=feed_publish module=feed status=ok post_id={} fanout={}",
            post_id,
            followers.len()
        );
        Ok(published_at)
    }

    /// Removes `post_id` from one inbox.
    pub fn retract(&self, user_id: UserId, post_id: PostId) -> KvResult<bool> {
        self.store.zrem(&feed_key(user_id), &post_id.to_string())
    }

    /// Reads up to `page_size` entries with score `<= max_time`, skipping
    /// `offset` entries at the top.
    pub fn scroll(
        &self,
        user_id: UserId,
        max_time: i64,
        offset: usize,
        page_size: usize,
    ) -> KvResult<FeedPage> {
        let key = feed_key(user_id);
        let entries =
            self.store
                .zrev_range_by_score(&key, max_time as f64, 0.0, offset, page_size)?;
        if entries.is_empty() {
            return Ok(FeedPage {
                post_ids: Vec::new(),
                min_time: max_time,
                offset,
            });
        }

        let mut post_ids = Vec::with_capacity(entries.len());
        let mut min_time = max_time;
        let mut same_score = 0;
        for (member, score) in entries {
            let post_id = member
                .parse::<PostId>()
                .map_err(|_| KvError::WrongType(format!("{key} member `{member}`")))?;
            post_ids.push(post_id);

            let time = score as i64;
            if time == min_time {
                same_score += 1;
            } else {
                min_time = time;
                same_score = 1;
            }
        }

        // The whole page sat on the previous cursor score: keep skipping past it.
        let next_offset = if min_time == max_time {
            offset + same_score
        } else {
            same_score
        };
        Ok(FeedPage {
            post_ids,
            min_time,
            offset: next_offset,
        })
    }
}
