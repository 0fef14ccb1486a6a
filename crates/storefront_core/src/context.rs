//! Explicit per-call execution context.
//!
//! Callers build one `RequestContext` per request (after their own session
//! lookup) and pass it into every core operation that acts on behalf of a
//! user. The core keeps no ambient "current user" state.

use crate::model::UserId;
use once_cell::sync::Lazy;
use uuid::Uuid;

static PROCESS_INSTANCE_ID: Lazy<String> = Lazy::new(|| Uuid::new_v4().to_string());

/// Returns the id generated once for this process instance.
pub fn process_instance_id() -> &'static str {
    PROCESS_INSTANCE_ID.as_str()
}

/// Token identifying one lock holder: process instance plus execution unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockOwner(String);

impl LockOwner {
    /// Owner token for the calling thread of this process.
    pub fn current() -> Self {
        Self::for_task(&format!("{:?}", std::thread::current().id()))
    }

    /// Owner token for an arbitrary task label inside this process.
    pub fn for_task(task: &str) -> Self {
        Self(format!("{}-{task}", process_instance_id()))
    }

    /// Owner token from an externally issued value.
    pub fn from_token(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

/// Acting user and lock identity for one core call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub user_id: UserId,
    pub owner: LockOwner,
}

impl RequestContext {
    /// Context for `user_id` running on the calling thread.
    pub fn for_user(user_id: UserId) -> Self {
        Self {
            user_id,
            owner: LockOwner::current(),
        }
    }
}
