//! Read-through entity cache with penetration guard.
//!
//! # Responsibility
//! - Serve entity reads from the shared store and fall back to the
//!   relational store on a miss (cache-aside).
//! - Remember confirmed absences so repeated lookups of missing ids stop
//!   reaching the relational store.
//! - Invalidate on write.
//!
//! # Invariants
//! - An absent key means "nothing known"; a key holding the empty string
//!   means "confirmed absent". Both carry a TTL.
//! - Writers update the relational store first and then delete the key;
//!   new values are never written into the cache by the write path.
//! - Concurrent populates are last-write-wins; staleness is bounded by TTL.

use crate::config::{DEFAULT_CACHE_TTL_SECS, DEFAULT_NULL_TTL_SECS};
use crate::kv::keys::cache_key;
use crate::kv::{KvError, KvStore};
use crate::repo::RepoError;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Value stored for "confirmed absent in the backing store".
pub const NULL_SENTINEL: &str = "";

pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug)]
pub enum CacheError {
    /// Entity is absent in the backing store (possibly known from the cache).
    NotFound { entity: &'static str, id: i64 },
    Kv(KvError),
    Codec(serde_json::Error),
    Repo(RepoError),
}

impl Display for CacheError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Kv(err) => write!(f, "{err}"),
            Self::Codec(err) => write!(f, "cache payload codec error: {err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for CacheError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::NotFound { .. } => None,
            Self::Kv(err) => Some(err),
            Self::Codec(err) => Some(err),
            Self::Repo(err) => Some(err),
        }
    }
}

impl From<KvError> for CacheError {
    fn from(value: KvError) -> Self {
        Self::Kv(value)
    }
}

impl From<RepoError> for CacheError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

/// Outcome of a cache probe, before any backing-store access.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Hit(T),
    KnownAbsent,
    Miss,
}

/// Cache-aside front for one entity type.
pub struct EntityCache<T> {
    store: Arc<dyn KvStore>,
    entity: &'static str,
    ttl: Duration,
    null_ttl: Duration,
    _entity: PhantomData<fn() -> T>,
}

impl<T> Clone for EntityCache<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            entity: self.entity,
            ttl: self.ttl,
            null_ttl: self.null_ttl,
            _entity: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> EntityCache<T> {
    /// Cache for `entity` with the default TTLs.
    pub fn new(store: Arc<dyn KvStore>, entity: &'static str) -> Self {
        Self::with_ttls(
            store,
            entity,
            Duration::from_secs(DEFAULT_CACHE_TTL_SECS),
            Duration::from_secs(DEFAULT_NULL_TTL_SECS),
        )
    }

    pub fn with_ttls(
        store: Arc<dyn KvStore>,
        entity: &'static str,
        ttl: Duration,
        null_ttl: Duration,
    ) -> Self {
        Self {
            store,
            entity,
            ttl,
            null_ttl,
            _entity: PhantomData,
        }
    }

    pub fn entity(&self) -> &'static str {
        self.entity
    }

    /// Probes the cache only.
    ///
    /// A payload that no longer decodes is deleted and reported as an error.
    pub fn lookup(&self, id: i64) -> CacheResult<Lookup<T>> {
        let key = cache_key(self.entity, id)?;
        match self.store.get(&key)? {
            None => Ok(Lookup::Miss),
            Some(payload) if payload == NULL_SENTINEL => Ok(Lookup::KnownAbsent),
            Some(payload) => match serde_json::from_str(&payload) {
                Ok(entity) => Ok(Lookup::Hit(entity)),
                Err(err) => {
                    warn!(
                        "event=cache_decode module=cache status=error entity={} id={} error={}",
                        self.entity, id, err
                    );
                    self.store.delete(&key)?;
                    Err(CacheError::Codec(err))
                }
            },
        }
    }

    /// Returns the entity, loading it through `load` on a cache miss.
    ///
    /// `load` runs only when the key is absent; a confirmed-absent sentinel
    /// short-circuits to `NotFound` without touching the backing store.
    pub fn get_or_load<F>(&self, id: i64, load: F) -> CacheResult<T>
    where
        F: FnOnce(i64) -> Result<Option<T>, RepoError>,
    {
        match self.lookup(id)? {
            Lookup::Hit(entity) => return Ok(entity),
            Lookup::KnownAbsent => {
                debug!(
                    "event=cache_get module=cache status=known_absent entity={} id={}",
                    self.entity, id
                );
                return Err(self.not_found(id));
            }
            Lookup::Miss => {}
        }

        let key = cache_key(self.entity, id)?;
        match load(id)? {
            Some(entity) => {
                let payload = serde_json::to_string(&entity).map_err(CacheError::Codec)?;
                self.store.set(&key, &payload, Some(self.ttl))?;
                debug!(
                    "event=cache_get module=cache status=loaded entity={} id={}",
                    self.entity, id
                );
                Ok(entity)
            }
            None => {
                self.store.set(&key, NULL_SENTINEL, Some(self.null_ttl))?;
                debug!(
                    "event=cache_get module=cache status=absent_cached entity={} id={} ttl_ms={}",
                    self.entity,
                    id,
                    self.null_ttl.as_millis()
                );
                Err(self.not_found(id))
            }
        }
    }

    /// Writes through `write` and then drops the cached copy.
    ///
    /// The key is only deleted after `write` succeeds.
    pub fn update<R, F>(&self, id: i64, write: F) -> CacheResult<R>
    where
        F: FnOnce() -> Result<R, RepoError>,
    {
        let output = write()?;
        self.invalidate(id)?;
        Ok(output)
    }

    /// Deletes the cached entry or sentinel for `id`.
    pub fn invalidate(&self, id: i64) -> CacheResult<()> {
        let key = cache_key(self.entity, id)?;
        self.store.delete(&key)?;
        Ok(())
    }

    fn not_found(&self, id: i64) -> CacheError {
        CacheError::NotFound {
            entity: self.entity,
            id,
        }
    }
}
