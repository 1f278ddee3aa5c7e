//! Big segments: segments whose membership lives in an external store.
//!
//! Membership is looked up by a hash of the context key (see [`hash_context_key`]). The store
//! returns the segment references a context is explicitly included in or excluded from.
//! [`BigSegmentStoreWrapper`] sits between the evaluator and the store, caching memberships and
//! tracking whether the store data is up to date.
use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{store::lru::LruCache, Result, Str};

/// Health of big segment data, reported alongside evaluation results that used big segments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BigSegmentsStatus {
    /// Store queries succeeded and data is up to date.
    Healthy,
    /// Store data has not been updated recently.
    Stale,
    /// Store query failed.
    StoreError,
    /// Flag uses big segments, but no store is configured or the segment has no generation.
    NotConfigured,
}

impl BigSegmentsStatus {
    fn severity(self) -> u8 {
        match self {
            BigSegmentsStatus::Healthy => 0,
            BigSegmentsStatus::Stale => 1,
            BigSegmentsStatus::NotConfigured => 2,
            BigSegmentsStatus::StoreError => 3,
        }
    }

    /// Combine statuses of several lookups made during one evaluation, keeping the worst.
    pub fn worst(self, other: BigSegmentsStatus) -> BigSegmentsStatus {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }
}

/// Segment references that a context is explicitly included in or excluded from.
///
/// Segment references have the form `{segment_key}.g{generation}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BigSegmentMembership {
    #[serde(default)]
    pub included: HashSet<Str>,
    #[serde(default)]
    pub excluded: HashSet<Str>,
}

impl BigSegmentMembership {
    /// `Some(true)` if included, `Some(false)` if excluded, `None` if neither. Inclusion wins.
    pub fn check(&self, segment_ref: &str) -> Option<bool> {
        if self.included.contains(segment_ref) {
            Some(true)
        } else if self.excluded.contains(segment_ref) {
            Some(false)
        } else {
            None
        }
    }
}

/// Result of looking up a context in the big segment store.
#[derive(Debug, Clone, PartialEq)]
pub struct BigSegmentsQueryResult {
    /// `None` if the context has no memberships or the lookup failed.
    pub membership: Option<Arc<BigSegmentMembership>>,
    pub status: BigSegmentsStatus,
}

/// Reference for a segment generation, as used in [`BigSegmentMembership`].
pub fn segment_ref(segment_key: &str, generation: i64) -> String {
    format!("{segment_key}.g{generation}")
}

/// Hash a context key for big segment lookups: base64-encoded SHA-256.
pub fn hash_context_key(key: &str) -> String {
    STANDARD.encode(Sha256::digest(key.as_bytes()))
}

/// Store metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BigSegmentStoreMetadata {
    /// Last time the store was fully synchronized. `None` if never.
    pub last_up_to_date: Option<DateTime<Utc>>,
}

/// External store holding big segment memberships.
pub trait BigSegmentStore: Send + Sync {
    fn get_metadata(&self) -> Result<BigSegmentStoreMetadata>;

    /// Look up memberships by hashed context key. `None` if the context has no memberships.
    fn get_membership(&self, context_hash: &str) -> Result<Option<BigSegmentMembership>>;
}

/// Configuration for [`BigSegmentStoreWrapper`].
#[derive(Debug, Clone)]
pub struct BigSegmentsConfig {
    /// Maximum number of contexts whose membership is cached.
    ///
    /// Defaults to [`BigSegmentsConfig::DEFAULT_CONTEXT_CACHE_SIZE`].
    pub context_cache_size: usize,
    /// How long a cached membership is used before querying the store again.
    ///
    /// Defaults to [`BigSegmentsConfig::DEFAULT_CONTEXT_CACHE_TTL`].
    pub context_cache_ttl: Duration,
    /// Minimum interval between store metadata queries.
    ///
    /// Defaults to [`BigSegmentsConfig::DEFAULT_STATUS_POLL_INTERVAL`].
    pub status_poll_interval: Duration,
    /// Data older than this is reported as [`BigSegmentsStatus::Stale`].
    ///
    /// Defaults to [`BigSegmentsConfig::DEFAULT_STALE_AFTER`].
    pub stale_after: Duration,
}

impl BigSegmentsConfig {
    /// Default value for [`BigSegmentsConfig::context_cache_size`].
    pub const DEFAULT_CONTEXT_CACHE_SIZE: usize = 1000;
    /// Default value for [`BigSegmentsConfig::context_cache_ttl`].
    pub const DEFAULT_CONTEXT_CACHE_TTL: Duration = Duration::from_secs(5);
    /// Default value for [`BigSegmentsConfig::status_poll_interval`].
    pub const DEFAULT_STATUS_POLL_INTERVAL: Duration = Duration::from_secs(5);
    /// Default value for [`BigSegmentsConfig::stale_after`].
    pub const DEFAULT_STALE_AFTER: Duration = Duration::from_secs(120);

    pub fn new() -> BigSegmentsConfig {
        BigSegmentsConfig::default()
    }

    pub fn with_context_cache_size(mut self, size: usize) -> BigSegmentsConfig {
        self.context_cache_size = size;
        self
    }

    pub fn with_context_cache_ttl(mut self, ttl: Duration) -> BigSegmentsConfig {
        self.context_cache_ttl = ttl;
        self
    }

    pub fn with_status_poll_interval(mut self, interval: Duration) -> BigSegmentsConfig {
        self.status_poll_interval = interval;
        self
    }

    pub fn with_stale_after(mut self, stale_after: Duration) -> BigSegmentsConfig {
        self.stale_after = stale_after;
        self
    }
}

impl Default for BigSegmentsConfig {
    fn default() -> BigSegmentsConfig {
        BigSegmentsConfig {
            context_cache_size: BigSegmentsConfig::DEFAULT_CONTEXT_CACHE_SIZE,
            context_cache_ttl: BigSegmentsConfig::DEFAULT_CONTEXT_CACHE_TTL,
            status_poll_interval: BigSegmentsConfig::DEFAULT_STATUS_POLL_INTERVAL,
            stale_after: BigSegmentsConfig::DEFAULT_STALE_AFTER,
        }
    }
}

struct CachedMembership {
    membership: Option<Arc<BigSegmentMembership>>,
    fetched_at: Instant,
}

struct StatusCheck {
    status: BigSegmentsStatus,
    checked_at: Instant,
}

/// Caching front of a [`BigSegmentStore`].
pub struct BigSegmentStoreWrapper {
    store: Arc<dyn BigSegmentStore>,
    config: BigSegmentsConfig,
    memberships: Mutex<LruCache<String, CachedMembership>>,
    last_status: Mutex<Option<StatusCheck>>,
}

impl BigSegmentStoreWrapper {
    pub fn new(
        store: Arc<dyn BigSegmentStore>,
        config: BigSegmentsConfig,
    ) -> BigSegmentStoreWrapper {
        BigSegmentStoreWrapper {
            store,
            memberships: Mutex::new(LruCache::new(config.context_cache_size)),
            config,
            last_status: Mutex::new(None),
        }
    }

    /// Look up memberships of a hashed context key.
    ///
    /// Store failures are not returned as errors: the result carries
    /// [`BigSegmentsStatus::StoreError`] and no membership.
    pub fn get_membership(&self, context_hash: &str) -> BigSegmentsQueryResult {
        match self.cached_or_fetch(context_hash) {
            Ok(membership) => BigSegmentsQueryResult {
                membership,
                status: self.status(),
            },
            Err(err) => {
                log::warn!(target: "flag_engine", "big segment membership query failed: {err}");
                BigSegmentsQueryResult {
                    membership: None,
                    status: BigSegmentsStatus::StoreError,
                }
            }
        }
    }

    fn cached_or_fetch(&self, context_hash: &str) -> Result<Option<Arc<BigSegmentMembership>>> {
        {
            let mut memberships = self
                .memberships
                .lock()
                .expect("thread holding big segment cache lock should not panic");
            if let Some(cached) = memberships.get(context_hash) {
                if cached.fetched_at.elapsed() < self.config.context_cache_ttl {
                    return Ok(cached.membership.clone());
                }
            }
        }

        let membership = self.store.get_membership(context_hash)?.map(Arc::new);
        self.memberships
            .lock()
            .expect("thread holding big segment cache lock should not panic")
            .put(
                context_hash.to_owned(),
                CachedMembership {
                    membership: membership.clone(),
                    fetched_at: Instant::now(),
                },
            );
        Ok(membership)
    }

    /// Current store status. Metadata is queried at most once per
    /// [`BigSegmentsConfig::status_poll_interval`].
    pub fn status(&self) -> BigSegmentsStatus {
        let mut last_status = self
            .last_status
            .lock()
            .expect("thread holding big segment status lock should not panic");
        if let Some(check) = &*last_status {
            if check.checked_at.elapsed() < self.config.status_poll_interval {
                return check.status;
            }
        }

        let status = match self.store.get_metadata() {
            Ok(metadata) => self.status_from_metadata(metadata),
            Err(err) => {
                log::warn!(target: "flag_engine", "big segment metadata query failed: {err}");
                BigSegmentsStatus::StoreError
            }
        };
        if last_status.as_ref().map(|check| check.status) != Some(status) {
            log::debug!(target: "flag_engine", status:? = status; "big segment store status changed");
        }
        *last_status = Some(StatusCheck {
            status,
            checked_at: Instant::now(),
        });
        status
    }

    fn status_from_metadata(&self, metadata: BigSegmentStoreMetadata) -> BigSegmentsStatus {
        let Some(last_up_to_date) = metadata.last_up_to_date else {
            return BigSegmentsStatus::Stale;
        };
        let age = (Utc::now() - last_up_to_date).to_std().unwrap_or(Duration::ZERO);
        if age > self.config.stale_after {
            BigSegmentsStatus::Stale
        } else {
            BigSegmentsStatus::Healthy
        }
    }

    /// Drop all cached memberships.
    pub fn clear_cache(&self) {
        self.memberships
            .lock()
            .expect("thread holding big segment cache lock should not panic")
            .clear();
    }
}

impl std::fmt::Debug for BigSegmentStoreWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BigSegmentStoreWrapper")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    use chrono::Utc;

    use super::{
        hash_context_key, BigSegmentMembership, BigSegmentStore, BigSegmentStoreMetadata,
        BigSegmentStoreWrapper, BigSegmentsConfig, BigSegmentsStatus,
    };
    use crate::{Error, Result};

    #[derive(Default)]
    struct TestStore {
        memberships: HashMap<String, BigSegmentMembership>,
        metadata: Mutex<Option<BigSegmentStoreMetadata>>,
        membership_queries: AtomicUsize,
        metadata_queries: AtomicUsize,
    }

    impl BigSegmentStore for TestStore {
        fn get_metadata(&self) -> Result<BigSegmentStoreMetadata> {
            self.metadata_queries.fetch_add(1, Ordering::SeqCst);
            self.metadata
                .lock()
                .unwrap()
                .ok_or_else(|| Error::store(std::io::Error::other("metadata unavailable")))
        }

        fn get_membership(&self, context_hash: &str) -> Result<Option<BigSegmentMembership>> {
            self.membership_queries.fetch_add(1, Ordering::SeqCst);
            Ok(self.memberships.get(context_hash).cloned())
        }
    }

    #[test]
    fn context_key_hash() {
        // sha256("userkey") in base64
        assert_eq!(
            hash_context_key("userkey"),
            "72cBpXPyn4N6TqqlS8Tti37jEcoNhFzL9ZdG1jXkILE="
        );
    }

    #[test]
    fn membership_check() {
        let membership = BigSegmentMembership {
            included: ["a.g1".into()].into_iter().collect(),
            excluded: ["a.g1".into(), "b.g1".into()].into_iter().collect(),
        };
        assert_eq!(membership.check("a.g1"), Some(true));
        assert_eq!(membership.check("b.g1"), Some(false));
        assert_eq!(membership.check("c.g1"), None);
    }

    #[test]
    fn memberships_are_cached() {
        let _ = env_logger::builder().is_test(true).try_init();
        let hash = hash_context_key("u");
        let store = Arc::new(TestStore {
            memberships: [(
                hash.clone(),
                BigSegmentMembership {
                    included: ["s.g1".into()].into_iter().collect(),
                    ..Default::default()
                },
            )]
            .into_iter()
            .collect(),
            metadata: Mutex::new(Some(BigSegmentStoreMetadata {
                last_up_to_date: Some(Utc::now()),
            })),
            ..Default::default()
        });
        let wrapper = BigSegmentStoreWrapper::new(store.clone(), BigSegmentsConfig::default());

        let result = wrapper.get_membership(&hash);
        assert_eq!(result.status, BigSegmentsStatus::Healthy);
        assert_eq!(result.membership.unwrap().check("s.g1"), Some(true));
        wrapper.get_membership(&hash);
        assert_eq!(store.membership_queries.load(Ordering::SeqCst), 1);
        assert_eq!(store.metadata_queries.load(Ordering::SeqCst), 1);

        wrapper.clear_cache();
        wrapper.get_membership(&hash);
        assert_eq!(store.membership_queries.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stale_and_error_statuses() {
        let store = Arc::new(TestStore {
            metadata: Mutex::new(Some(BigSegmentStoreMetadata {
                last_up_to_date: Some(Utc::now() - chrono::Duration::minutes(10)),
            })),
            ..Default::default()
        });
        let wrapper = BigSegmentStoreWrapper::new(
            store.clone(),
            BigSegmentsConfig::default().with_status_poll_interval(Duration::ZERO),
        );
        assert_eq!(wrapper.status(), BigSegmentsStatus::Stale);

        *store.metadata.lock().unwrap() = None;
        assert_eq!(wrapper.status(), BigSegmentsStatus::StoreError);
        assert_eq!(
            wrapper.get_membership("x").status,
            BigSegmentsStatus::StoreError
        );
    }

    #[test]
    fn worst_status_wins() {
        use BigSegmentsStatus::*;
        assert_eq!(Healthy.worst(Stale), Stale);
        assert_eq!(StoreError.worst(NotConfigured), StoreError);
        assert_eq!(NotConfigured.worst(Stale), NotConfigured);
    }
}
