/*
 * Copyright (C) 2024 The Fleetctl Authors
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 * http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */


//! Outstanding create/delete bookkeeping for reconcilers.
//!
//! A reconciler records how many creates or deletes it just issued for a key,
//! and watch handlers lower the counters as the results show up in the cache.
//! Until the counters drain (or the entry expires) the reconciler should not
//! trust its cache view for that key.

use super::cache::{Clock, RealClock, Store, StoreError, ThreadSafeStore};
use crate::fleetctl::config::ExpectationsConfig;
use crate::fleetctl::logger::{log_debug, log_error, log_info};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const COMPONENT: &str = "expectations";

/// Age after which an unfulfilled entry stops blocking its key.
pub const EXPECTATIONS_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Outstanding creates and deletes for one key. Counters may go negative when
/// more observations arrive than were expected.
#[derive(Debug)]
pub struct ControlleeExpectations {
    add: AtomicI64,
    del: AtomicI64,
    key: String,
    timestamp: Instant,
}

impl ControlleeExpectations {
    pub fn new(key: &str, add: i64, del: i64, timestamp: Instant) -> Self {
        Self {
            add: AtomicI64::new(add),
            del: AtomicI64::new(del),
            key: key.to_string(),
            timestamp,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Applies deltas to both counters.
    pub fn add(&self, add: i64, del: i64) {
        self.add.fetch_add(add, Ordering::SeqCst);
        self.del.fetch_add(del, Ordering::SeqCst);
    }

    pub fn fulfilled(&self) -> bool {
        self.add.load(Ordering::SeqCst) <= 0 && self.del.load(Ordering::SeqCst) <= 0
    }

    pub fn get_expectations(&self) -> (i64, i64) {
        (self.add.load(Ordering::SeqCst), self.del.load(Ordering::SeqCst))
    }

    pub fn is_expired(&self, clock: &dyn Clock, timeout: Duration) -> bool {
        clock.since(self.timestamp) > timeout
    }
}

/// Key function for stores holding [`ControlleeExpectations`].
pub fn expectations_key(expectations: &ControlleeExpectations) -> Result<String, StoreError> {
    Ok(expectations.key.clone())
}

/// Expectation contract shared by the plain and UID-tracking stores.
///
/// `set_expectations` and the `expect_*` shorthands replace the whole entry
/// and reset its timestamp. Raise, lower and the `*_observed` shorthands apply
/// deltas to an existing entry and leave the timestamp alone. Callers should
/// set expectations at most once per key per reconcile cycle.
pub trait Expectations: Send + Sync {
    fn get_expectations(&self, key: &str)
        -> Result<Option<Arc<ControlleeExpectations>>, StoreError>;

    /// True unless the key has an entry that is neither fulfilled nor expired.
    /// Store read errors count as satisfied.
    fn satisfied_expectations(&self, key: &str) -> bool;

    fn delete_expectations(&self, key: &str);

    fn set_expectations(&self, key: &str, add: i64, del: i64) -> Result<(), StoreError>;

    fn expect_creations(&self, key: &str, adds: i64) -> Result<(), StoreError> {
        self.set_expectations(key, adds, 0)
    }

    fn expect_deletions(&self, key: &str, dels: i64) -> Result<(), StoreError> {
        self.set_expectations(key, 0, dels)
    }

    /// No-op when the key has no entry.
    fn raise_expectations(&self, key: &str, add: i64, del: i64);

    /// No-op when the key has no entry.
    fn lower_expectations(&self, key: &str, add: i64, del: i64);

    fn creation_observed(&self, key: &str) {
        self.lower_expectations(key, 1, 0);
    }

    fn deletion_observed(&self, key: &str) {
        self.lower_expectations(key, 0, 1);
    }
}

/// Keyed expectation store with TTL-based expiry.
pub struct ControllerExpectations {
    store: Arc<dyn Store<ControlleeExpectations>>,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl Default for ControllerExpectations {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerExpectations {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(RealClock), ExpectationsConfig::default())
    }

    pub fn with_clock(clock: Arc<dyn Clock>, config: ExpectationsConfig) -> Self {
        let store: ThreadSafeStore<ControlleeExpectations> =
            ThreadSafeStore::new(Arc::new(expectations_key));
        Self::with_store(Arc::new(store), clock, config)
    }

    pub fn with_store(
        store: Arc<dyn Store<ControlleeExpectations>>,
        clock: Arc<dyn Clock>,
        config: ExpectationsConfig,
    ) -> Self {
        Self {
            store,
            clock,
            timeout: config.timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn existing(&self, key: &str) -> Option<Arc<ControlleeExpectations>> {
        match self.store.get_by_key(key) {
            Ok(found) => found,
            Err(err) => {
                let err = err.to_string();
                log_error(
                    COMPONENT,
                    "Unable to read expectations",
                    &[("key", key), ("error", err.as_str())],
                );
                None
            }
        }
    }
}

impl Expectations for ControllerExpectations {
    fn get_expectations(
        &self,
        key: &str,
    ) -> Result<Option<Arc<ControlleeExpectations>>, StoreError> {
        self.store.get_by_key(key)
    }

    fn satisfied_expectations(&self, key: &str) -> bool {
        match self.store.get_by_key(key) {
            Ok(Some(exp)) => {
                let (add, del) = exp.get_expectations();
                let (add, del) = (add.to_string(), del.to_string());
                let fields = [("key", key), ("add", add.as_str()), ("del", del.as_str())];
                if exp.fulfilled() {
                    log_debug(COMPONENT, "Controller expectations fulfilled", &fields);
                    true
                } else if exp.is_expired(self.clock.as_ref(), self.timeout) {
                    log_info(COMPONENT, "Controller expectations expired", &fields);
                    true
                } else {
                    log_debug(COMPONENT, "Controller still waiting on expectations", &fields);
                    false
                }
            }
            Ok(None) => {
                log_debug(
                    COMPONENT,
                    "Controller either never recorded expectations, or the ttl expired",
                    &[("key", key)],
                );
                true
            }
            Err(err) => {
                let err = err.to_string();
                log_error(
                    COMPONENT,
                    "Error encountered while checking expectations, forcing sync",
                    &[("key", key), ("error", err.as_str())],
                );
                true
            }
        }
    }

    fn delete_expectations(&self, key: &str) {
        let Some(exp) = self.existing(key) else {
            return;
        };
        if let Err(err) = self.store.delete(&exp) {
            let err = err.to_string();
            log_error(
                COMPONENT,
                "Error deleting expectations",
                &[("key", key), ("error", err.as_str())],
            );
        }
    }

    fn set_expectations(&self, key: &str, add: i64, del: i64) -> Result<(), StoreError> {
        let exp = ControlleeExpectations::new(key, add, del, self.clock.now());
        let (adds, dels) = (add.to_string(), del.to_string());
        log_debug(
            COMPONENT,
            "Setting expectations",
            &[("key", key), ("add", adds.as_str()), ("del", dels.as_str())],
        );
        self.store.add(Arc::new(exp))
    }

    fn raise_expectations(&self, key: &str, add: i64, del: i64) {
        if let Some(exp) = self.existing(key) {
            exp.add(add, del);
            let (adds, dels) = exp.get_expectations();
            let (adds, dels) = (adds.to_string(), dels.to_string());
            log_debug(
                COMPONENT,
                "Raised expectations",
                &[("key", key), ("add", adds.as_str()), ("del", dels.as_str())],
            );
        }
    }

    fn lower_expectations(&self, key: &str, add: i64, del: i64) {
        if let Some(exp) = self.existing(key) {
            exp.add(-add, -del);
            let (adds, dels) = exp.get_expectations();
            let (adds, dels) = (adds.to_string(), dels.to_string());
            log_debug(
                COMPONENT,
                "Lowered expectations",
                &[("key", key), ("add", adds.as_str()), ("del", dels.as_str())],
            );
        }
    }
}
