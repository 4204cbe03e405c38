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


use super::cache::StoreError;
use super::expectations::{ControlleeExpectations, Expectations};
use crate::fleetctl::logger::log_warn;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

const COMPONENT: &str = "uid-expectations";

/// Expectations that count each deleted identity at most once.
///
/// A machine can be seen going away twice: once when its deletion timestamp
/// is set and again when it is removed. The tracker only lowers the delete
/// counter for identities still pending under the key. One lock guards the
/// identity sets of every key so the membership check and the decrement are
/// atomic together.
pub struct UidTrackingExpectations<E: Expectations> {
    inner: E,
    uids: Mutex<HashMap<String, BTreeSet<String>>>,
}

impl<E: Expectations> UidTrackingExpectations<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            uids: Mutex::new(HashMap::new()),
        }
    }

    pub fn inner(&self) -> &E {
        &self.inner
    }

    fn lock_uids(&self) -> MutexGuard<'_, HashMap<String, BTreeSet<String>>> {
        self.uids
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Snapshot of the identities still expected to be deleted under `key`.
    pub fn get_uids(&self, key: &str) -> Option<BTreeSet<String>> {
        self.lock_uids().get(key).cloned()
    }

    /// Records the identities about to be deleted, replacing any previous set,
    /// and expects one deletion per distinct identity.
    pub fn expect_deletions<S: AsRef<str>>(
        &self,
        key: &str,
        deleted: &[S],
    ) -> Result<(), StoreError> {
        let mut uids = self.lock_uids();
        if let Some(existing) = uids.get(key).filter(|set| !set.is_empty()) {
            let pending = existing.iter().cloned().collect::<Vec<_>>().join(",");
            log_warn(
                COMPONENT,
                "Clobbering existing delete keys",
                &[("key", key), ("uids", pending.as_str())],
            );
        }

        let expected: BTreeSet<String> = deleted
            .iter()
            .map(|uid| uid.as_ref().to_string())
            .collect();
        let count = expected.len() as i64;
        uids.insert(key.to_string(), expected);
        self.inner.expect_deletions(key, count)
    }

    /// Lowers the delete counter if `uid` is still pending under `key`.
    pub fn deletion_observed(&self, key: &str, uid: &str) {
        let mut uids = self.lock_uids();
        if let Some(pending) = uids.get_mut(key) {
            if pending.remove(uid) {
                self.inner.deletion_observed(key);
            }
        }
    }

    pub fn delete_expectations(&self, key: &str) {
        let mut uids = self.lock_uids();
        self.inner.delete_expectations(key);
        uids.remove(key);
    }

    pub fn get_expectations(
        &self,
        key: &str,
    ) -> Result<Option<Arc<ControlleeExpectations>>, StoreError> {
        self.inner.get_expectations(key)
    }

    pub fn satisfied_expectations(&self, key: &str) -> bool {
        self.inner.satisfied_expectations(key)
    }

    pub fn set_expectations(&self, key: &str, add: i64, del: i64) -> Result<(), StoreError> {
        self.inner.set_expectations(key, add, del)
    }

    pub fn expect_creations(&self, key: &str, adds: i64) -> Result<(), StoreError> {
        self.inner.expect_creations(key, adds)
    }

    pub fn raise_expectations(&self, key: &str, add: i64, del: i64) {
        self.inner.raise_expectations(key, add, del);
    }

    pub fn lower_expectations(&self, key: &str, add: i64, del: i64) {
        self.inner.lower_expectations(key, add, del);
    }

    pub fn creation_observed(&self, key: &str) {
        self.inner.creation_observed(key);
    }
}
