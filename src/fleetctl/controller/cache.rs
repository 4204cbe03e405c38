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


use crate::fleetctl::config::CacheSyncConfig;
use crate::fleetctl::logger::{log_error, log_info};
use std::collections::HashMap;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const COMPONENT: &str = "cache-sync";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key function could not derive a key for the object.
    Key(String),
    /// A writer panicked while holding the store lock.
    Poisoned(String),
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Key(msg) => write!(f, "unable to compute key: {}", msg),
            StoreError::Poisoned(msg) => write!(f, "store lock poisoned: {}", msg),
        }
    }
}

impl Error for StoreError {}

/// Derives the store key of an object.
pub type KeyFunc<T> = Arc<dyn Fn(&T) -> Result<String, StoreError> + Send + Sync>;

/// Concurrency-safe keyed store. Entries are shared as `Arc`s so callers can
/// mutate interior atomics without re-inserting.
pub trait Store<T>: Send + Sync {
    fn add(&self, object: Arc<T>) -> Result<(), StoreError>;
    fn update(&self, object: Arc<T>) -> Result<(), StoreError>;
    fn delete(&self, object: &T) -> Result<(), StoreError>;
    fn get_by_key(&self, key: &str) -> Result<Option<Arc<T>>, StoreError>;
    fn list_keys(&self) -> Result<Vec<String>, StoreError>;
}

pub struct ThreadSafeStore<T> {
    items: RwLock<HashMap<String, Arc<T>>>,
    key_func: KeyFunc<T>,
}

impl<T> ThreadSafeStore<T> {
    pub fn new(key_func: KeyFunc<T>) -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
            key_func,
        }
    }

    fn put(&self, object: Arc<T>) -> Result<(), StoreError> {
        let key = (self.key_func)(&object)?;
        self.items
            .write()
            .map_err(|err| StoreError::Poisoned(err.to_string()))?
            .insert(key, object);
        Ok(())
    }
}

impl<T: Send + Sync> Store<T> for ThreadSafeStore<T> {
    fn add(&self, object: Arc<T>) -> Result<(), StoreError> {
        self.put(object)
    }

    fn update(&self, object: Arc<T>) -> Result<(), StoreError> {
        self.put(object)
    }

    fn delete(&self, object: &T) -> Result<(), StoreError> {
        let key = (self.key_func)(object)?;
        self.items
            .write()
            .map_err(|err| StoreError::Poisoned(err.to_string()))?
            .remove(&key);
        Ok(())
    }

    fn get_by_key(&self, key: &str) -> Result<Option<Arc<T>>, StoreError> {
        let items = self
            .items
            .read()
            .map_err(|err| StoreError::Poisoned(err.to_string()))?;
        Ok(items.get(key).cloned())
    }

    fn list_keys(&self) -> Result<Vec<String>, StoreError> {
        let items = self
            .items
            .read()
            .map_err(|err| StoreError::Poisoned(err.to_string()))?;
        let mut keys: Vec<String> = items.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests.
#[derive(Debug)]
pub struct FakeClock {
    now: Mutex<Instant>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new(Instant::now())
    }
}

impl FakeClock {
    pub fn new(start: Instant) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn step(&self, by: Duration) {
        let mut now = self
            .now
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *now += by;
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Instant {
        *self
            .now
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Readiness probe of one informer cache.
pub type SyncCheck<'a> = &'a (dyn Fn() -> bool + Sync);

/// Polls `checks` until all report ready or `stop` is cancelled. Returns
/// false when stopped first.
pub async fn wait_for_cache_sync(
    controller: &str,
    stop: &CancellationToken,
    checks: &[SyncCheck<'_>],
    config: CacheSyncConfig,
) -> bool {
    log_info(
        COMPONENT,
        "Waiting for caches to sync",
        &[("controller", controller)],
    );

    loop {
        if checks.iter().all(|check| check()) {
            log_info(COMPONENT, "Caches are synced", &[("controller", controller)]);
            return true;
        }
        tokio::select! {
            _ = stop.cancelled() => {
                log_error(
                    COMPONENT,
                    "Unable to sync caches",
                    &[("controller", controller)],
                );
                return false;
            }
            _ = tokio::time::sleep(config.poll_period) => {}
        }
    }
}
