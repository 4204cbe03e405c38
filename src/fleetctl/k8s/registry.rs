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


use super::api::{ApiError, ApiFuture, ReadConsistency, ResourceApi, WatchEvent, WatchEventType};
use super::meta::ApiObject;
use super::names::{generate_name, random_uid};
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::{broadcast, RwLock};

const WATCH_BUFFER_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiVerb {
    Get,
    Create,
    Update,
    Delete,
    Patch,
}

impl ApiVerb {
    pub fn is_write(self) -> bool {
        !matches!(self, ApiVerb::Get)
    }
}

/// A request received by [`InMemoryApi`], recorded in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiAction {
    pub verb: ApiVerb,
    pub namespace: String,
    pub name: String,
    pub consistency: Option<ReadConsistency>,
}

/// Failure returned for the next matching request instead of executing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InjectedFailure {
    NotFound,
    Conflict,
    Invalid,
    Transport(String),
}

impl InjectedFailure {
    fn to_error(&self, verb: ApiVerb, key: &str) -> ApiError {
        match self {
            InjectedFailure::NotFound => ApiError::NotFound(format!("object '{}' not found", key)),
            InjectedFailure::Conflict => ApiError::Conflict(format!(
                "operation {:?} on '{}' conflicted with a concurrent write",
                verb, key
            )),
            InjectedFailure::Invalid => {
                ApiError::Invalid(format!("object '{}' rejected by validation", key))
            }
            InjectedFailure::Transport(message) => ApiError::transport(message.clone()),
        }
    }
}

fn object_key(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Applies an RFC 7386 JSON merge patch to `target`.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(existing) = target {
        for (key, value) in entries {
            if value.is_null() {
                existing.remove(key);
            } else {
                merge_patch(existing.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Deterministic in-process API server for one resource kind.
///
/// Mirrors the behaviours controllers depend on: server-side name generation,
/// resource versions with conflict detection, graceful deletion through
/// finalizers and watch fan-out. Every request is recorded, and failures can
/// be queued per verb.
pub struct InMemoryApi<T: ApiObject> {
    objects: RwLock<HashMap<String, T>>,
    watchers: broadcast::Sender<WatchEvent<T>>,
    resource_counter: AtomicU64,
    actions: Mutex<Vec<ApiAction>>,
    failures: Mutex<HashMap<ApiVerb, VecDeque<InjectedFailure>>>,
}

impl<T: ApiObject> Default for InMemoryApi<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ApiObject> InMemoryApi<T> {
    pub fn new() -> Self {
        Self {
            objects: RwLock::new(HashMap::new()),
            watchers: broadcast::channel(WATCH_BUFFER_SIZE).0,
            resource_counter: AtomicU64::new(1),
            actions: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn current_resource_version(&self) -> String {
        let current = self.resource_counter.load(Ordering::SeqCst);
        current.saturating_sub(1).to_string()
    }

    pub fn watch(&self) -> broadcast::Receiver<WatchEvent<T>> {
        self.watchers.subscribe()
    }

    /// Queues `failure` for the next `times` requests with `verb`.
    pub fn fail_next(&self, verb: ApiVerb, times: usize, failure: InjectedFailure) {
        let mut failures = lock(&self.failures);
        let queue = failures.entry(verb).or_default();
        for _ in 0..times {
            queue.push_back(failure.clone());
        }
    }

    pub fn actions(&self) -> Vec<ApiAction> {
        lock(&self.actions).clone()
    }

    pub fn count(&self, verb: ApiVerb) -> usize {
        lock(&self.actions)
            .iter()
            .filter(|action| action.verb == verb)
            .count()
    }

    pub fn write_count(&self) -> usize {
        lock(&self.actions)
            .iter()
            .filter(|action| action.verb.is_write())
            .count()
    }

    pub fn clear_actions(&self) {
        lock(&self.actions).clear();
    }

    /// Stores `object` directly, bypassing the action log and failure queue.
    pub async fn insert(&self, namespace: &str, object: T) -> Result<T, ApiError> {
        let mut objects = self.objects.write().await;
        self.admit(&mut objects, namespace, object)
    }

    pub async fn list(&self, namespace: Option<&str>) -> Vec<T> {
        let objects = self.objects.read().await;
        let mut entries: Vec<(&String, &T)> = objects
            .iter()
            .filter(|(_, object)| {
                namespace.map_or(true, |ns| object.meta().namespace_or_default() == ns)
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries.into_iter().map(|(_, object)| object.clone()).collect()
    }

    fn record(
        &self,
        verb: ApiVerb,
        namespace: &str,
        name: &str,
        consistency: Option<ReadConsistency>,
    ) -> Result<(), ApiError> {
        lock(&self.actions).push(ApiAction {
            verb,
            namespace: namespace.to_string(),
            name: name.to_string(),
            consistency,
        });
        let injected = lock(&self.failures)
            .get_mut(&verb)
            .and_then(|queue| queue.pop_front());
        match injected {
            Some(failure) => Err(failure.to_error(verb, &object_key(namespace, name))),
            None => Ok(()),
        }
    }

    fn next_resource_version(&self) -> String {
        self.resource_counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string()
    }

    fn broadcast(&self, event_type: WatchEventType, object: &T) {
        let _ = self.watchers.send(WatchEvent {
            event_type,
            object: object.clone(),
        });
    }

    fn admit(
        &self,
        objects: &mut HashMap<String, T>,
        namespace: &str,
        mut object: T,
    ) -> Result<T, ApiError> {
        let meta = object.meta_mut();
        if meta.resource_version.is_some() {
            return Err(ApiError::Invalid(
                "resourceVersion must not be set on create".to_string(),
            ));
        }
        if !namespace.is_empty() {
            meta.namespace = Some(namespace.to_string());
        }

        let name = match meta.name.clone().filter(|name| !name.is_empty()) {
            Some(name) => name,
            None => {
                let prefix = meta
                    .generate_name
                    .clone()
                    .filter(|prefix| !prefix.is_empty())
                    .ok_or_else(|| {
                        ApiError::Invalid(
                            "metadata.name or metadata.generateName is required".to_string(),
                        )
                    })?;
                let mut candidate = generate_name(&prefix);
                while objects.contains_key(&object_key(namespace, &candidate)) {
                    candidate = generate_name(&prefix);
                }
                candidate
            }
        };

        let key = object_key(namespace, &name);
        if objects.contains_key(&key) {
            return Err(ApiError::AlreadyExists(format!(
                "object '{}' already exists",
                key
            )));
        }

        meta.name = Some(name);
        meta.uid.get_or_insert_with(random_uid);
        meta.creation_timestamp.get_or_insert_with(Utc::now);
        meta.deletion_timestamp = None;
        meta.resource_version = Some(self.next_resource_version());

        objects.insert(key, object.clone());
        self.broadcast(WatchEventType::Added, &object);
        Ok(object)
    }

    /// Stores a modified object, completing a pending deletion once the last
    /// finalizer is gone.
    fn commit(&self, objects: &mut HashMap<String, T>, key: String, mut object: T) -> T {
        let meta = object.meta_mut();
        meta.resource_version = Some(self.next_resource_version());
        if meta.deletion_timestamp.is_some() && meta.finalizers.is_empty() {
            objects.remove(&key);
            self.broadcast(WatchEventType::Deleted, &object);
        } else {
            objects.insert(key, object.clone());
            self.broadcast(WatchEventType::Modified, &object);
        }
        object
    }

    async fn get_object(
        &self,
        namespace: &str,
        name: &str,
        consistency: ReadConsistency,
    ) -> Result<T, ApiError> {
        self.record(ApiVerb::Get, namespace, name, Some(consistency))?;
        let key = object_key(namespace, name);
        self.objects
            .read()
            .await
            .get(&key)
            .cloned()
            .ok_or_else(|| ApiError::NotFound(format!("object '{}' not found", key)))
    }

    async fn create_object(&self, namespace: &str, object: T) -> Result<T, ApiError> {
        let name = object.meta().name_or_default().to_string();
        self.record(ApiVerb::Create, namespace, &name, None)?;
        let mut objects = self.objects.write().await;
        self.admit(&mut objects, namespace, object)
    }

    async fn update_object(&self, namespace: &str, mut object: T) -> Result<T, ApiError> {
        let name = object.meta().name_or_default().to_string();
        self.record(ApiVerb::Update, namespace, &name, None)?;
        let key = object_key(namespace, &name);

        let mut objects = self.objects.write().await;
        let Some(existing) = objects.get(&key) else {
            return Err(ApiError::NotFound(format!("object '{}' not found", key)));
        };
        let current = existing.meta().resource_version.clone();
        if let Some(requested) = object.meta().resource_version.as_deref() {
            if current.as_deref() != Some(requested) {
                return Err(ApiError::Conflict(format!(
                    "object '{}' has been modified; resourceVersion {} is stale",
                    key, requested
                )));
            }
        }

        let preserved = existing.meta().clone();
        let meta = object.meta_mut();
        meta.namespace = preserved.namespace;
        meta.uid = preserved.uid;
        meta.creation_timestamp = preserved.creation_timestamp;
        meta.deletion_timestamp = preserved.deletion_timestamp;
        Ok(self.commit(&mut objects, key, object))
    }

    async fn delete_object(&self, namespace: &str, name: &str) -> Result<(), ApiError> {
        self.record(ApiVerb::Delete, namespace, name, None)?;
        let key = object_key(namespace, name);

        let mut objects = self.objects.write().await;
        let Some(existing) = objects.get(&key) else {
            return Err(ApiError::NotFound(format!("object '{}' not found", key)));
        };
        if existing.meta().finalizers.is_empty() {
            if let Some(removed) = objects.remove(&key) {
                self.broadcast(WatchEventType::Deleted, &removed);
            }
            return Ok(());
        }
        if existing.meta().deletion_timestamp.is_some() {
            return Ok(());
        }

        let mut marked = existing.clone();
        marked.meta_mut().deletion_timestamp = Some(Utc::now());
        self.commit(&mut objects, key, marked);
        Ok(())
    }

    async fn patch_object(&self, namespace: &str, name: &str, patch: &[u8]) -> Result<T, ApiError> {
        self.record(ApiVerb::Patch, namespace, name, None)?;
        let key = object_key(namespace, name);
        let patch: Value = serde_json::from_slice(patch)
            .map_err(|err| ApiError::Invalid(format!("invalid merge patch: {}", err)))?;

        let mut objects = self.objects.write().await;
        let Some(existing) = objects.get(&key) else {
            return Err(ApiError::NotFound(format!("object '{}' not found", key)));
        };
        let preserved = existing.meta().clone();
        let mut document = serde_json::to_value(existing)
            .map_err(|err| ApiError::Invalid(format!("unable to encode '{}': {}", key, err)))?;
        merge_patch(&mut document, &patch);
        let mut patched: T = serde_json::from_value(document)
            .map_err(|err| ApiError::Invalid(format!("patched '{}' is invalid: {}", key, err)))?;

        let meta = patched.meta_mut();
        meta.name = preserved.name;
        meta.namespace = preserved.namespace;
        meta.uid = preserved.uid;
        meta.creation_timestamp = preserved.creation_timestamp;
        meta.deletion_timestamp = preserved.deletion_timestamp;
        Ok(self.commit(&mut objects, key, patched))
    }
}

impl<T: ApiObject> ResourceApi<T> for InMemoryApi<T> {
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        consistency: ReadConsistency,
    ) -> ApiFuture<'a, T> {
        Box::pin(self.get_object(namespace, name, consistency))
    }

    fn create<'a>(&'a self, namespace: &'a str, object: T) -> ApiFuture<'a, T> {
        Box::pin(self.create_object(namespace, object))
    }

    fn update<'a>(&'a self, namespace: &'a str, object: T) -> ApiFuture<'a, T> {
        Box::pin(self.update_object(namespace, object))
    }

    fn delete<'a>(&'a self, namespace: &'a str, name: &'a str) -> ApiFuture<'a, ()> {
        Box::pin(self.delete_object(namespace, name))
    }

    fn patch<'a>(&'a self, namespace: &'a str, name: &'a str, patch: &'a [u8]) -> ApiFuture<'a, T> {
        Box::pin(self.patch_object(namespace, name, patch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleetctl::k8s::machine::Machine;
    use crate::fleetctl::k8s::names::{is_dns1123_subdomain, DNS1123_SUBDOMAIN_MAX_LENGTH};
    use crate::fleetctl::k8s::node::Node;

    fn machine(name: &str) -> Machine {
        let mut machine = Machine::default();
        machine.metadata.name = Some(name.to_string());
        machine
    }

    #[tokio::test]
    async fn create_resolves_generate_name() {
        let api = InMemoryApi::<Machine>::new();
        let mut template = Machine::default();
        template.metadata.generate_name = Some("pool-".to_string());

        let created = api.create("default", template).await.unwrap();
        let name = created.metadata.name.clone().unwrap();
        assert!(name.starts_with("pool-") && name.len() > "pool-".len());
        assert!(created.metadata.uid.is_some());
        assert!(created.metadata.creation_timestamp.is_some());
        assert_eq!(created.metadata.namespace.as_deref(), Some("default"));

        let err = api.create("default", Machine::default()).await.unwrap_err();
        assert!(matches!(err, ApiError::Invalid(_)));
    }

    #[tokio::test]
    async fn long_generate_name_prefix_is_cut() {
        let api = InMemoryApi::<Machine>::new();
        let mut template = Machine::default();
        template.metadata.generate_name = Some("m".repeat(DNS1123_SUBDOMAIN_MAX_LENGTH));

        let created = api.create("default", template).await.unwrap();
        let name = created.metadata.name.unwrap();
        assert!(is_dns1123_subdomain(&name));
        assert_eq!(name.len(), DNS1123_SUBDOMAIN_MAX_LENGTH);
    }

    #[tokio::test]
    async fn stale_update_conflicts() {
        let api = InMemoryApi::<Node>::new();
        let stored = api.insert("", Node::named("node-a")).await.unwrap();

        let mut first = stored.clone();
        first
            .metadata
            .annotations
            .insert("a".to_string(), "1".to_string());
        api.update("", first).await.unwrap();

        let mut second = stored;
        second
            .metadata
            .annotations
            .insert("b".to_string(), "2".to_string());
        let err = api.update("", second).await.unwrap_err();
        assert!(err.is_conflict());

        let missing = api.update("", Node::named("node-b")).await.unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn finalizers_defer_deletion() {
        let api = InMemoryApi::<Machine>::new();
        let mut held = machine("held");
        held.metadata.finalizers = vec!["fleetctl.io/drain".to_string()];
        api.insert("default", held).await.unwrap();
        let mut events = api.watch();

        api.delete("default", "held").await.unwrap();
        let marked = events.recv().await.unwrap();
        assert_eq!(marked.event_type, WatchEventType::Modified);
        assert!(marked.object.metadata.deletion_timestamp.is_some());

        api.delete("default", "held").await.unwrap();
        api.patch("default", "held", br#"{"metadata":{"finalizers":null}}"#)
            .await
            .unwrap();
        let removed = events.recv().await.unwrap();
        assert_eq!(removed.event_type, WatchEventType::Deleted);
        assert!(api.list(Some("default")).await.is_empty());

        let err = api.delete("default", "held").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn merge_patch_updates_and_removes_fields() {
        let api = InMemoryApi::<Machine>::new();
        let mut labelled = machine("m");
        labelled
            .metadata
            .labels
            .insert("keep".to_string(), "1".to_string());
        labelled
            .metadata
            .labels
            .insert("drop".to_string(), "1".to_string());
        api.insert("default", labelled).await.unwrap();

        let patched = api
            .patch(
                "default",
                "m",
                br#"{"metadata":{"labels":{"drop":null,"new":"2"}},"spec":{"providerID":"p-1"}}"#,
            )
            .await
            .unwrap();
        assert_eq!(patched.metadata.labels.get("keep").map(String::as_str), Some("1"));
        assert_eq!(patched.metadata.labels.get("new").map(String::as_str), Some("2"));
        assert!(!patched.metadata.labels.contains_key("drop"));
        assert_eq!(patched.spec.provider_id.as_deref(), Some("p-1"));

        let err = api.patch("default", "m", b"not json").await.unwrap_err();
        assert!(matches!(err, ApiError::Invalid(_)));
    }

    #[tokio::test]
    async fn injected_failures_are_recorded_and_consumed() {
        let api = InMemoryApi::<Node>::new();
        api.insert("", Node::named("n")).await.unwrap();
        api.fail_next(ApiVerb::Get, 1, InjectedFailure::Transport("reset".to_string()));

        let err = api.get("", "n", ReadConsistency::Cached).await.unwrap_err();
        assert!(matches!(err, ApiError::Transport(_)));
        api.get("", "n", ReadConsistency::Latest).await.unwrap();

        let consistencies: Vec<_> = api.actions().iter().map(|a| a.consistency).collect();
        assert_eq!(
            consistencies,
            vec![Some(ReadConsistency::Cached), Some(ReadConsistency::Latest)]
        );
        assert_eq!(api.write_count(), 0);
    }
}
