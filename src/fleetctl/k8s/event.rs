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


use super::meta::{ObjectMeta, ObjectReference};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};

pub const DEFAULT_EVENT_RETENTION: usize = 1024;
const WATCH_BUFFER_SIZE: usize = 64;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSource {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

/// Minimal representation of a core/v1 Event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(rename = "involvedObject")]
    pub involved_object: ObjectReference,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    #[serde(rename = "firstTimestamp", skip_serializing_if = "Option::is_none")]
    pub first_timestamp: Option<String>,
    #[serde(rename = "lastTimestamp", skip_serializing_if = "Option::is_none")]
    pub last_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<EventSource>,
}

impl Event {
    pub fn new(
        involved_object: ObjectReference,
        event_type: &str,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Event".to_string(),
            metadata: ObjectMeta::default(),
            involved_object,
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            event_type: Some(event_type.to_string()),
            first_timestamp: None,
            last_timestamp: None,
            count: None,
            source: None,
        }
    }
}

struct EventStore {
    records: VecDeque<Event>,
    capacity: usize,
}

impl EventStore {
    fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, event: Event) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(event);
    }
}

/// Bounded in-memory event log. The oldest record is dropped once the
/// retention limit is reached.
pub struct EventRegistry {
    store: RwLock<EventStore>,
    watchers: broadcast::Sender<Event>,
    resource_counter: AtomicU64,
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_RETENTION)
    }
}

impl EventRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            store: RwLock::new(EventStore::new(capacity.max(1))),
            watchers: broadcast::channel(WATCH_BUFFER_SIZE).0,
            resource_counter: AtomicU64::new(1),
        }
    }

    pub async fn record(&self, mut event: Event) -> Event {
        let resource_version = self.resource_counter.fetch_add(1, Ordering::SeqCst);
        event.metadata.resource_version = Some(resource_version.to_string());
        event.metadata.name = Some(format!("event-{}", resource_version));
        if event.metadata.namespace.is_none() {
            event.metadata.namespace = Some(
                event
                    .involved_object
                    .namespace
                    .clone()
                    .filter(|ns| !ns.is_empty())
                    .unwrap_or_else(|| "default".to_string()),
            );
        }
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        event.first_timestamp.get_or_insert_with(|| now.clone());
        event.last_timestamp.get_or_insert(now);
        event.count.get_or_insert(1);

        self.store.write().await.push(event.clone());
        let _ = self.watchers.send(event.clone());
        event
    }

    pub async fn list(&self, namespace: Option<&str>) -> Vec<Event> {
        let store = self.store.read().await;
        store
            .records
            .iter()
            .filter(|event| {
                namespace.map_or(true, |ns| event.metadata.namespace.as_deref() == Some(ns))
            })
            .cloned()
            .collect()
    }

    pub fn watch(&self) -> broadcast::Receiver<Event> {
        self.watchers.subscribe()
    }
}
