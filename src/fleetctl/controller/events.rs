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


use crate::fleetctl::k8s::event::{Event, EventRegistry, EventSource};
use crate::fleetctl::k8s::meta::ObjectReference;
use futures_util::future::BoxFuture;
use std::fmt::{Display, Formatter};
use std::sync::Mutex;

pub const REPORTING_COMPONENT: &str = "fleetctl-machine-controller";

pub const SUCCESSFUL_CREATE_REASON: &str = "SuccessfulCreate";
pub const FAILED_CREATE_REASON: &str = "FailedCreate";
pub const SUCCESSFUL_DELETE_REASON: &str = "SuccessfulDelete";
pub const FAILED_DELETE_REASON: &str = "FailedDelete";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Normal,
    Warning,
}

impl EventSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            EventSeverity::Normal => "Normal",
            EventSeverity::Warning => "Warning",
        }
    }
}

impl Display for EventSeverity {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sink for user-facing notifications about an object.
pub trait EventRecorder: Send + Sync {
    fn notify<'a>(
        &'a self,
        subject: ObjectReference,
        severity: EventSeverity,
        reason: &'a str,
        message: String,
    ) -> BoxFuture<'a, ()>;
}

impl EventRecorder for EventRegistry {
    fn notify<'a>(
        &'a self,
        subject: ObjectReference,
        severity: EventSeverity,
        reason: &'a str,
        message: String,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let mut event = Event::new(subject, severity.as_str(), reason, message);
            event.source = Some(EventSource {
                component: Some(REPORTING_COMPONENT.to_string()),
                host: None,
            });
            self.record(event).await;
        })
    }
}

/// Recorder that keeps notifications in memory as `"<severity> <reason> <message>"`.
#[derive(Debug, Default)]
pub struct FakeRecorder {
    events: Mutex<Vec<(ObjectReference, String)>>,
}

impl FakeRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.recorded().into_iter().map(|(_, line)| line).collect()
    }

    pub fn recorded(&self) -> Vec<(ObjectReference, String)> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl EventRecorder for FakeRecorder {
    fn notify<'a>(
        &'a self,
        subject: ObjectReference,
        severity: EventSeverity,
        reason: &'a str,
        message: String,
    ) -> BoxFuture<'a, ()> {
        let line = format!("{} {} {}", severity, reason, message);
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((subject, line));
        Box::pin(async {})
    }
}
