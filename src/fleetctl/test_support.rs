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


//! Shared fixtures for unit and integration tests.

use crate::fleetctl::k8s::machine::{
    ClassSpec, Machine, MachinePhase, MachineSet, MachineSetSpec, MachineSpec,
    MachineTemplateSpec, MACHINE_PRIORITY_ANNOTATION,
};
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::env;
use std::sync::{Mutex, MutexGuard, OnceLock};

pub struct EnvTestLock {
    inner: Mutex<()>,
}

impl EnvTestLock {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ()> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for EnvTestLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Global mutex for tests that read or write process environment variables.
pub fn env_lock() -> &'static EnvTestLock {
    static LOCK: OnceLock<EnvTestLock> = OnceLock::new();
    LOCK.get_or_init(EnvTestLock::new)
}

/// Sets or clears an environment variable and restores the previous value
/// when dropped.
pub struct EnvGuard {
    key: String,
    previous: Option<String>,
}

impl EnvGuard {
    pub fn set(key: &str, value: &str) -> Self {
        let previous = env::var(key).ok();
        env::set_var(key, value);
        Self {
            key: key.to_string(),
            previous,
        }
    }

    pub fn unset(key: &str) -> Self {
        let previous = env::var(key).ok();
        env::remove_var(key);
        Self {
            key: key.to_string(),
            previous,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        match &self.previous {
            Some(value) => env::set_var(&self.key, value),
            None => env::remove_var(&self.key),
        }
    }
}

/// Fixed instant used as the epoch for fixture creation timestamps.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

pub fn minutes_after_base(minutes: i64) -> DateTime<Utc> {
    base_time() + Duration::minutes(minutes)
}

/// Template with the given labels and a fixed machine class.
pub fn machine_template(labels: &[(&str, &str)]) -> MachineTemplateSpec {
    let mut template = MachineTemplateSpec {
        spec: MachineSpec {
            class: ClassSpec {
                api_group: Some("machine.fleetctl.io".to_string()),
                kind: "MachineClass".to_string(),
                name: "standard".to_string(),
            },
            ..Default::default()
        },
        ..Default::default()
    };
    for (key, value) in labels {
        template
            .metadata
            .labels
            .insert(key.to_string(), value.to_string());
    }
    template
}

pub fn machine(
    name: &str,
    phase: Option<MachinePhase>,
    priority: Option<&str>,
    created_minute: i64,
) -> Machine {
    let mut machine = Machine::default();
    machine.metadata.name = Some(name.to_string());
    machine.metadata.namespace = Some("default".to_string());
    machine.metadata.creation_timestamp = Some(minutes_after_base(created_minute));
    if let Some(priority) = priority {
        machine
            .metadata
            .annotations
            .insert(MACHINE_PRIORITY_ANNOTATION.to_string(), priority.to_string());
    }
    machine.status.current_status.phase = phase;
    machine
}

pub fn machine_set(name: &str, replicas: i32, created_minute: i64) -> MachineSet {
    let mut set = MachineSet::default();
    set.metadata.name = Some(name.to_string());
    set.metadata.namespace = Some("default".to_string());
    set.metadata.uid = Some(format!("uid-{}", name));
    set.metadata.creation_timestamp = Some(minutes_after_base(created_minute));
    set.spec = MachineSetSpec {
        replicas,
        template: machine_template(&[("pool", name)]),
        ..Default::default()
    };
    set
}
