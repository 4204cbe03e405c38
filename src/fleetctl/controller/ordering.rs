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


use crate::fleetctl::k8s::machine::{
    Machine, MachinePhase, MachineSet, DEFAULT_MACHINE_PRIORITY, MACHINE_PRIORITY_ANNOTATION,
};
use crate::fleetctl::logger::log_warn;
use std::borrow::Borrow;
use std::cmp::Ordering;

const COMPONENT: &str = "machine-ordering";

/// Key used for keyed machine lookups. Namespaces are not part of the key.
pub fn machine_key(machine: &Machine) -> String {
    machine.metadata.name_or_default().to_string()
}

/// Deletion priority from the machine priority annotation. Missing or
/// unparseable values fall back to the default.
pub fn machine_deletion_priority(machine: &Machine) -> i32 {
    let Some(raw) = machine
        .metadata
        .annotations
        .get(MACHINE_PRIORITY_ANNOTATION)
        .filter(|value| !value.is_empty())
    else {
        return DEFAULT_MACHINE_PRIORITY;
    };
    match raw.parse::<i32>() {
        Ok(priority) => priority,
        Err(err) => {
            let err = err.to_string();
            log_warn(
                COMPONENT,
                "Machine priority is not an integer, using the default",
                &[
                    ("machine", machine.metadata.name_or_default()),
                    ("value", raw.as_str()),
                    ("error", err.as_str()),
                ],
            );
            DEFAULT_MACHINE_PRIORITY
        }
    }
}

/// Machines without a reported phase rank alongside terminating ones.
fn phase_rank(machine: &Machine) -> u8 {
    machine.phase().map_or(0, MachinePhase::deletion_rank)
}

/// Orders machines so the best scale-down victims come first: lower priority,
/// then less healthy phase, then older.
pub fn compare_machines_for_deletion(a: &Machine, b: &Machine) -> Ordering {
    machine_deletion_priority(a)
        .cmp(&machine_deletion_priority(b))
        .then_with(|| phase_rank(a).cmp(&phase_rank(b)))
        .then_with(|| {
            a.metadata
                .creation_timestamp
                .cmp(&b.metadata.creation_timestamp)
        })
}

pub fn sort_machines_for_deletion<T: Borrow<Machine>>(machines: &mut [T]) {
    machines.sort_by(|a, b| compare_machines_for_deletion(a.borrow(), b.borrow()));
}

/// Oldest first, names break ties.
pub fn compare_by_creation_timestamp(a: &MachineSet, b: &MachineSet) -> Ordering {
    a.metadata
        .creation_timestamp
        .cmp(&b.metadata.creation_timestamp)
        .then_with(|| a.metadata.name.cmp(&b.metadata.name))
}

/// Largest first; equal sizes put the older set first.
pub fn compare_by_size_older(a: &MachineSet, b: &MachineSet) -> Ordering {
    b.spec
        .replicas
        .cmp(&a.spec.replicas)
        .then_with(|| compare_by_creation_timestamp(a, b))
}

/// Largest first; equal sizes put the newer set first.
pub fn compare_by_size_newer(a: &MachineSet, b: &MachineSet) -> Ordering {
    b.spec
        .replicas
        .cmp(&a.spec.replicas)
        .then_with(|| compare_by_creation_timestamp(b, a))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MachineSetOrdering {
    CreationTimestamp,
    SizeOlder,
    SizeNewer,
}

impl MachineSetOrdering {
    pub fn comparator(self) -> fn(&MachineSet, &MachineSet) -> Ordering {
        match self {
            MachineSetOrdering::CreationTimestamp => compare_by_creation_timestamp,
            MachineSetOrdering::SizeOlder => compare_by_size_older,
            MachineSetOrdering::SizeNewer => compare_by_size_newer,
        }
    }

    pub fn sort<T: Borrow<MachineSet>>(self, sets: &mut [T]) {
        let compare = self.comparator();
        sets.sort_by(|a, b| compare(a.borrow(), b.borrow()));
    }
}

pub fn filter_machine_sets<'a, F>(sets: &'a [MachineSet], predicate: F) -> Vec<&'a MachineSet>
where
    F: Fn(&MachineSet) -> bool,
{
    sets.iter().filter(|set| predicate(set)).collect()
}

/// Sets that have, or ought to have, machines.
pub fn filter_active_machine_sets(sets: &[MachineSet]) -> Vec<&MachineSet> {
    filter_machine_sets(sets, |set| set.spec.replicas > 0)
}
