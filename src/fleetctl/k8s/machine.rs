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


use super::meta::{ApiObject, ObjectMeta, Resource};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const API_VERSION: &str = "machine.fleetctl.io/v1alpha1";
pub const MACHINE_KIND: &str = "Machine";
pub const MACHINE_SET_KIND: &str = "MachineSet";

/// Annotation carrying an integer deletion priority. Lower values are removed
/// first when a set scales down.
pub const MACHINE_PRIORITY_ANNOTATION: &str = "machinepriority.machine.fleetctl.io";

/// Default deletion priority for machines without a usable annotation.
pub const DEFAULT_MACHINE_PRIORITY: i32 = 3;

/// Label carrying the template hash of the set revision that created a machine.
pub const TEMPLATE_HASH_LABEL: &str = "machine-template-hash";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MachinePhase {
    Pending,
    Available,
    Running,
    Terminating,
    Unknown,
    Failed,
    CrashLoopBackOff,
}

impl MachinePhase {
    /// Rank used when picking scale-down victims; lower ranks go first.
    pub fn deletion_rank(self) -> u8 {
        match self {
            MachinePhase::Terminating => 0,
            MachinePhase::Failed => 1,
            MachinePhase::CrashLoopBackOff => 2,
            MachinePhase::Unknown => 3,
            MachinePhase::Pending => 4,
            MachinePhase::Available => 5,
            MachinePhase::Running => 6,
        }
    }
}

/// Reference to the provider-specific machine class.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassSpec {
    #[serde(rename = "apiGroup", skip_serializing_if = "Option::is_none")]
    pub api_group: Option<String>,
    pub kind: String,
    pub name: String,
}

/// Node properties applied once the machine joins the cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeTemplateSpec {
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineSpec {
    #[serde(default)]
    pub class: ClassSpec,
    #[serde(rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(rename = "nodeTemplate", skip_serializing_if = "Option::is_none")]
    pub node_template: Option<NodeTemplateSpec>,
}

/// Blueprint a set stamps machines from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineTemplateSpec {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: MachineSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CurrentStatus {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<MachinePhase>,
    #[serde(rename = "lastUpdateTime", skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineStatus {
    #[serde(rename = "currentStatus", default)]
    pub current_status: CurrentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: MachineSpec,
    #[serde(default)]
    pub status: MachineStatus,
}

impl Default for Machine {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: MACHINE_KIND.to_string(),
            metadata: ObjectMeta::default(),
            spec: MachineSpec::default(),
            status: MachineStatus::default(),
        }
    }
}

impl Machine {
    pub fn phase(&self) -> Option<MachinePhase> {
        self.status.current_status.phase
    }
}

impl Resource for Machine {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn api_version(&self) -> &str {
        &self.api_version
    }

    fn kind(&self) -> &str {
        &self.kind
    }
}

impl ApiObject for Machine {
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineSetSpec {
    #[serde(default)]
    pub replicas: i32,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub selector: HashMap<String, String>,
    #[serde(default)]
    pub template: MachineTemplateSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MachineSetStatus {
    #[serde(default)]
    pub replicas: i32,
    #[serde(rename = "readyReplicas", default)]
    pub ready_replicas: i32,
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineSet {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: MachineSetSpec,
    #[serde(default)]
    pub status: MachineSetStatus,
}

impl Default for MachineSet {
    fn default() -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: MACHINE_SET_KIND.to_string(),
            metadata: ObjectMeta::default(),
            spec: MachineSetSpec::default(),
            status: MachineSetStatus::default(),
        }
    }
}

impl Resource for MachineSet {
    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn api_version(&self) -> &str {
        &self.api_version
    }

    fn kind(&self) -> &str {
        &self.kind
    }
}

impl ApiObject for MachineSet {
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
