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
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Cluster-scoped node object. Only metadata is interpreted here; spec and
/// status are carried opaquely so writes round-trip them untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub spec: Value,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub status: Value,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Node".to_string(),
            metadata: ObjectMeta::default(),
            spec: Value::Null,
            status: Value::Null,
        }
    }
}

impl Node {
    pub fn named(name: &str) -> Self {
        let mut node = Self::default();
        node.metadata.name = Some(name.to_string());
        node
    }
}

impl Resource for Node {
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

impl ApiObject for Node {
    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}
