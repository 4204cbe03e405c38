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


use crate::fleetctl::k8s::machine::MachineTemplateSpec;
use crate::fleetctl::k8s::names::safe_encode;
use crate::fleetctl::logger::log_warn;
use serde_json::{Map, Value};
use sha1::{Digest, Sha1};
use std::io::Write;

const COMPONENT: &str = "template-hash";

/// Structural hash of a machine template.
///
/// The template is digested as canonical JSON (object keys sorted), so two
/// templates with equal content hash the same regardless of map insertion
/// order. A collision count, when given, is mixed in as eight little-endian
/// bytes to tell apart revisions whose templates are identical.
pub fn compute_hash(template: &MachineTemplateSpec, collision_count: Option<i32>) -> u32 {
    let mut hasher = Sha1::new();
    match serde_json::to_value(template).and_then(|value| serde_json::to_vec(&canonical(value))) {
        Ok(payload) => hasher.update(&payload),
        Err(err) => {
            let err = err.to_string();
            log_warn(
                COMPONENT,
                "Unable to encode machine template",
                &[("error", err.as_str())],
            );
        }
    }

    if let Some(count) = collision_count {
        let mut encoded = [0u8; 8];
        encoded[..4].copy_from_slice(&(count as u32).to_le_bytes());
        if let Err(err) = hasher.write_all(&encoded) {
            let err = err.to_string();
            log_warn(
                COMPONENT,
                "Unable to write collision count",
                &[("error", err.as_str())],
            );
        }
    }

    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Rebuilds every object with its keys in sorted order. serde_json keeps
/// insertion order when `preserve_order` is enabled anywhere in the build.
fn canonical(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(key, value)| (key, canonical(value)))
                    .collect::<Map<String, Value>>(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonical).collect()),
        other => other,
    }
}

/// Label value for a template hash, spelled with the generated-name alphabet.
pub fn template_hash_label(hash: u32) -> String {
    safe_encode(&hash.to_string())
}
