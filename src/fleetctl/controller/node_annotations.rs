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


use crate::fleetctl::config::BackoffConfig;
use crate::fleetctl::k8s::api::{ApiError, ReadConsistency, ResourceApi};
use crate::fleetctl::k8s::node::Node;
use crate::fleetctl::logger::{log_debug, log_warn};
use crate::fleetctl::observability::tracing::with_span;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

const COMPONENT: &str = "node-annotations";

/// Runs `attempt` until it stops failing with a conflict or the backoff
/// budget is spent. `attempt` receives the zero-based attempt number. The
/// last conflict is returned on exhaustion.
pub async fn retry_on_conflict<T, F, Fut>(backoff: BackoffConfig, mut attempt: F) -> Result<T, ApiError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    let steps = backoff.steps.max(1);
    let mut step = 0;
    loop {
        match attempt(step).await {
            Err(err) if err.is_conflict() && step + 1 < steps => {
                let delay = backoff.jittered(rand::thread_rng().gen::<f64>());
                tokio::time::sleep(delay).await;
                step += 1;
            }
            outcome => return outcome,
        }
    }
}

/// Read-modify-write of node annotations under optimistic concurrency.
pub struct NodeAnnotationUpdater {
    api: Arc<dyn ResourceApi<Node>>,
    backoff: BackoffConfig,
}

impl NodeAnnotationUpdater {
    pub fn new(api: Arc<dyn ResourceApi<Node>>, backoff: BackoffConfig) -> Self {
        Self { api, backoff }
    }

    /// Sets `annotations` on the node. Nothing is written when the node is
    /// gone or already carries every requested value.
    pub async fn add_or_update_annotations(
        &self,
        node_name: &str,
        annotations: &HashMap<String, String>,
    ) -> Result<(), ApiError> {
        if node_name.is_empty() || annotations.is_empty() {
            return Ok(());
        }
        with_span(
            COMPONENT,
            "add-or-update-annotations",
            self.mutate(node_name, |current| {
                let mut changed = false;
                for (key, value) in annotations {
                    if current.get(key) != Some(value) {
                        current.insert(key.clone(), value.clone());
                        changed = true;
                    }
                }
                changed
            }),
        )
        .await
    }

    /// Removes the annotation keys in `annotations`; values are ignored.
    pub async fn remove_annotations(
        &self,
        node_name: &str,
        annotations: &HashMap<String, String>,
    ) -> Result<(), ApiError> {
        if node_name.is_empty() || annotations.is_empty() {
            return Ok(());
        }
        with_span(
            COMPONENT,
            "remove-annotations",
            self.mutate(node_name, |current| {
                let before = current.len();
                current.retain(|key, _| !annotations.contains_key(key));
                current.len() != before
            }),
        )
        .await
    }

    /// Fresh read of the node's annotations. `None` for an empty name or a
    /// missing node.
    pub async fn get_annotations(
        &self,
        node_name: &str,
    ) -> Result<Option<HashMap<String, String>>, ApiError> {
        if node_name.is_empty() {
            return Ok(None);
        }
        match self.api.get("", node_name, ReadConsistency::Latest).await {
            Ok(node) => Ok(Some(node.metadata.annotations)),
            Err(err) if err.is_not_found() => {
                let err = err.to_string();
                log_warn(
                    COMPONENT,
                    "Node not found while fetching annotations",
                    &[("node", node_name), ("error", err.as_str())],
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn mutate<F>(&self, node_name: &str, change: F) -> Result<(), ApiError>
    where
        F: Fn(&mut HashMap<String, String>) -> bool + Send + Sync,
    {
        let change = &change;
        retry_on_conflict(self.backoff, |step| async move {
            // The first read may come from a cache; retries must not.
            let consistency = if step == 0 {
                ReadConsistency::Cached
            } else {
                ReadConsistency::Latest
            };
            let mut node = match self.api.get("", node_name, consistency).await {
                Ok(node) => node,
                Err(err) if err.is_not_found() => {
                    let err = err.to_string();
                    log_warn(
                        COMPONENT,
                        "Node not found while updating annotations",
                        &[("node", node_name), ("error", err.as_str())],
                    );
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            if !change(&mut node.metadata.annotations) {
                log_debug(COMPONENT, "Node annotations already up to date", &[("node", node_name)]);
                return Ok(());
            }
            self.api.update("", node).await.map(|_| ())
        })
        .await
    }
}
