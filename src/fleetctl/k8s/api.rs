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


use super::meta::ApiObject;
use futures_util::future::BoxFuture;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    AlreadyExists(String),
    Conflict(String),
    Invalid(String),
    Transport(Box<dyn Error + Send + Sync>),
}

impl Display for ApiError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::NotFound(msg)
            | ApiError::AlreadyExists(msg)
            | ApiError::Conflict(msg)
            | ApiError::Invalid(msg) => f.write_str(msg),
            ApiError::Transport(err) => write!(f, "{}", err),
        }
    }
}

impl Error for ApiError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ApiError::Transport(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl ApiError {
    pub fn transport(err: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self::Transport(err.into())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Conflict(_))
    }
}

/// Freshness requested for a read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadConsistency {
    /// Any cached copy is acceptable, even if stale.
    Cached,
    /// Read through to the authoritative store.
    Latest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub object: T,
}

pub type ApiFuture<'a, T> = BoxFuture<'a, Result<T, ApiError>>;

/// Remote API for one resource kind. Writes carry `metadata.resourceVersion`
/// for optimistic concurrency: a stale token fails with [`ApiError::Conflict`].
pub trait ResourceApi<T: ApiObject>: Send + Sync {
    fn get<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        consistency: ReadConsistency,
    ) -> ApiFuture<'a, T>;

    /// Creates `object`. An empty name with a `generateName` prefix is
    /// resolved by the server.
    fn create<'a>(&'a self, namespace: &'a str, object: T) -> ApiFuture<'a, T>;

    fn update<'a>(&'a self, namespace: &'a str, object: T) -> ApiFuture<'a, T>;

    fn delete<'a>(&'a self, namespace: &'a str, name: &'a str) -> ApiFuture<'a, ()>;

    /// Applies an RFC 7386 JSON merge patch.
    fn patch<'a>(&'a self, namespace: &'a str, name: &'a str, patch: &'a [u8]) -> ApiFuture<'a, T>;
}
