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


//! Coordination primitives used by machine-set reconcilers.
//!
//! Reconcilers consult the expectation stores before acting, act through
//! [`machine_control::MachineControl`], and feed watch observations back into
//! the stores. Node annotation updates run independently of the reconcile
//! loop.

pub mod cache;
pub mod events;
pub mod expectations;
pub mod hash;
pub mod machine_control;
pub mod node_annotations;
pub mod ordering;
pub mod uid_expectations;
