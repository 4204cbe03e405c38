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


use super::events::{
    EventRecorder, EventSeverity, FAILED_CREATE_REASON, FAILED_DELETE_REASON,
    SUCCESSFUL_CREATE_REASON, SUCCESSFUL_DELETE_REASON,
};
use crate::fleetctl::k8s::api::{ApiError, ResourceApi};
use crate::fleetctl::k8s::machine::{Machine, MachineSet, MachineTemplateSpec};
use crate::fleetctl::k8s::meta::{ObjectMeta, OwnerReference, Resource};
use crate::fleetctl::k8s::names::{generate_name, generate_name_prefix};
use crate::fleetctl::logger::{log_error, log_info};
use crate::fleetctl::observability::tracing::with_span;
use futures_util::future::BoxFuture;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

const COMPONENT: &str = "machine-control";

#[derive(Debug)]
pub enum MachineControlError {
    InvalidControllerRef(String),
    /// The materialized machine would carry no labels and could never be
    /// matched by its set's selector.
    NoLabels,
    InvalidParent(String),
    Api(ApiError),
}

impl Display for MachineControlError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineControlError::InvalidControllerRef(msg)
            | MachineControlError::InvalidParent(msg) => f.write_str(msg),
            MachineControlError::NoLabels => f.write_str("unable to create machines, no labels"),
            MachineControlError::Api(err) => write!(f, "{}", err),
        }
    }
}

impl Error for MachineControlError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            MachineControlError::Api(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ApiError> for MachineControlError {
    fn from(err: ApiError) -> Self {
        Self::Api(err)
    }
}

impl MachineControlError {
    /// True for errors raised before any remote call was attempted.
    pub fn is_validation(&self) -> bool {
        !matches!(self, MachineControlError::Api(_))
    }

    pub fn api_error(&self) -> Option<&ApiError> {
        match self {
            MachineControlError::Api(err) => Some(err),
            _ => None,
        }
    }
}

pub fn validate_controller_ref(controller_ref: &OwnerReference) -> Result<(), MachineControlError> {
    let problem = if controller_ref.api_version.is_empty() {
        "controllerRef has empty APIVersion"
    } else if controller_ref.kind.is_empty() {
        "controllerRef has empty Kind"
    } else if controller_ref.controller != Some(true) {
        "controllerRef.Controller is not set to true"
    } else if controller_ref.block_owner_deletion != Some(true) {
        "controllerRef.BlockOwnerDeletion is not set"
    } else {
        return Ok(());
    };
    Err(MachineControlError::InvalidControllerRef(problem.to_string()))
}

fn machine_prefix(parent: &dyn Resource) -> Result<String, MachineControlError> {
    let name = parent.meta().name_or_default();
    if name.is_empty() {
        return Err(MachineControlError::InvalidParent(format!(
            "parent {} has no name",
            parent.kind()
        )));
    }
    Ok(generate_name_prefix(name))
}

fn materialize(
    template: &MachineTemplateSpec,
    controller_ref: Option<&OwnerReference>,
    name: Option<String>,
    generate_name: Option<String>,
) -> Machine {
    let mut machine = Machine {
        metadata: ObjectMeta {
            name,
            generate_name,
            labels: template.metadata.labels.clone(),
            annotations: template.metadata.annotations.clone(),
            finalizers: template.metadata.finalizers.clone(),
            ..Default::default()
        },
        spec: template.spec.clone(),
        ..Default::default()
    };
    if let Some(controller_ref) = controller_ref {
        machine.metadata.owner_references.push(controller_ref.clone());
    }
    machine
}

/// Builds a machine from `template` whose name the API server generates from
/// the parent's name.
pub fn machine_from_template(
    template: &MachineTemplateSpec,
    parent: &dyn Resource,
    controller_ref: Option<&OwnerReference>,
) -> Result<Machine, MachineControlError> {
    let prefix = machine_prefix(parent)?;
    Ok(materialize(template, controller_ref, None, Some(prefix)))
}

/// Like [`machine_from_template`], but resolves the name locally.
pub fn fake_machine_from_template(
    template: &MachineTemplateSpec,
    parent: &dyn Resource,
    controller_ref: Option<&OwnerReference>,
) -> Result<Machine, MachineControlError> {
    let prefix = machine_prefix(parent)?;
    Ok(materialize(
        template,
        controller_ref,
        Some(generate_name(&prefix)),
        None,
    ))
}

pub type ControlFuture<'a, T> = BoxFuture<'a, Result<T, MachineControlError>>;

/// Creates, deletes and patches machines on behalf of a parent set.
pub trait MachineControl: Send + Sync {
    fn create_machines<'a>(
        &'a self,
        namespace: &'a str,
        template: &'a MachineTemplateSpec,
        parent: &'a dyn Resource,
    ) -> ControlFuture<'a, Machine>;

    /// Validates `controller_ref` before anything else and attaches it to the
    /// created machine.
    fn create_machines_with_controller_ref<'a>(
        &'a self,
        namespace: &'a str,
        template: &'a MachineTemplateSpec,
        parent: &'a dyn Resource,
        controller_ref: &'a OwnerReference,
    ) -> ControlFuture<'a, Machine>;

    /// Not-found is returned to the caller like any other failure.
    fn delete_machine<'a>(
        &'a self,
        namespace: &'a str,
        machine_id: &'a str,
        parent: &'a dyn Resource,
    ) -> ControlFuture<'a, ()>;

    fn patch_machine<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        data: &'a [u8],
    ) -> ControlFuture<'a, Machine>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Naming {
    Server,
    Client,
}

struct ControlCore {
    api: Arc<dyn ResourceApi<Machine>>,
    recorder: Arc<dyn EventRecorder>,
    naming: Naming,
}

impl ControlCore {
    async fn create(
        &self,
        namespace: &str,
        template: &MachineTemplateSpec,
        parent: &dyn Resource,
        controller_ref: Option<&OwnerReference>,
    ) -> Result<Machine, MachineControlError> {
        let machine = match self.naming {
            Naming::Server => machine_from_template(template, parent, controller_ref)?,
            Naming::Client => fake_machine_from_template(template, parent, controller_ref)?,
        };
        if machine.metadata.labels.is_empty() {
            return Err(MachineControlError::NoLabels);
        }

        let controller = parent.meta().name_or_default();
        match self.api.create(namespace, machine).await {
            Ok(created) => {
                let name = created.metadata.name_or_default();
                log_info(
                    COMPONENT,
                    "Controller created machine",
                    &[
                        ("controller", controller),
                        ("namespace", namespace),
                        ("machine", name),
                    ],
                );
                self.recorder
                    .notify(
                        parent.object_reference(),
                        EventSeverity::Normal,
                        SUCCESSFUL_CREATE_REASON,
                        format!("Created Machine: {}", name),
                    )
                    .await;
                Ok(created)
            }
            Err(err) => {
                let message = err.to_string();
                log_error(
                    COMPONENT,
                    "Failed to create machine",
                    &[
                        ("controller", controller),
                        ("namespace", namespace),
                        ("error", message.as_str()),
                    ],
                );
                self.recorder
                    .notify(
                        parent.object_reference(),
                        EventSeverity::Warning,
                        FAILED_CREATE_REASON,
                        format!("Error creating: {}", message),
                    )
                    .await;
                Err(MachineControlError::Api(err))
            }
        }
    }

    async fn delete(
        &self,
        namespace: &str,
        machine_id: &str,
        parent: &dyn Resource,
    ) -> Result<(), MachineControlError> {
        let controller = parent.meta().name_or_default();
        log_info(
            COMPONENT,
            "Controller deleting machine",
            &[
                ("controller", controller),
                ("namespace", namespace),
                ("machine", machine_id),
            ],
        );

        if let Err(err) = self.api.delete(namespace, machine_id).await {
            self.recorder
                .notify(
                    parent.object_reference(),
                    EventSeverity::Warning,
                    FAILED_DELETE_REASON,
                    format!("Error deleting: {}", err),
                )
                .await;
            return Err(MachineControlError::Api(err));
        }

        self.recorder
            .notify(
                parent.object_reference(),
                EventSeverity::Normal,
                SUCCESSFUL_DELETE_REASON,
                format!("Deleted machine: {}", machine_id),
            )
            .await;
        Ok(())
    }

    async fn patch(
        &self,
        namespace: &str,
        name: &str,
        data: &[u8],
    ) -> Result<Machine, MachineControlError> {
        Ok(self.api.patch(namespace, name, data).await?)
    }
}

macro_rules! machine_control_impl {
    ($control:ty) => {
        impl MachineControl for $control {
            fn create_machines<'a>(
                &'a self,
                namespace: &'a str,
                template: &'a MachineTemplateSpec,
                parent: &'a dyn Resource,
            ) -> ControlFuture<'a, Machine> {
                Box::pin(with_span(
                    COMPONENT,
                    "create-machines",
                    self.core.create(namespace, template, parent, None),
                ))
            }

            fn create_machines_with_controller_ref<'a>(
                &'a self,
                namespace: &'a str,
                template: &'a MachineTemplateSpec,
                parent: &'a dyn Resource,
                controller_ref: &'a OwnerReference,
            ) -> ControlFuture<'a, Machine> {
                Box::pin(with_span(COMPONENT, "create-machines", async move {
                    validate_controller_ref(controller_ref)?;
                    self.core
                        .create(namespace, template, parent, Some(controller_ref))
                        .await
                }))
            }

            fn delete_machine<'a>(
                &'a self,
                namespace: &'a str,
                machine_id: &'a str,
                parent: &'a dyn Resource,
            ) -> ControlFuture<'a, ()> {
                Box::pin(with_span(
                    COMPONENT,
                    "delete-machine",
                    self.core.delete(namespace, machine_id, parent),
                ))
            }

            fn patch_machine<'a>(
                &'a self,
                namespace: &'a str,
                name: &'a str,
                data: &'a [u8],
            ) -> ControlFuture<'a, Machine> {
                Box::pin(with_span(
                    COMPONENT,
                    "patch-machine",
                    self.core.patch(namespace, name, data),
                ))
            }
        }
    };
}

/// Machine control backed by the remote API; names are generated server side.
pub struct RealMachineControl {
    core: ControlCore,
}

impl RealMachineControl {
    pub fn new(api: Arc<dyn ResourceApi<Machine>>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self {
            core: ControlCore {
                api,
                recorder,
                naming: Naming::Server,
            },
        }
    }
}

/// Machine control for tests. Names are resolved before the create call so
/// backends without name generation can be used.
pub struct FakeMachineControl {
    core: ControlCore,
}

impl FakeMachineControl {
    pub fn new(api: Arc<dyn ResourceApi<Machine>>, recorder: Arc<dyn EventRecorder>) -> Self {
        Self {
            core: ControlCore {
                api,
                recorder,
                naming: Naming::Client,
            },
        }
    }
}

machine_control_impl!(RealMachineControl);
machine_control_impl!(FakeMachineControl);

pub trait MachineSetControl: Send + Sync {
    fn patch_machine_set<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<MachineSet, ApiError>>;
}

pub struct RealMachineSetControl {
    api: Arc<dyn ResourceApi<MachineSet>>,
}

impl RealMachineSetControl {
    pub fn new(api: Arc<dyn ResourceApi<MachineSet>>) -> Self {
        Self { api }
    }
}

impl MachineSetControl for RealMachineSetControl {
    fn patch_machine_set<'a>(
        &'a self,
        namespace: &'a str,
        name: &'a str,
        data: &'a [u8],
    ) -> BoxFuture<'a, Result<MachineSet, ApiError>> {
        self.api.patch(namespace, name, data)
    }
}
