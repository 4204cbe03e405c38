use fleetctl::fleetctl::controller::events::{
    SUCCESSFUL_CREATE_REASON, SUCCESSFUL_DELETE_REASON,
};
use fleetctl::fleetctl::controller::hash::{compute_hash, template_hash_label};
use fleetctl::fleetctl::controller::machine_control::{
    FakeMachineControl, MachineControl, MachineControlError, MachineSetControl,
    RealMachineControl, RealMachineSetControl,
};
use fleetctl::fleetctl::controller::ordering::{machine_key, sort_machines_for_deletion};
use fleetctl::fleetctl::k8s::event::EventRegistry;
use fleetctl::fleetctl::k8s::machine::{Machine, MachinePhase, MachineSet, TEMPLATE_HASH_LABEL};
use fleetctl::fleetctl::k8s::meta::OwnerReference;
use fleetctl::fleetctl::k8s::registry::{ApiVerb, InMemoryApi};
use fleetctl::fleetctl::test_support::{machine, machine_set, machine_template};
use futures_util::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;

const NAMESPACE: &str = "default";

struct ScenarioHarness {
    machines: Arc<InMemoryApi<Machine>>,
    sets: Arc<InMemoryApi<MachineSet>>,
    events: Arc<EventRegistry>,
}

impl ScenarioHarness {
    fn new() -> Self {
        Self {
            machines: Arc::new(InMemoryApi::new()),
            sets: Arc::new(InMemoryApi::new()),
            events: Arc::new(EventRegistry::default()),
        }
    }

    fn real(&self) -> RealMachineControl {
        RealMachineControl::new(self.machines.clone(), self.events.clone())
    }

    fn fake(&self) -> FakeMachineControl {
        FakeMachineControl::new(self.machines.clone(), self.events.clone())
    }

    async fn reasons(&self) -> Vec<String> {
        self.events
            .list(None)
            .await
            .into_iter()
            .filter_map(|event| event.reason)
            .collect()
    }

    async fn names(&self) -> Vec<String> {
        self.machines
            .list(Some(NAMESPACE))
            .await
            .into_iter()
            .filter_map(|machine| machine.metadata.name)
            .collect()
    }
}

#[tokio::test]
async fn scenario_rejected_requests_never_reach_the_server() {
    let harness = ScenarioHarness::new();
    let parent = machine_set("pool", 2, 0);
    let control = harness.real();

    let mut reference = OwnerReference::controller_of(&parent);
    reference.block_owner_deletion = None;
    let err = control
        .create_machines_with_controller_ref(
            NAMESPACE,
            &machine_template(&[("pool", "pool")]),
            &parent,
            &reference,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MachineControlError::InvalidControllerRef(_)));

    let err = control
        .create_machines(NAMESPACE, &machine_template(&[]), &parent)
        .await
        .unwrap_err();
    assert!(matches!(err, MachineControlError::NoLabels));
    assert!(err.is_validation());

    assert!(harness.machines.actions().is_empty());
    assert!(harness.reasons().await.is_empty());
}

#[tokio::test]
async fn scenario_parallel_scale_up_yields_distinct_machines() {
    let harness = ScenarioHarness::new();
    let parent = machine_set("pool", 5, 0);
    let reference = OwnerReference::controller_of(&parent);
    let control = harness.real();

    let outcomes = join_all((0..5).map(|_| {
        control.create_machines_with_controller_ref(
            NAMESPACE,
            &parent.spec.template,
            &parent,
            &reference,
        )
    }))
    .await;

    let mut names = HashSet::new();
    for outcome in outcomes {
        let created = outcome.unwrap();
        assert_eq!(created.metadata.controller_ref(), Some(&reference));
        let name = created.metadata.name.unwrap();
        assert!(name.starts_with("pool-"));
        names.insert(name);
    }
    assert_eq!(names.len(), 5);
    assert_eq!(harness.names().await.len(), 5);
    assert_eq!(
        harness.reasons().await,
        vec![SUCCESSFUL_CREATE_REASON.to_string(); 5]
    );
}

#[tokio::test]
async fn scenario_scale_down_removes_least_valuable_machines() {
    let harness = ScenarioHarness::new();
    let parent = machine_set("pool", 2, 0);
    let candidates = vec![
        machine("pool-keep", Some(MachinePhase::Running), None, 1),
        machine("pool-failed", Some(MachinePhase::Failed), None, 5),
        machine("pool-doomed", Some(MachinePhase::Running), Some("1"), 9),
        machine("pool-pending", Some(MachinePhase::Pending), None, 3),
    ];
    for candidate in &candidates {
        harness
            .machines
            .insert(NAMESPACE, candidate.clone())
            .await
            .unwrap();
    }

    let mut ranked: Vec<&Machine> = candidates.iter().collect();
    sort_machines_for_deletion(&mut ranked);
    assert_eq!(machine_key(ranked[0]), "pool-doomed");

    let control = harness.fake();
    for victim in ranked.iter().take(2) {
        control
            .delete_machine(NAMESPACE, victim.metadata.name_or_default(), &parent)
            .await
            .unwrap();
    }

    assert_eq!(
        harness.names().await,
        vec!["pool-keep".to_string(), "pool-pending".to_string()]
    );
    assert_eq!(
        harness.reasons().await,
        vec![SUCCESSFUL_DELETE_REASON.to_string(); 2]
    );
}

#[tokio::test]
async fn scenario_template_revision_is_stamped_and_published() {
    let harness = ScenarioHarness::new();
    let mut parent = harness
        .sets
        .insert(NAMESPACE, machine_set("pool", 1, 0))
        .await
        .unwrap();

    let hash = compute_hash(&parent.spec.template, None);
    let label = template_hash_label(hash);
    assert_ne!(label, template_hash_label(compute_hash(&parent.spec.template, Some(1))));

    let mut template = parent.spec.template.clone();
    template
        .metadata
        .labels
        .insert(TEMPLATE_HASH_LABEL.to_string(), label.clone());
    let created = harness
        .fake()
        .create_machines(NAMESPACE, &template, &parent)
        .await
        .unwrap();
    assert_eq!(
        created.metadata.labels.get(TEMPLATE_HASH_LABEL),
        Some(&label)
    );
    assert_eq!(created.metadata.labels.get("pool").map(String::as_str), Some("pool"));

    let patch = format!(
        r#"{{"metadata":{{"annotations":{{"{}":"{}"}}}},"status":{{"replicas":1}}}}"#,
        TEMPLATE_HASH_LABEL, label
    );
    parent = RealMachineSetControl::new(harness.sets.clone())
        .patch_machine_set(NAMESPACE, "pool", patch.as_bytes())
        .await
        .unwrap();
    assert_eq!(parent.status.replicas, 1);
    assert_eq!(
        parent.metadata.annotations.get(TEMPLATE_HASH_LABEL),
        Some(&label)
    );
    assert_eq!(harness.sets.count(ApiVerb::Patch), 1);
    // Patching the set leaves the machine's labels alone.
    assert_eq!(harness.machines.count(ApiVerb::Patch), 0);
}
