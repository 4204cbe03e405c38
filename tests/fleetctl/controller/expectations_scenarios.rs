use fleetctl::fleetctl::controller::events::FakeRecorder;
use fleetctl::fleetctl::controller::expectations::ControllerExpectations;
use fleetctl::fleetctl::controller::machine_control::{MachineControl, RealMachineControl};
use fleetctl::fleetctl::controller::ordering::sort_machines_for_deletion;
use fleetctl::fleetctl::controller::uid_expectations::UidTrackingExpectations;
use fleetctl::fleetctl::k8s::api::{WatchEvent, WatchEventType};
use fleetctl::fleetctl::k8s::machine::{Machine, MachinePhase, MachineSet};
use fleetctl::fleetctl::k8s::meta::OwnerReference;
use fleetctl::fleetctl::k8s::registry::{ApiVerb, InMemoryApi, InjectedFailure};
use fleetctl::fleetctl::test_support::{machine_set, machine_template};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const NAMESPACE: &str = "default";
const SET_NAME: &str = "pool";

type Tracker = UidTrackingExpectations<ControllerExpectations>;

/// Reconciler-side wiring: machine control, expectations and a watch handler
/// that feeds observations back into the expectations.
struct ScenarioHarness {
    api: Arc<InMemoryApi<Machine>>,
    control: RealMachineControl,
    expectations: Arc<Tracker>,
    parent: MachineSet,
}

impl ScenarioHarness {
    fn new() -> Self {
        let api = Arc::new(InMemoryApi::new());
        let recorder = Arc::new(FakeRecorder::new());
        let control = RealMachineControl::new(api.clone(), recorder);
        let expectations = Arc::new(UidTrackingExpectations::new(ControllerExpectations::new()));
        tokio::spawn(observe(api.watch(), expectations.clone()));
        Self {
            api,
            control,
            expectations,
            parent: machine_set(SET_NAME, 3, 0),
        }
    }

    fn key(&self) -> String {
        format!("{}/{}", NAMESPACE, SET_NAME)
    }

    async fn create(&self, finalizers: &[&str]) -> Result<Machine, String> {
        let mut template = machine_template(&[("pool", SET_NAME)]);
        template.metadata.finalizers = finalizers.iter().map(|f| f.to_string()).collect();
        self.control
            .create_machines_with_controller_ref(
                NAMESPACE,
                &template,
                &self.parent,
                &OwnerReference::controller_of(&self.parent),
            )
            .await
            .map_err(|err| err.to_string())
    }

    fn counters(&self) -> (i64, i64) {
        self.expectations
            .get_expectations(&self.key())
            .expect("store readable")
            .map(|exp| exp.get_expectations())
            .unwrap_or_default()
    }

    async fn wait_until(&self, condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn wait_for_machines(&self, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.api.list(Some(NAMESPACE)).await.len() != expected {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("machine count not reached in time");
    }
}

fn owner_key(machine: &Machine) -> Option<String> {
    let owner = machine.metadata.controller_ref()?;
    Some(format!(
        "{}/{}",
        machine.metadata.namespace_or_default(),
        owner.name
    ))
}

async fn observe(mut events: broadcast::Receiver<WatchEvent<Machine>>, expectations: Arc<Tracker>) {
    while let Ok(event) = events.recv().await {
        let Some(key) = owner_key(&event.object) else {
            continue;
        };
        let uid = event.object.metadata.uid.clone().unwrap_or_default();
        match event.event_type {
            WatchEventType::Added => expectations.creation_observed(&key),
            WatchEventType::Modified if event.object.metadata.deletion_timestamp.is_some() => {
                expectations.deletion_observed(&key, &uid)
            }
            WatchEventType::Modified => {}
            WatchEventType::Deleted => expectations.deletion_observed(&key, &uid),
        }
    }
}

#[tokio::test]
async fn scenario_scale_up_waits_for_every_creation() {
    let harness = ScenarioHarness::new();
    let key = harness.key();
    assert!(harness.expectations.satisfied_expectations(&key));

    harness.expectations.expect_creations(&key, 3).unwrap();
    assert!(!harness.expectations.satisfied_expectations(&key));

    for _ in 0..3 {
        harness.create(&[]).await.unwrap();
    }
    harness
        .wait_until(|| harness.expectations.satisfied_expectations(&key))
        .await;
    assert_eq!(harness.counters(), (0, 0));
    assert_eq!(harness.api.list(Some(NAMESPACE)).await.len(), 3);
}

#[tokio::test]
async fn scenario_failed_creation_is_lowered_by_reconciler() {
    let harness = ScenarioHarness::new();
    let key = harness.key();
    harness
        .api
        .fail_next(ApiVerb::Create, 1, InjectedFailure::Invalid);

    harness.expectations.expect_creations(&key, 2).unwrap();
    for _ in 0..2 {
        if harness.create(&[]).await.is_err() {
            // No watch event will arrive for a create the server rejected.
            harness.expectations.creation_observed(&key);
        }
    }

    harness
        .wait_until(|| harness.expectations.satisfied_expectations(&key))
        .await;
    assert_eq!(harness.api.list(Some(NAMESPACE)).await.len(), 1);
}

#[tokio::test]
async fn scenario_graceful_deletion_counts_each_machine_once() {
    let harness = ScenarioHarness::new();
    let key = harness.key();
    harness.expectations.expect_creations(&key, 3).unwrap();
    let mut machines = Vec::new();
    for _ in 0..3 {
        machines.push(harness.create(&["fleetctl.io/drain"]).await.unwrap());
    }
    harness
        .wait_until(|| harness.expectations.satisfied_expectations(&key))
        .await;

    machines[1].status.current_status.phase = Some(MachinePhase::Failed);
    sort_machines_for_deletion(&mut machines);
    let victims: Vec<Machine> = machines.into_iter().take(2).collect();
    let uids: Vec<String> = victims
        .iter()
        .filter_map(|m| m.metadata.uid.clone())
        .collect();
    harness.expectations.expect_deletions(&key, &uids).unwrap();
    assert_eq!(harness.counters(), (0, 2));

    for victim in &victims {
        let name = victim.metadata.name_or_default();
        harness
            .control
            .delete_machine(NAMESPACE, name, &harness.parent)
            .await
            .unwrap();
    }
    harness
        .wait_until(|| harness.expectations.satisfied_expectations(&key))
        .await;

    // Finalizers removed: the objects now disappear and are observed again.
    for victim in &victims {
        let name = victim.metadata.name_or_default();
        harness
            .control
            .patch_machine(NAMESPACE, name, br#"{"metadata":{"finalizers":[]}}"#)
            .await
            .unwrap();
    }
    harness.wait_for_machines(1).await;
    assert_eq!(harness.counters(), (0, 0));
    assert_eq!(harness.expectations.get_uids(&key).map(|uids| uids.len()), Some(0));
}
