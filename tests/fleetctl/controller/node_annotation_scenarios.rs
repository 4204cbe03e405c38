use fleetctl::fleetctl::config::BackoffConfig;
use fleetctl::fleetctl::controller::node_annotations::NodeAnnotationUpdater;
use fleetctl::fleetctl::k8s::api::ReadConsistency;
use fleetctl::fleetctl::k8s::node::Node;
use fleetctl::fleetctl::k8s::registry::{ApiVerb, InMemoryApi, InjectedFailure};
use fleetctl::fleetctl::test_support::{env_lock, EnvGuard};
use std::collections::HashMap;
use std::sync::Arc;

const NODE: &str = "worker-0";

struct ScenarioHarness {
    api: Arc<InMemoryApi<Node>>,
}

impl ScenarioHarness {
    async fn with_node(pairs: &[(&str, &str)]) -> Self {
        let api = Arc::new(InMemoryApi::new());
        let mut node = Node::named(NODE);
        node.metadata.annotations = annotations(pairs);
        api.insert("", node).await.unwrap();
        Self { api }
    }

    fn updater(&self, backoff: BackoffConfig) -> NodeAnnotationUpdater {
        NodeAnnotationUpdater::new(self.api.clone(), backoff)
    }

    async fn stored(&self) -> HashMap<String, String> {
        self.api
            .list(None)
            .await
            .into_iter()
            .find(|node| node.metadata.name.as_deref() == Some(NODE))
            .map(|node| node.metadata.annotations)
            .unwrap_or_default()
    }

    fn reads(&self) -> Vec<Option<ReadConsistency>> {
        self.api
            .actions()
            .into_iter()
            .filter(|action| action.verb == ApiVerb::Get)
            .map(|action| action.consistency)
            .collect()
    }
}

fn annotations(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test(start_paused = true)]
async fn scenario_drain_marker_survives_conflicting_writers() {
    let harness = ScenarioHarness::with_node(&[("team", "infra")]).await;
    harness
        .api
        .fail_next(ApiVerb::Update, 2, InjectedFailure::Conflict);

    let updater = harness.updater(BackoffConfig::default());
    updater
        .add_or_update_annotations(NODE, &annotations(&[("fleetctl.io/drain", "true")]))
        .await
        .unwrap();

    assert_eq!(
        harness.reads(),
        vec![
            Some(ReadConsistency::Cached),
            Some(ReadConsistency::Latest),
            Some(ReadConsistency::Latest),
        ]
    );
    assert_eq!(harness.api.count(ApiVerb::Update), 3);
    assert_eq!(
        harness.stored().await,
        annotations(&[("team", "infra"), ("fleetctl.io/drain", "true")])
    );

    updater
        .remove_annotations(NODE, &annotations(&[("fleetctl.io/drain", "")]))
        .await
        .unwrap();
    assert_eq!(harness.stored().await, annotations(&[("team", "infra")]));
}

#[tokio::test(start_paused = true)]
async fn scenario_parallel_updaters_keep_both_annotations() {
    let harness = ScenarioHarness::with_node(&[]).await;
    let first = harness.updater(BackoffConfig::default());
    let second = harness.updater(BackoffConfig::default());

    let a = annotations(&[("zone", "a")]);
    let b = annotations(&[("rack", "7")]);
    let (left, right) = tokio::join!(
        first.add_or_update_annotations(NODE, &a),
        second.add_or_update_annotations(NODE, &b),
    );
    left.unwrap();
    right.unwrap();

    assert_eq!(
        harness.stored().await,
        annotations(&[("zone", "a"), ("rack", "7")])
    );
}

#[tokio::test(start_paused = true)]
async fn scenario_settled_node_sees_no_writes() {
    let harness = ScenarioHarness::with_node(&[("zone", "a")]).await;
    let updater = harness.updater(BackoffConfig::default());

    updater
        .add_or_update_annotations(NODE, &annotations(&[("zone", "a")]))
        .await
        .unwrap();
    updater
        .remove_annotations(NODE, &annotations(&[("absent", "")]))
        .await
        .unwrap();

    assert_eq!(harness.api.write_count(), 0);
    assert_eq!(
        updater.get_annotations(NODE).await.unwrap(),
        Some(annotations(&[("zone", "a")]))
    );
}

#[tokio::test(start_paused = true)]
async fn scenario_departed_node_is_skipped() {
    let harness = ScenarioHarness::with_node(&[]).await;
    let updater = harness.updater(BackoffConfig::default());

    updater
        .add_or_update_annotations("worker-9", &annotations(&[("zone", "a")]))
        .await
        .unwrap();

    assert_eq!(harness.api.write_count(), 0);
    assert_eq!(updater.get_annotations("worker-9").await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn scenario_env_budget_bounds_conflict_retries() {
    let _env = env_lock().lock();
    let _steps = EnvGuard::set("FLEETCTL_ANNOTATION_RETRY_STEPS", "2");
    let _delay = EnvGuard::set("FLEETCTL_ANNOTATION_RETRY_DELAY", "5ms");
    let backoff = BackoffConfig::from_env().unwrap();
    assert_eq!(backoff.steps, 2);

    let harness = ScenarioHarness::with_node(&[]).await;
    harness
        .api
        .fail_next(ApiVerb::Update, 5, InjectedFailure::Conflict);

    let err = harness
        .updater(backoff)
        .add_or_update_annotations(NODE, &annotations(&[("zone", "a")]))
        .await
        .unwrap_err();

    assert!(err.is_conflict());
    assert_eq!(harness.api.count(ApiVerb::Update), 2);
    assert!(harness.stored().await.is_empty());
}
