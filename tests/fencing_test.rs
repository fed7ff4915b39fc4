// Fencing tests: the node health watcher driving the controller's fencing
// against mocked backends and in-memory Node and AlcubVolume stores.

use alcub_csi::backend::{DeviceBackend, ImageBackend, ImageRef};
use alcub_csi::config::Config;
use alcub_csi::controller::ControllerService;
use alcub_csi::crd::{AlcubVolume, AlcubVolumeSpec, AlcubVolumeStatus};
use alcub_csi::health::{FENCE_ENTITY_ANNOTATION, FENCED_AT_ANNOTATION, NodeHealthWatcher, UNREACHABLE_TAINT};
use alcub_csi::store::MemoryStore;
use alcub_csi::volume::VolumeRegistry;
use alcub_csi::{Error, Result};
use k8s_openapi::api::core::v1::{Node, NodeSpec, Taint};
use kube::ResourceExt;
use kube::api::ObjectMeta;
use mockall::mock;
use mockall::predicate::eq;
use std::collections::BTreeMap;
use std::sync::Arc;

mock! {
    pub Devices {}

    #[async_trait::async_trait]
    impl DeviceBackend for Devices {
        async fn connect(&self, node: &str, pool: &str, image: &str) -> Result<String>;
        async fn disconnect(&self, node: &str, pool: &str, image: &str) -> Result<()>;
        async fn image_clean(&self, node: &str, pool: &str, image: &str) -> Result<bool>;
        async fn peer_urls(&self, node: &str) -> Result<Vec<String>>;
        async fn node_url(&self, node: &str) -> Result<String>;
        async fn fail_node(&self, url: &str, node: &str) -> Result<()>;
        async fn dev_stop(&self, url: &str, pool: &str, image: &str) -> Result<()>;
    }
}

mock! {
    pub Images {}

    #[async_trait::async_trait]
    impl ImageBackend for Images {
        async fn create_image(&self, storage_class: &str, name: &str, bytes: i64) -> Result<ImageRef>;
        async fn delete_image(&self, storage_class: &str, image: &str) -> Result<()>;
        async fn add_fence(&self, entity: &str) -> Result<()>;
        async fn remove_fence(&self, entity: &str) -> Result<()>;
    }
}

const PEER: &str = "http://10.0.0.9:8080";
const OWN: &str = "http://10.0.0.5:8080";

fn volume(name: &str, node: &str, prev_node: &str, peers: &[&str]) -> AlcubVolume {
    let mut record = AlcubVolume::with_spec(
        name,
        AlcubVolumeSpec {
            uuid: format!("uuid-{}", name),
            capacity: 1 << 30,
            storage_class: "fast-rbd".to_string(),
            pool: "rbd".to_string(),
            image: name.to_string(),
        },
    );
    record.status = Some(AlcubVolumeStatus {
        node: node.to_string(),
        prev_node: prev_node.to_string(),
        device_path: "/dev/alcub0".to_string(),
        storage_ip: "10.0.0.5".to_string(),
        peer_nodes: peers.iter().map(|p| p.to_string()).collect(),
    });
    record
}

fn node(name: &str, labels: &[(&str, &str)], unreachable: bool) -> Node {
    let labels: BTreeMap<String, String> =
        labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    let taints = unreachable.then(|| {
        vec![Taint { key: UNREACHABLE_TAINT.to_string(), effect: "NoExecute".to_string(), ..Default::default() }]
    });
    Node {
        metadata: ObjectMeta { name: Some(name.to_string()), labels: Some(labels), ..Default::default() },
        spec: Some(NodeSpec { taints, ..Default::default() }),
        ..Default::default()
    }
}

async fn controller(
    records: Vec<AlcubVolume>,
    images: MockImages,
    devices: MockDevices,
) -> Arc<ControllerService> {
    let registry = Arc::new(VolumeRegistry::new(Arc::new(MemoryStore::with_objects(records))));
    registry.warm().await.unwrap();
    Arc::new(ControllerService::new(registry, Arc::new(images), Arc::new(devices)))
}

#[tokio::test]
async fn test_unreachable_node_in_maintenance_is_fenced_once() {
    let mut images = MockImages::new();
    images.expect_add_fence().with(eq("10.0.0.5:0/0")).times(1).returning(|_| Ok(()));
    let mut devices = MockDevices::new();
    devices.expect_fail_node().with(eq(PEER), eq("w1")).times(2).returning(|_, _| Ok(()));
    let controller = controller(vec![volume("pvc-a", "w1", "", &[PEER, OWN])], images, devices).await;

    let observed = node("w1", &[("alcubierre-w1", "enable"), ("alcub.csi.io/maintenance", "true")], true);
    let nodes = Arc::new(MemoryStore::with_objects([observed.clone()]));
    let labels = Config::default().health_labels().unwrap();
    let watcher = NodeHealthWatcher::new(nodes.clone(), controller, labels);

    watcher.reconcile(&observed).await.unwrap();
    let fenced = nodes.snapshot("w1").unwrap();
    assert_eq!(fenced.labels().get("csi-alcub-maintain").map(String::as_str), Some("true"));
    assert_eq!(fenced.labels().get("csi-alcub").map(String::as_str), Some("enable"));
    assert!(fenced.annotations().contains_key(FENCED_AT_ANNOTATION));
    assert_eq!(fenced.annotations().get(FENCE_ENTITY_ANNOTATION).map(String::as_str), Some("10.0.0.5:0/0"));

    // A stale event repeats node_fail but never re-applies the blacklist.
    watcher.reconcile(&observed).await.unwrap();

    // Once the marker is visible nothing further happens.
    watcher.reconcile(&fenced).await.unwrap();
}

#[tokio::test]
async fn test_unreachable_node_without_maintenance_is_left_alone() {
    let controller = controller(Vec::new(), MockImages::new(), MockDevices::new()).await;
    let observed = node("w1", &[("alcubierre-w1", "enable"), ("csi-alcub", "enable")], true);
    let nodes = Arc::new(MemoryStore::with_objects([observed.clone()]));
    let watcher = NodeHealthWatcher::new(nodes.clone(), controller, Config::default().health_labels().unwrap());

    watcher.reconcile(&observed).await.unwrap();
    assert!(!nodes.snapshot("w1").unwrap().labels().contains_key("csi-alcub-maintain"));
}

#[tokio::test]
async fn test_ha_managed_node_is_not_blacklisted() {
    let mut devices = MockDevices::new();
    devices.expect_fail_node().times(1).returning(|_, _| Ok(()));
    let mut images = MockImages::new();
    images.expect_add_fence().never();
    let controller = controller(vec![volume("pvc-a", "w1", "", &[PEER])], images, devices).await;

    let mut config = Config::default();
    config.labels.ha_managed = Some("ha.example.com/managed=true".to_string());
    let observed = node(
        "w1",
        &[("alcub.csi.io/maintenance", "true"), ("ha.example.com/managed", "true")],
        true,
    );
    let nodes = Arc::new(MemoryStore::with_objects([observed.clone()]));
    let watcher = NodeHealthWatcher::new(nodes.clone(), controller, config.health_labels().unwrap());

    watcher.reconcile(&observed).await.unwrap();
    assert!(nodes.snapshot("w1").unwrap().labels().contains_key("csi-alcub-maintain"));
}

#[tokio::test]
async fn test_failed_fencing_is_retried_without_marker() {
    let mut images = MockImages::new();
    images.expect_add_fence().times(1).returning(|_| Ok(()));
    let mut devices = MockDevices::new();
    devices
        .expect_fail_node()
        .returning(|url, _| Err(Error::Backend(format!("{} unreachable", url))));
    let controller = controller(vec![volume("pvc-a", "w1", "", &[PEER, OWN])], images, devices).await;

    let observed = node("w1", &[("alcub.csi.io/maintenance", "true")], true);
    let nodes = Arc::new(MemoryStore::with_objects([observed.clone()]));
    let watcher = NodeHealthWatcher::new(nodes.clone(), controller, Config::default().health_labels().unwrap());

    let err = watcher.reconcile(&observed).await.unwrap_err();
    assert!(matches!(err, Error::Backend(ref msg) if msg.contains(PEER) && msg.contains(OWN)));
    assert!(!nodes.snapshot("w1").unwrap().labels().contains_key("csi-alcub-maintain"));
}

#[tokio::test]
async fn test_recovered_node_is_unfenced_and_devices_reset() {
    let mut images = MockImages::new();
    images.expect_remove_fence().with(eq("10.0.0.5:0/0")).times(1).returning(|_| Ok(()));
    let mut devices = MockDevices::new();
    devices.expect_node_url().with(eq("w1")).returning(|_| Ok(OWN.to_string()));
    devices.expect_dev_stop().with(eq(OWN), eq("rbd"), eq("pvc-a")).times(1).returning(|_, _, _| Ok(()));
    devices.expect_dev_stop().with(eq(OWN), eq("rbd"), eq("pvc-b")).times(1).returning(|_, _, _| Ok(()));
    let records = vec![
        volume("pvc-a", "w1", "", &[PEER, OWN]),
        // Taken over by w2 while w1 was fenced.
        volume("pvc-b", "w2", "w1", &[PEER, OWN]),
        // Held by w1 but served by another cluster.
        volume("pvc-c", "w1", "", &[PEER]),
    ];
    let controller = controller(records, images, devices).await;

    let observed = node("w1", &[("alcubierre-w1", "enable"), ("csi-alcub-maintain", "true")], false);
    let mut fenced = observed.clone();
    fenced.annotations_mut().insert(FENCED_AT_ANNOTATION.to_string(), "2026-01-01T00:00:00Z".to_string());
    let nodes = Arc::new(MemoryStore::with_objects([fenced.clone()]));
    let watcher = NodeHealthWatcher::new(nodes.clone(), controller, Config::default().health_labels().unwrap());

    watcher.reconcile(&fenced).await.unwrap();
    let recovered = nodes.snapshot("w1").unwrap();
    assert!(!recovered.labels().contains_key("csi-alcub-maintain"));
    assert!(!recovered.annotations().contains_key(FENCED_AT_ANNOTATION));
    assert_eq!(recovered.labels().get("csi-alcub").map(String::as_str), Some("enable"));
}

#[tokio::test]
async fn test_recovery_after_restart_uses_recorded_entity() {
    // Every volume moved to w2 while w1 was fenced; the controller then restarted.
    let mut images = MockImages::new();
    images.expect_remove_fence().with(eq("10.0.0.7:0/0")).times(1).returning(|_| Ok(()));
    let mut devices = MockDevices::new();
    devices.expect_node_url().with(eq("w1")).returning(|_| Ok(OWN.to_string()));
    devices.expect_dev_stop().with(eq(OWN), eq("rbd"), eq("pvc-b")).times(1).returning(|_, _, _| Ok(()));
    let controller = controller(vec![volume("pvc-b", "w2", "w1", &[PEER, OWN])], images, devices).await;

    let mut fenced = node("w1", &[("csi-alcub-maintain", "true")], false);
    fenced.annotations_mut().insert(FENCE_ENTITY_ANNOTATION.to_string(), "10.0.0.7:0/0".to_string());
    let nodes = Arc::new(MemoryStore::with_objects([fenced.clone()]));
    let watcher = NodeHealthWatcher::new(nodes.clone(), controller, Config::default().health_labels().unwrap());

    watcher.reconcile(&fenced).await.unwrap();
    let recovered = nodes.snapshot("w1").unwrap();
    assert!(!recovered.labels().contains_key("csi-alcub-maintain"));
    assert!(!recovered.annotations().contains_key(FENCE_ENTITY_ANNOTATION));
}
