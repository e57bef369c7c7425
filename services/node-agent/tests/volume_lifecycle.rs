//! Integration tests for volume reconciliation.

use std::sync::Arc;

use corral_events::{
    Event, EventData, InstanceRef, Volume, VolumeData, VolumeFields, VolumeStoragePoolMap,
};
use corral_node_agent::progress::RecordingProgress;
use corral_node_agent::{Config, Dispatcher, MockRuntime};
use rstest::rstest;
use serde_json::json;
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    runtime: Arc<MockRuntime>,
    dispatcher: Dispatcher,
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(Config::for_state_dir(dir.path()));
    let runtime = Arc::new(MockRuntime::new());
    let dispatcher = Dispatcher::new(config, runtime.clone(), None).unwrap();
    Harness {
        dir,
        runtime,
        dispatcher,
    }
}

fn volume_event(name: &str, volume: Volume) -> Event {
    Event::new(name)
        .with_reply_to("reply-channel")
        .with_data(EventData {
            volume_storage_pool_map: Some(VolumeStoragePoolMap {
                volume,
                storage_pool: None,
            }),
            ..Default::default()
        })
}

fn managed(name: &str) -> Volume {
    Volume {
        uuid: format!("{}-uuid", name),
        name: Some(name.to_string()),
        device_number: 1,
        driver: Some("local".to_string()),
        ..Default::default()
    }
}

fn host_path() -> Volume {
    Volume {
        uuid: "host-path".to_string(),
        device_number: 1,
        uri: Some("file:///srv/shared".to_string()),
        data: VolumeData {
            fields: VolumeFields { is_host_path: true },
        },
        ..Default::default()
    }
}

fn unmanaged() -> Volume {
    Volume {
        uuid: "unmanaged".to_string(),
        device_number: 1,
        uri: Some("file:///var/lib/docker/vfs/dir/unmanaged".to_string()),
        ..Default::default()
    }
}

fn container_bound() -> Volume {
    Volume {
        uuid: "root".to_string(),
        device_number: 0,
        instance: Some(InstanceRef {
            uuid: "web-1".to_string(),
        }),
        ..Default::default()
    }
}

#[rstest]
#[case::managed(managed("gone"))]
#[case::host_path(host_path())]
#[case::unmanaged(unmanaged())]
#[case::container_bound(container_bound())]
#[tokio::test]
async fn test_remove_already_removed(#[case] volume: Volume) {
    let h = harness();
    let volumes = h.dispatcher.volumes();

    assert!(volumes.is_removed(&volume).await.unwrap());
    let reply = h
        .dispatcher
        .dispatch(&volume_event("storage.volume.remove", volume.clone()), &RecordingProgress::new())
        .await
        .unwrap();

    assert!(!reply.is_error(), "{:?}", reply.transitioning_message);
    assert_eq!(
        reply.data,
        json!({"volumeStoragePoolMap": {"volume": {"format": "docker"}}})
    );
    assert!(volumes.is_removed(&volume).await.unwrap());
}

#[tokio::test]
async fn test_remove_existing_of_every_kind() {
    let h = harness();
    let volumes = h.dispatcher.volumes();

    h.runtime.add_volume("data", "local");
    h.runtime.add_container("web-1", "busybox", false);
    let unmanaged_dir = h.dir.path().join("docker/vfs/dir/unmanaged");
    std::fs::create_dir_all(&unmanaged_dir).unwrap();

    for volume in [managed("data"), host_path(), unmanaged(), container_bound()] {
        let reply = h
            .dispatcher
            .dispatch(&volume_event("storage.volume.remove", volume.clone()), &RecordingProgress::new())
            .await
            .unwrap();
        assert!(!reply.is_error(), "{:?}", reply.transitioning_message);
        assert!(volumes.is_removed(&volume).await.unwrap(), "{}", volume.uuid);
    }

    assert!(h.runtime.volume("data").is_none());
    assert!(h.runtime.container("/web-1").is_none());
    assert!(!unmanaged_dir.exists());
}

#[tokio::test]
async fn test_volume_in_use_is_orphaned() {
    let h = harness();
    h.runtime.add_volume("busy", "local");
    h.runtime.mark_volume_in_use("busy");

    let reply = h
        .dispatcher
        .dispatch(&volume_event("storage.volume.remove", managed("busy")), &RecordingProgress::new())
        .await
        .unwrap();

    assert!(!reply.is_error());
    assert_eq!(h.runtime.calls().remove_volume, 1);
    assert!(h.runtime.volume("busy").is_some());
}

#[tokio::test]
async fn test_moved_volume_recreated() {
    let h = harness();
    h.runtime.add_volume("data", "local");
    h.runtime.mark_volume_moved("data");

    let volume = managed("data");
    assert!(!h.dispatcher.volumes().is_active(&volume).await.unwrap());

    let reply = h
        .dispatcher
        .dispatch(&volume_event("storage.volume.activate", volume.clone()), &RecordingProgress::new())
        .await
        .unwrap();

    assert!(!reply.is_error());
    let calls = h.runtime.calls();
    assert_eq!(calls.remove_volume, 1);
    assert_eq!(calls.create_volume, 1);
    assert_ne!(h.runtime.volume("data").unwrap().mountpoint, "moved");
    assert!(h.dispatcher.volumes().is_active(&volume).await.unwrap());
}

#[tokio::test]
async fn test_deactivate_is_noop() {
    let h = harness();
    h.runtime.add_volume("data", "local");

    let reply = h
        .dispatcher
        .dispatch(&volume_event("storage.volume.deactivate", managed("data")), &RecordingProgress::new())
        .await
        .unwrap();

    assert!(!reply.is_error());
    assert!(h.runtime.volume("data").is_some());
    assert_eq!(h.runtime.calls().remove_volume, 0);
}
