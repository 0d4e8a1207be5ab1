//! Volume browsing session tests

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use common::{test_state, FakeRuntime, FakeSockets};
use dockpanel::errors::PanelError;
use dockpanel::runtime::{ContainerInfo, ROLE_LABEL, SESSION_LABEL};
use dockpanel::sessions::supervisor::HELPER_ROLE;

fn helper(session: Option<&str>) -> ContainerInfo {
    let mut labels = HashMap::from([(ROLE_LABEL.to_string(), HELPER_ROLE.to_string())]);
    if let Some(session) = session {
        labels.insert(SESSION_LABEL.to_string(), session.to_string());
    }
    ContainerInfo {
        labels,
        running: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_start_requires_existing_volume() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), Arc::new(FakeRuntime::new()), FakeSockets::default()).await;

    let result = state.sessions.start("missing").await;
    assert!(matches!(result, Err(PanelError::NotFound(_))));

    let result = state.sessions.start("../etc").await;
    assert!(matches!(result, Err(PanelError::ValidationError(_))));
}

#[tokio::test]
async fn test_volume_in_use_is_browsed_read_only() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_volume("data");
    let state = test_state(dir.path(), runtime.clone(), FakeSockets::default()).await;

    let first = state.sessions.start("data").await.unwrap();
    assert!(!first.read_only);
    assert_eq!(
        first.url,
        format!("/api/volumes/browse/{}/fb/", first.session_id)
    );

    // the first helper now mounts the volume
    let second = state.sessions.start("data").await.unwrap();
    assert!(second.read_only);
    assert_ne!(first.session_id, second.session_id);

    let session = state.sessions.get(&first.session_id).unwrap();
    let helper = runtime
        .containers()
        .into_iter()
        .find(|c| c.id == session.container_id)
        .unwrap();
    assert_eq!(helper.label(SESSION_LABEL), Some(first.session_id.as_str()));
    assert!(helper.running);
    assert!(session.address.ends_with(":80"));
}

#[tokio::test]
async fn test_idle_session_is_reaped() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_volume("data");
    let state = test_state(dir.path(), runtime.clone(), FakeSockets::default()).await;

    let started = state.sessions.start("data").await.unwrap();
    let container_id = state.sessions.get(&started.session_id).unwrap().container_id;

    let report = state.sessions.reap_once(Utc::now() + Duration::seconds(60)).await;
    assert!(report.expired.is_empty());
    assert!(report.orphans.is_empty());

    let report = state.sessions.reap_once(Utc::now() + Duration::seconds(121)).await;
    assert_eq!(report.expired, vec![started.session_id.clone()]);
    assert!(state.sessions.get(&started.session_id).is_none());
    assert!(runtime.removed().contains(&container_id));

    let heartbeat = state.sessions.heartbeat(&started.session_id);
    assert!(matches!(heartbeat, Err(PanelError::NotFound(_))));
}

#[tokio::test]
async fn test_heartbeat_keeps_session_alive() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_volume("data");
    let state = test_state(dir.path(), runtime.clone(), FakeSockets::default()).await;

    let started = state.sessions.start("data").await.unwrap();
    let before = state.sessions.get(&started.session_id).unwrap().last_seen;

    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    state.sessions.heartbeat(&started.session_id).unwrap();
    let after = state.sessions.get(&started.session_id).unwrap().last_seen;
    assert!(after > before);

    let report = state.sessions.reap_once(after + Duration::seconds(119)).await;
    assert!(report.expired.is_empty());
    assert!(state.sessions.get(&started.session_id).is_some());
}

#[tokio::test]
async fn test_orphan_helpers_are_removed() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_volume("data");
    let state = test_state(dir.path(), runtime.clone(), FakeSockets::default()).await;

    let started = state.sessions.start("data").await.unwrap();
    let live = state.sessions.get(&started.session_id).unwrap().container_id;

    let stale = runtime.add_container(helper(Some("gone")));
    let unlabeled = runtime.add_container(helper(None));
    // claims the live session but is not its container
    let impostor = runtime.add_container(helper(Some(&started.session_id)));

    let mut report = state.sessions.reap_once(Utc::now()).await;
    report.orphans.sort();
    let mut expected = vec![stale, unlabeled, impostor];
    expected.sort();
    assert_eq!(report.orphans, expected);
    assert!(report.expired.is_empty());
    assert!(runtime.containers().iter().any(|c| c.id == live));
}

#[tokio::test]
async fn test_close_removes_helper() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_volume("data");
    let state = test_state(dir.path(), runtime.clone(), FakeSockets::default()).await;

    let started = state.sessions.start("data").await.unwrap();
    let container_id = state.sessions.get(&started.session_id).unwrap().container_id;

    state.sessions.close(&started.session_id).await.unwrap();
    assert!(runtime.removed().contains(&container_id));
    assert!(state.sessions.sessions().is_empty());

    let again = state.sessions.close(&started.session_id).await;
    assert!(matches!(again, Err(PanelError::NotFound(_))));
}

#[tokio::test]
async fn test_unreachable_helper_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime {
        no_address: true,
        ..Default::default()
    });
    runtime.add_volume("data");
    let state = test_state(dir.path(), runtime.clone(), FakeSockets::default()).await;

    let result = state.sessions.start("data").await;
    assert!(matches!(result, Err(PanelError::SessionError(_))));

    assert_eq!(runtime.removed().len(), 1);
    assert!(runtime.helpers().is_empty());
    assert!(state.sessions.sessions().is_empty());

    let report = state.sessions.reap_once(Utc::now()).await;
    assert!(report.orphans.is_empty());
}

#[tokio::test]
async fn test_cancelled_start_leaves_no_helper_behind() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime {
        start_hangs: true,
        ..Default::default()
    });
    runtime.add_volume("data");
    let state = test_state(dir.path(), runtime.clone(), FakeSockets::default()).await;

    let started =
        tokio::time::timeout(std::time::Duration::from_millis(50), state.sessions.start("data"))
            .await;
    assert!(started.is_err());
    assert_eq!(runtime.helpers().len(), 1);

    // still within the TTL the helper counts as starting
    let report = state.sessions.reap_once(Utc::now()).await;
    assert!(report.orphans.is_empty());
    assert_eq!(runtime.helpers().len(), 1);

    let report = state.sessions.reap_once(Utc::now() + Duration::days(1)).await;
    assert_eq!(report.orphans.len(), 1);
    assert!(runtime.helpers().is_empty());
    assert!(state.sessions.sessions().is_empty());
}
