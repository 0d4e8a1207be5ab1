//! Port query and allocation tests

mod common;

use std::sync::Arc;

use common::{test_state, FakeRuntime, FakeSockets};
use dockpanel::errors::PanelError;
use dockpanel::ports::query::PortQueryParams;
use dockpanel::ports::usage::ListeningSocket;
use dockpanel::ports::Protocol;
use dockpanel::runtime::{ContainerInfo, PublishedPort};
use openapi_server::models::{AllocateRequest, PortRange};

/// nginx listens on 55500, a container publishes 55502
fn fixtures() -> (Arc<FakeRuntime>, FakeSockets) {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.add_container(ContainerInfo {
        name: "cache".to_string(),
        running: true,
        ports: vec![PublishedPort {
            host_ip: "0.0.0.0".to_string(),
            host_port: 55502,
            container_port: 6379,
            protocol: "tcp".to_string(),
        }],
        ..Default::default()
    });
    let sockets = FakeSockets {
        sockets: vec![ListeningSocket {
            protocol: Protocol::Tcp,
            port: 55500,
            process: "nginx".to_string(),
        }],
    };
    (runtime, sockets)
}

fn alloc_request(counts: Vec<i64>, dry_run: bool) -> AllocateRequest {
    AllocateRequest {
        counts,
        use_alloc_range: true,
        dry_run,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_query_merges_usage_sources() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, sockets) = fixtures();
    let state = test_state(dir.path(), runtime, sockets).await;

    let response = state
        .ports
        .query(PortQueryParams {
            start: Some(55500),
            end: Some(55505),
            protocol: Some("tcp".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();

    assert_eq!(response.used, 2);
    assert_eq!(response.available, 4);
    let summary: Vec<(u16, u16, &str, &str)> = response
        .items
        .iter()
        .map(|r| (r.port, r.end_port, r.port_type.as_str(), r.service.as_str()))
        .collect();
    assert_eq!(
        summary,
        vec![
            (55500, 55500, "Host", "nginx"),
            (55501, 55501, "", ""),
            (55502, 55502, "Container", "cache"),
            (55503, 55505, "", ""),
        ]
    );
}

#[tokio::test]
async fn test_note_shows_on_record() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, sockets) = fixtures();
    let state = test_state(dir.path(), runtime, sockets).await;

    state.ports.set_note(55500, "Host", "tcp", "reverse proxy").unwrap();
    let response = state
        .ports
        .query(PortQueryParams {
            port: Some(55500),
            start: Some(55000),
            end: Some(56000),
            protocol: Some("tcp".to_string()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(response.items.len(), 1);
    assert_eq!(response.items[0].note, "reverse proxy");
}

#[tokio::test]
async fn test_allocate_skips_used_and_reserved_ports() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, sockets) = fixtures();
    let state = test_state(dir.path(), runtime, sockets).await;

    let dry = state.ports.allocate(alloc_request(vec![2], true)).await.unwrap();
    assert_eq!(dry.segments, vec![vec![55503, 55504]]);
    assert!(state.ledger.reservations().unwrap().is_empty());

    let allocated = state
        .ports
        .allocate(alloc_request(vec![1, 2], false))
        .await
        .unwrap();
    assert_eq!(allocated.segments, vec![vec![55501], vec![55503, 55504]]);
    assert_eq!(allocated.reserved_by, "deploy");
    assert_eq!(allocated.protocol, "TCP");
    assert_eq!(allocated.port_type, "Host");

    let reserved: Vec<u16> = state
        .ledger
        .reservations()
        .unwrap()
        .iter()
        .map(|r| r.port)
        .collect();
    assert_eq!(reserved, vec![55501, 55503, 55504]);

    let next = state.ports.allocate(alloc_request(vec![1], false)).await.unwrap();
    assert_eq!(next.segments, vec![vec![55505]]);
}

#[tokio::test]
async fn test_allocate_rejects_impossible_requests() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, sockets) = fixtures();
    let state = test_state(dir.path(), runtime, sockets).await;

    let too_many = state.ports.allocate(alloc_request(vec![600], false)).await;
    assert!(matches!(too_many, Err(PanelError::Conflict(_))));

    let zero = state.ports.allocate(alloc_request(vec![0], false)).await;
    assert!(matches!(zero, Err(PanelError::ValidationError(_))));

    assert!(state.ledger.reservations().unwrap().is_empty());
}

#[tokio::test]
async fn test_scan_range_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, sockets) = fixtures();
    let state = test_state(dir.path(), runtime, sockets).await;

    let stored = state
        .ports
        .set_range(PortRange {
            start: 1000,
            end: 2000,
            protocol: "tcp".to_string(),
        })
        .unwrap();
    assert_eq!(stored.protocol, "TCP");
    assert_eq!(state.ports.range().unwrap(), stored);

    let invalid = state.ports.set_range(PortRange {
        start: 10,
        end: 5,
        protocol: String::new(),
    });
    assert!(matches!(invalid, Err(PanelError::ValidationError(_))));
}
