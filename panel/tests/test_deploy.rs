//! Deployment pipeline tests

mod common;

use std::sync::Arc;

use chrono::Utc;
use common::{test_state, FakeRuntime, FakeSockets};
use dockpanel::app::state::AppState;
use dockpanel::errors::PanelError;
use dockpanel::jobs::{JobStatus, LogKind};
use dockpanel::ports::PortReservation;
use openapi_client::models::{DeploymentParameter, Template};
use openapi_server::models::DeployRequest;

const COMPOSE: &str = "services:\n  app:\n    image: traefik/whoami\n    ports:\n      - \"80:80\"\n";

fn template() -> Template {
    Template {
        name: "whoami".to_string(),
        compose: COMPOSE.to_string(),
        ..Default::default()
    }
}

fn port_param(host: &str, container: &str) -> DeploymentParameter {
    DeploymentParameter {
        name: host.to_string(),
        default: container.to_string(),
        service_name: "app".to_string(),
        param_type: "port".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_failed_deploy_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime {
        compose_fails: true,
        ..Default::default()
    });
    let state = test_state(dir.path(), runtime.clone(), FakeSockets::default()).await;
    state.templates.save(&template()).await.unwrap();

    let job = state
        .deployer
        .deploy_template("whoami", DeployRequest::default())
        .await
        .unwrap();
    job.wait().await;

    let snapshot = job.snapshot();
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert!(!snapshot.error.is_empty());
    assert!(snapshot.logs.iter().any(|l| l.kind == LogKind::Error));
    assert!(!state.deployer.project_dir("whoami").exists().await);
    assert!(runtime.project_containers("whoami").is_empty());
}

#[tokio::test]
async fn test_deploy_reserves_and_remove_releases_ports() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime {
        compose_ports: vec![18080],
        compose_output: vec!["Container whoami-app-1  Created".to_string()],
        ..Default::default()
    });
    let state = test_state(dir.path(), runtime.clone(), FakeSockets::default()).await;
    state.templates.save(&template()).await.unwrap();

    let request = DeployRequest {
        config: vec![port_param("18080", "80")],
        ..Default::default()
    };
    let job = state.deployer.deploy_template("whoami", request).await.unwrap();
    job.wait().await;

    let snapshot = job.snapshot();
    assert_eq!(snapshot.status, JobStatus::Success, "{:?}", snapshot.logs);
    assert_eq!(snapshot.result.unwrap()["app_id"], "whoami");
    assert!(snapshot
        .logs
        .iter()
        .any(|l| l.kind == LogKind::Success && l.message.contains("Created")));

    let project_dir = state.deployer.project_dir("whoami");
    let manifest = project_dir
        .file("docker-compose.yml")
        .read_string()
        .await
        .unwrap();
    assert!(manifest.contains("18080:80"));

    let reservations = state.ledger.reservations().unwrap();
    assert_eq!(reservations.len(), 1);
    assert_eq!(reservations[0].port, 18080);
    assert_eq!(reservations[0].reserved_by, "whoami/whoami-app-1");

    // a second deployment under the same name is refused up front
    let again = state
        .deployer
        .deploy_template("whoami", DeployRequest::default())
        .await;
    assert!(matches!(again, Err(PanelError::Conflict(_))));

    let removal = state.deployer.remove_project("whoami").await.unwrap();
    removal.wait().await;
    assert_eq!(removal.status(), JobStatus::Success);
    assert!(state.ledger.reservations().unwrap().is_empty());
    assert!(!project_dir.exists().await);
    assert!(runtime.project_containers("whoami").is_empty());
}

#[tokio::test]
async fn test_redeploy_uses_recorded_template() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime::new());
    let state = test_state(dir.path(), runtime.clone(), FakeSockets::default()).await;
    state.templates.save(&template()).await.unwrap();

    let request = DeployRequest {
        project_name: "My App".to_string(),
        ..Default::default()
    };
    let job = state.deployer.deploy_template("whoami", request).await.unwrap();
    job.wait().await;
    assert_eq!(job.status(), JobStatus::Success);

    let redeploy = state
        .deployer
        .redeploy("myapp", DeployRequest::default())
        .await
        .unwrap();
    redeploy.wait().await;
    assert_eq!(redeploy.kind(), "redeploy");
    assert_eq!(redeploy.status(), JobStatus::Success);
    assert!(state.deployer.project_dir("myapp").exists().await);
}

#[tokio::test]
async fn test_unknown_project_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), Arc::new(FakeRuntime::new()), FakeSockets::default()).await;

    let redeploy = state.deployer.redeploy("ghost", DeployRequest::default()).await;
    assert!(matches!(redeploy, Err(PanelError::NotFound(_))));

    let removal = state.deployer.remove_project("../etc").await;
    assert!(matches!(removal, Err(PanelError::ValidationError(_))));
}

#[tokio::test]
async fn test_missing_template_fails_job() {
    let dir = tempfile::tempdir().unwrap();
    let state = test_state(dir.path(), Arc::new(FakeRuntime::new()), FakeSockets::default()).await;

    let job = state
        .deployer
        .deploy_template("nope", DeployRequest::default())
        .await
        .unwrap();
    job.wait().await;
    assert_eq!(job.status(), JobStatus::Failed);
    assert!(!state.deployer.project_dir("nope").exists().await);
}

fn reservation_owners(state: &AppState) -> Vec<(u16, String)> {
    state
        .ledger
        .reservations()
        .unwrap()
        .into_iter()
        .map(|r| (r.port, r.reserved_by))
        .collect()
}

#[tokio::test]
async fn test_deploy_keeps_ports_reserved_elsewhere() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime {
        compose_ports: vec![18080, 18081],
        ..Default::default()
    });
    let state = test_state(dir.path(), runtime.clone(), FakeSockets::default()).await;
    state.templates.save(&template()).await.unwrap();

    // handed out earlier by the allocator
    state
        .ledger
        .reserve(&[PortReservation {
            port: 18080,
            reserved_by: "deploy".to_string(),
            protocol: "TCP".to_string(),
            port_type: "Host".to_string(),
            reserved_at: Utc::now(),
        }])
        .unwrap();
    assert_eq!(reservation_owners(&state), vec![(18080, "deploy".to_string())]);

    let request = DeployRequest {
        config: vec![port_param("18080", "80"), port_param("18081", "81")],
        ..Default::default()
    };
    let job = state.deployer.deploy_template("whoami", request).await.unwrap();
    job.wait().await;

    let snapshot = job.snapshot();
    assert_eq!(snapshot.status, JobStatus::Success, "{:?}", snapshot.logs);
    assert!(snapshot
        .logs
        .iter()
        .any(|l| l.kind == LogKind::Warning && l.message.contains("18080")));
    assert_eq!(
        reservation_owners(&state),
        vec![
            (18080, "deploy".to_string()),
            (18081, "whoami/whoami-app-1".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_reservation_failure_only_warns() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = Arc::new(FakeRuntime {
        compose_ports: vec![18080],
        ..Default::default()
    });
    let state = test_state(dir.path(), runtime.clone(), FakeSockets::default()).await;
    state.templates.save(&template()).await.unwrap();

    let conn = rusqlite::Connection::open(dir.path().join("panel.db")).unwrap();
    conn.execute_batch(
        "CREATE TRIGGER refuse_reservations BEFORE INSERT ON port_reservations
         BEGIN SELECT RAISE(ABORT, 'reservations are read-only'); END;",
    )
    .unwrap();

    let request = DeployRequest {
        config: vec![port_param("18080", "80")],
        ..Default::default()
    };
    let job = state.deployer.deploy_template("whoami", request).await.unwrap();
    job.wait().await;

    let snapshot = job.snapshot();
    assert_eq!(snapshot.status, JobStatus::Success, "{:?}", snapshot.logs);
    assert_eq!(snapshot.result.unwrap()["app_id"], "whoami");
    assert!(snapshot
        .logs
        .iter()
        .any(|l| l.kind == LogKind::Warning && l.message.starts_with("Ports were not reserved")));
    assert!(state.ledger.reservations().unwrap().is_empty());
    assert!(state.deployer.project_dir("whoami").exists().await);
}
