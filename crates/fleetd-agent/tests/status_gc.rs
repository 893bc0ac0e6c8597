//! Status garbage collection: stale upstream records are deleted exactly
//! once, records still in the bundle are left alone.

mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::{wait_until, ApiCall, FakeApiClient};
use fleetd_agent::status_gc::StatusGarbageCollector;
use fleetd_core::models::{
    Application, ApplicationStatusRecord, Bundle, Release, Service, ServiceStateRecord,
    ServiceStatusRecord,
};
use tokio::sync::watch;

fn bundle_with_records() -> Bundle {
    let mut services = BTreeMap::new();
    services.insert("s1".to_string(), Service::default());

    Bundle {
        applications: vec![Application {
            id: "app1".to_string(),
            latest_release: Release {
                id: "r1".to_string(),
                services,
            },
        }],
        application_statuses: vec![
            ApplicationStatusRecord {
                application_id: "app1".to_string(),
                current_release_id: "r1".to_string(),
            },
            ApplicationStatusRecord {
                application_id: "gone-app".to_string(),
                current_release_id: "r9".to_string(),
            },
        ],
        service_statuses: vec![
            ServiceStatusRecord {
                application_id: "app1".to_string(),
                service: "s1".to_string(),
                current_release_id: "r1".to_string(),
            },
            ServiceStatusRecord {
                application_id: "app1".to_string(),
                service: "gone-service".to_string(),
                current_release_id: "r1".to_string(),
            },
        ],
        service_states: vec![ServiceStateRecord {
            application_id: "gone-app".to_string(),
            service: "s1".to_string(),
            ..ServiceStateRecord::default()
        }],
        ..Bundle::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_stale_records_deleted_exactly_once() {
    let client = Arc::new(FakeApiClient::default());
    let gc = Arc::new(StatusGarbageCollector::new(client.clone()));
    gc.set_bundle(&bundle_with_records());

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(gc.clone().run(stop_rx));

    wait_until("stale records deleted", || {
        let calls = client.calls();
        calls.contains(&ApiCall::DeleteApplicationStatus {
            application: "gone-app".to_string(),
        }) && calls.contains(&ApiCall::DeleteServiceStatus {
            application: "app1".to_string(),
            service: "gone-service".to_string(),
        }) && calls.contains(&ApiCall::DeleteServiceState {
            application: "gone-app".to_string(),
            service: "s1".to_string(),
        })
    })
    .await;

    // Records still referenced by the bundle are never deleted.
    assert!(!client.calls().contains(&ApiCall::DeleteApplicationStatus {
        application: "app1".to_string()
    }));
    assert!(!client.calls().contains(&ApiCall::DeleteServiceStatus {
        application: "app1".to_string(),
        service: "s1".to_string()
    }));

    // Successful deletes are not re-issued on later ticks.
    let before = client.calls().len();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(client.calls().len(), before);

    let _ = stop_tx.send(true);
    let _ = task.await;
}

#[tokio::test(start_paused = true)]
async fn test_new_bundle_recomputes_stale_set() {
    let client = Arc::new(FakeApiClient::default());
    let gc = Arc::new(StatusGarbageCollector::new(client.clone()));

    let (stop_tx, stop_rx) = watch::channel(false);
    let task = tokio::spawn(gc.clone().run(stop_rx));

    // First bundle: nothing stale.
    let mut bundle = bundle_with_records();
    bundle.application_statuses.retain(|r| r.application_id == "app1");
    bundle.service_statuses.retain(|r| r.service == "s1");
    bundle.service_states.clear();
    gc.set_bundle(&bundle);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(client.calls().is_empty());

    // Second bundle drops app1: its records become stale.
    let mut without_app = bundle.clone();
    without_app.applications.clear();
    gc.set_bundle(&without_app);

    wait_until("records of dropped application deleted", || {
        client.calls().contains(&ApiCall::DeleteApplicationStatus {
            application: "app1".to_string(),
        })
    })
    .await;

    let _ = stop_tx.send(true);
    let _ = task.await;
}
