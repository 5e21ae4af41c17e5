use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use tailview::application::demo::DemoBackend;
use tailview::application::session::{self, SessionConfig, ViewSnapshot};
use tailview::config::DemoSettings;
use tailview::domain::types::{ConnectionStatus, SortDirection, SortField, SortKey, WorkloadKind};
use tailview::infra::subscription::SubscriptionOptions;
use tailview::presentation;
use tokio::sync::watch;

fn demo_settings() -> DemoSettings {
    DemoSettings {
        pods: NonZeroU32::new(12).expect("non-zero"),
        containers_per_pod: NonZeroU32::new(2).expect("non-zero"),
        tick: Duration::from_millis(500),
    }
}

fn config(kinds: Vec<WorkloadKind>, offload_sort: bool) -> SessionConfig {
    SessionConfig {
        namespace: String::new(),
        kinds,
        sort: SortKey::Recency,
        flush_interval: Duration::from_secs(2),
        row_limit: None,
        offload_sort,
        subscription: SubscriptionOptions::default(),
    }
}

async fn wait_for(
    snapshots: &mut watch::Receiver<ViewSnapshot>,
    predicate: impl Fn(&ViewSnapshot) -> bool,
) -> ViewSnapshot {
    snapshots
        .wait_for(|snapshot| predicate(snapshot))
        .await
        .expect("session alive")
        .clone()
}

fn total(snapshot: &ViewSnapshot) -> u64 {
    snapshot.rows.iter().map(|row| row.total_size).sum()
}

#[tokio::test(start_paused = true)]
async fn demo_feed_grows_every_namespace() {
    let backend = Arc::new(DemoBackend::seeded(&demo_settings(), 7).expect("demo backend"));
    let session = session::spawn(backend.clone(), config(vec![WorkloadKind::Pod], false));
    let mut snapshots = session.snapshots();

    let loaded = wait_for(&mut snapshots, |s| !s.loading && s.rows.len() == 12).await;
    let seeded = total(&loaded);
    wait_for(&mut snapshots, |s| s.status == ConnectionStatus::Connected).await;

    tokio::time::sleep(Duration::from_secs(5)).await;
    let grown = session.latest();
    assert_eq!(grown.rows.len(), 12);
    assert!(total(&grown) > seeded);
    assert!(grown.rows.iter().any(|row| row.last_event.is_some()));
    assert_eq!(backend.connects(), 1);

    session.shutdown().await.expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn namespace_switch_restarts_the_feed() {
    let backend = Arc::new(DemoBackend::seeded(&demo_settings(), 11).expect("demo backend"));
    let session = session::spawn(backend.clone(), config(Vec::new(), false));
    let mut snapshots = session.snapshots();

    // 3 deployments, 3 replica sets and 12 pods.
    wait_for(&mut snapshots, |s| !s.loading && s.rows.len() == 18).await;
    wait_for(&mut snapshots, |s| s.status == ConnectionStatus::Connected).await;

    session.set_namespace("payments");
    let switched = wait_for(&mut snapshots, |s| s.generation == 2 && !s.loading).await;
    assert_eq!(switched.namespace, "payments");
    assert_eq!(switched.rows.len(), 6);
    assert!(switched.rows.iter().all(|row| row.namespace == "payments"));

    wait_for(&mut snapshots, |s| s.status == ConnectionStatus::Connected).await;
    assert_eq!(backend.connects(), 2);

    // A deployment carries the sum of its pods.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let latest = session.latest();
    let deployment = latest
        .rows
        .iter()
        .find(|row| row.kind == WorkloadKind::Deployment)
        .expect("deployment row");
    let pods: u64 = latest
        .rows
        .iter()
        .filter(|row| row.kind == WorkloadKind::Pod)
        .map(|row| row.total_size)
        .sum();
    assert_eq!(deployment.total_size, pods);

    session.shutdown().await.expect("clean shutdown");
}

#[tokio::test(start_paused = true)]
async fn offloaded_sort_matches_inline_order() {
    let size_desc = SortKey::Field {
        field: SortField::Size,
        direction: SortDirection::Desc,
    };
    let backend = Arc::new(DemoBackend::seeded(&demo_settings(), 3).expect("demo backend"));
    let session = session::spawn(backend, config(vec![WorkloadKind::Pod], true));
    let mut snapshots = session.snapshots();
    wait_for(&mut snapshots, |s| !s.loading && s.rows.len() == 12).await;

    session.set_sort(size_desc);
    tokio::time::sleep(Duration::from_secs(5)).await;
    let sorted = session.latest();
    assert_eq!(sorted.sort, size_desc);
    let sizes: Vec<u64> = sorted.rows.iter().map(|row| row.total_size).collect();
    let mut expected = sizes.clone();
    expected.sort_unstable_by(|a, b| b.cmp(a));
    assert_eq!(sizes, expected);

    let rendered = presentation::render(&sorted);
    assert!(rendered.starts_with("[connected] namespace=all sort=size:desc rows=12/12"));

    session.shutdown().await.expect("clean shutdown");
}
