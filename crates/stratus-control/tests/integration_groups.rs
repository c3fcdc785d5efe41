//! Integration tests for instance groups.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use stratus_control::{
    ControlError, InstanceGroup, InstanceService, InstanceState, LaunchConfig,
    MemoryInstanceService, StatePoller, StratusConfig, ThrottleGuard,
};
use stratus_remote::Credential;

fn group(service: &Arc<MemoryInstanceService>) -> InstanceGroup {
    InstanceGroup::new(
        service.clone(),
        Arc::new(ThrottleGuard::unthrottled()),
        StatePoller::new(Duration::from_secs(1)),
    )
}

#[tokio::test(start_paused = true)]
async fn started_group_exposes_hosts_in_launch_order() {
    let service = Arc::new(MemoryInstanceService::new());
    let mut workers = group(&service);

    workers
        .start(&LaunchConfig::new("workers", "img-1", 3), Duration::from_secs(30))
        .await
        .unwrap();

    assert_eq!(workers.name(), Some("workers"));
    assert!(workers
        .members()
        .iter()
        .all(|m| m.state == InstanceState::Running));

    let hosts = workers
        .hosts("ops", &Credential::KeyFile(PathBuf::from("/keys/ops.pem")))
        .unwrap();
    let addresses: Vec<&str> = hosts.iter().map(|h| h.address.as_str()).collect();
    assert_eq!(addresses, vec!["10.0.0.10", "10.0.0.11", "10.0.0.12"]);
    assert!(hosts.iter().all(|h| h.user == "ops"));
}

#[tokio::test(start_paused = true)]
async fn connect_adopts_existing_group() {
    let service = Arc::new(MemoryInstanceService::new());
    let mut launched = group(&service);
    launched
        .start(&LaunchConfig::new("workers", "img-1", 2), Duration::from_secs(30))
        .await
        .unwrap();

    let mut adopted = group(&service);
    adopted.connect("workers").await.unwrap();

    assert_eq!(adopted.members(), launched.members());
}

#[tokio::test(start_paused = true)]
async fn group_spanning_launches_is_ambiguous() {
    let service = Arc::new(MemoryInstanceService::new());
    service
        .run_instances(&LaunchConfig::new("workers", "img-1", 1))
        .await
        .unwrap();
    service
        .run_instances(&LaunchConfig::new("workers", "img-1", 1))
        .await
        .unwrap();

    let err = group(&service).connect("workers").await.unwrap_err();

    assert!(matches!(err, ControlError::AmbiguousName { ref matches, .. } if matches.len() == 2));
}

#[tokio::test(start_paused = true)]
async fn connect_to_missing_group_fails() {
    let service = Arc::new(MemoryInstanceService::new());
    let err = group(&service).connect("nobody").await.unwrap_err();
    assert!(matches!(err, ControlError::ClusterNotFound(_)));
}

#[tokio::test(start_paused = true)]
async fn terminate_waits_until_gone() {
    let service = Arc::new(MemoryInstanceService::new());
    let mut workers = group(&service);
    workers
        .start(&LaunchConfig::new("workers", "img-1", 2), Duration::from_secs(30))
        .await
        .unwrap();
    let ids: Vec<_> = workers.members().iter().map(|m| m.id.clone()).collect();

    workers.terminate(Duration::from_secs(30)).await.unwrap();

    assert!(workers.members().is_empty());
    for id in &ids {
        assert_eq!(service.state_of(id), Some(InstanceState::Terminated));
    }
    assert!(service.find_by_group("workers").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn shutdown_uses_configured_timings() {
    let mut config = StratusConfig::default();
    config.poller.poll_interval_secs = 2;
    config.poller.terminate_timeout_secs = 45;
    let service = Arc::new(MemoryInstanceService::new());
    let mut workers = InstanceGroup::from_config(service.clone(), &config);
    assert_eq!(workers.terminate_timeout(), Duration::from_secs(45));

    workers
        .start(&LaunchConfig::new("workers", "img-1", 1), Duration::from_secs(30))
        .await
        .unwrap();
    let id = workers.members()[0].id.clone();

    let before = tokio::time::Instant::now();
    workers.shutdown().await.unwrap();

    assert_eq!(before.elapsed(), Duration::from_secs(2));
    assert!(workers.members().is_empty());
    assert_eq!(service.state_of(&id), Some(InstanceState::Terminated));
}

#[test]
fn default_group_uses_default_terminate_timeout() {
    let workers = group(&Arc::new(MemoryInstanceService::new()));
    assert_eq!(workers.terminate_timeout(), Duration::from_secs(120));
}

#[tokio::test(start_paused = true)]
async fn stop_keeps_members() {
    let service = Arc::new(MemoryInstanceService::new());
    let mut workers = group(&service);
    workers
        .start(&LaunchConfig::new("workers", "img-1", 1), Duration::from_secs(30))
        .await
        .unwrap();

    workers.stop().await.unwrap();

    let id = &workers.members()[0].id;
    assert_eq!(service.state_of(id), Some(InstanceState::Stopping));
    assert!(matches!(
        workers.start(&LaunchConfig::new("workers", "img-1", 1), Duration::from_secs(30)).await,
        Err(ControlError::InvalidStateTransition { .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn slow_instances_time_out() {
    let service = Arc::new(MemoryInstanceService::with_running_after(100));
    let mut workers = group(&service);

    let err = workers
        .start(&LaunchConfig::new("workers", "img-1", 1), Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(err, ControlError::TransitionTimeout { .. }));
    assert!(workers.members().is_empty());
}
