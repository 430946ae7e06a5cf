//! Announcement and discovery behavior over the in-process store

mod common;

use std::sync::Arc;
use std::time::Duration;

use courier_relay::announce::{Announcer, ServiceCatalog};
use courier_relay::discovery::{DiscoveryClient, DiscoveryConfig, Presence};
use courier_relay::relay::types::{DeviceStatus, ServiceDescriptor, ServiceKind};
use courier_relay::{MemoryStore, RecordKind};
use uuid::Uuid;

fn service(name: &str, port: u16) -> ServiceDescriptor {
    ServiceDescriptor {
        id: Uuid::new_v4(),
        name: name.to_string(),
        kind: ServiceKind::LanguageModel,
        port,
        api_format: "ollama".to_string(),
        is_running: true,
        workflows: None,
    }
}

fn announcer(store: &MemoryStore, device_id: &str, services: Vec<ServiceDescriptor>) -> Announcer {
    Announcer::new(
        Arc::new(store.clone()),
        device_id,
        &format!("name-{device_id}"),
        Arc::new(ServiceCatalog::new(services)),
        Duration::from_secs(30),
    )
}

#[tokio::test]
async fn announced_host_is_discovered_active() {
    let store = MemoryStore::new();
    let host = announcer(&store, "dev-1", vec![service("ollama", 11434)]);
    host.publish_now(DeviceStatus::Active).await.unwrap();

    let discovery = DiscoveryClient::new(Arc::new(store.clone()), DiscoveryConfig::default());
    let devices = discovery.refresh().await.unwrap();

    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].presence, Presence::Active);
    assert_eq!(devices[0].announcement.services.len(), 1);
}

#[tokio::test]
async fn heartbeat_keeps_the_same_record() {
    let store = MemoryStore::new();
    let host = announcer(&store, "dev-1", vec![]);

    host.publish_now(DeviceStatus::Active).await.unwrap();
    host.publish_now(DeviceStatus::Active).await.unwrap();
    host.publish_now(DeviceStatus::Active).await.unwrap();

    // Refreshes update in place; discovery still sees one device
    assert_eq!(store.len(RecordKind::Announcement), 1);
    let discovery = DiscoveryClient::new(Arc::new(store.clone()), DiscoveryConfig::default());
    assert_eq!(discovery.refresh().await.unwrap().len(), 1);
}

#[tokio::test]
async fn shutdown_marker_renders_offline() {
    let store = MemoryStore::new();
    let host = announcer(&store, "dev-1", vec![]);
    host.publish_now(DeviceStatus::Active).await.unwrap();
    host.mark_offline().await;

    let discovery = DiscoveryClient::new(Arc::new(store.clone()), DiscoveryConfig::default());
    let devices = discovery.refresh().await.unwrap();
    assert_eq!(devices[0].presence, Presence::Offline);
}

#[tokio::test]
async fn service_identity_is_stable_across_refreshes() {
    let store = MemoryStore::new();
    let chat = service("chat", 11434);
    let catalog = Arc::new(ServiceCatalog::new(vec![chat.clone()]));
    let host = Announcer::new(
        Arc::new(store.clone()),
        "dev-1",
        "studio",
        Arc::clone(&catalog),
        Duration::from_secs(30),
    );

    host.publish_now(DeviceStatus::Active).await.unwrap();

    // The service set changes around it, but the logical service keeps its id
    let mut renamed = chat.clone();
    renamed.name = "chat-renamed".to_string();
    catalog.set(vec![renamed]);
    host.publish_now(DeviceStatus::Active).await.unwrap();

    let discovery = DiscoveryClient::new(Arc::new(store.clone()), DiscoveryConfig::default());
    let devices = discovery.refresh().await.unwrap();
    let services = &devices[0].announcement.services;
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].id, chat.id);
    assert_eq!(services[0].name, "chat-renamed");
}

#[tokio::test]
async fn discovery_loop_publishes_snapshots() {
    let store = MemoryStore::new();
    announcer(&store, "dev-1", vec![service("ollama", 11434)])
        .publish_now(DeviceStatus::Active)
        .await
        .unwrap();

    let discovery = DiscoveryClient::new(Arc::new(store.clone()), DiscoveryConfig::default());
    let (tx, mut rx) = tokio::sync::watch::channel(Vec::new());
    let loop_task = tokio::spawn(discovery.run(tx));

    // The first poll lands quickly; dropping the task cancels the loop
    rx.changed().await.unwrap();
    let snapshot = rx.borrow().clone();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].presence, Presence::Active);

    loop_task.abort();
}

#[tokio::test]
async fn multiple_hosts_deduplicate_by_device_id() {
    let store = MemoryStore::new();
    announcer(&store, "dev-1", vec![])
        .publish_now(DeviceStatus::Active)
        .await
        .unwrap();
    announcer(&store, "dev-2", vec![])
        .publish_now(DeviceStatus::Active)
        .await
        .unwrap();
    // dev-1 refreshes again; still two distinct devices
    announcer(&store, "dev-1", vec![])
        .publish_now(DeviceStatus::Active)
        .await
        .unwrap();

    let discovery = DiscoveryClient::new(Arc::new(store.clone()), DiscoveryConfig::default());
    assert_eq!(discovery.refresh().await.unwrap().len(), 2);
}
