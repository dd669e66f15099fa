//! Service and device agent talking through an in-process broker.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use extiot_core::{
    DeviceIdentity, DeviceKey, DeviceProfile, Envelope, MessageType, QoS, SnowflakeGenerator,
    TopicScheme,
};
use extiot_devices::{
    DeviceAgent, DeviceService, MemoryBroker, Presence, ScheduleState, SchedulerConfig,
    SimulatedSensor, Transport,
};
use extiot_storage::{MemoryDeviceStore, RedbDeviceStore};

fn profile() -> DeviceProfile {
    DeviceProfile {
        product_type: "thermo".into(),
        product_id: "P1".into(),
        serial_number: "SN001".into(),
        mac: "00:11:22:33:44:55".into(),
    }
}

#[tokio::test]
async fn test_device_registers_and_receives_config() {
    let dir = tempfile::tempdir().unwrap();
    let broker = MemoryBroker::new();
    let shutdown = CancellationToken::new();

    let (server_transport, server_rx) = broker.connect(64);
    let service = Arc::new(
        DeviceService::builder()
            .transport(server_transport)
            .store(Arc::new(
                RedbDeviceStore::open(dir.path().join("devices.redb")).unwrap(),
            ))
            .generator(Arc::new(SnowflakeGenerator::new(7).unwrap()))
            .build()
            .unwrap(),
    );
    // Subscribe before the device announces so the Register is not lost.
    service.subscribe().await.unwrap();
    let server = tokio::spawn({
        let router = service.router().clone();
        let shutdown = shutdown.clone();
        async move { router.run(server_rx, shutdown).await }
    });

    let (device_transport, device_rx) = broker.connect(64);
    let agent = Arc::new(DeviceAgent::new(
        profile(),
        device_transport,
        Arc::new(SimulatedSensor::default()),
        TopicScheme::default(),
        SchedulerConfig::default(),
    ));
    let mut identity = agent.identity_watch();
    let mut updates = agent.config_updates();
    let device = tokio::spawn(agent.clone().run(device_rx, shutdown.clone()));

    timeout(Duration::from_secs(5), identity.wait_for(|id| id.is_some()))
        .await
        .expect("device was never acknowledged")
        .unwrap();
    let key = DeviceKey::new("P1", "SN001");
    let record = service.registry().lookup(&key).await.unwrap().unwrap();
    assert_eq!(agent.identity(), Some(record.device_id));
    assert_eq!(record.product_type, "thermo");
    assert!(service
        .router()
        .presence(&key)
        .map(|p| p.is_online())
        .unwrap_or(false));

    // The ack's empty config arrives first.
    let ack_config = timeout(Duration::from_secs(5), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(ack_config.is_empty());

    service
        .push_config(&key, json!({"interval": 30}).as_object().cloned().unwrap())
        .await
        .unwrap();
    let pushed = timeout(Duration::from_secs(5), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(pushed.get("interval"), Some(&json!(30)));
    assert_eq!(
        agent.schedule_state(),
        ScheduleState::Running {
            interval: Duration::from_secs(30)
        }
    );

    // Shutting down sends a Disconnect before the router stops.
    shutdown.cancel();
    timeout(Duration::from_secs(5), device)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    let stats = timeout(Duration::from_secs(5), server).await.unwrap().unwrap();
    assert_eq!(stats.failed, 0);
    assert!(stats.handled >= 1);
}

#[tokio::test]
async fn test_reregister_after_store_loss() {
    let broker = MemoryBroker::new();
    let shutdown = CancellationToken::new();

    // The device believes it is registered, but this server has never seen it.
    let (server_transport, server_rx) = broker.connect(64);
    let service = DeviceService::builder()
        .transport(server_transport)
        .store(Arc::new(MemoryDeviceStore::new()))
        .generator(Arc::new(SnowflakeGenerator::new(2).unwrap()))
        .build()
        .unwrap();
    service.subscribe().await.unwrap();
    let router = service.router().clone();
    let server = tokio::spawn(router.clone().run(server_rx, shutdown.clone()));

    let (device_transport, mut device_rx) = broker.connect(64);
    let key = DeviceKey::new("P1", "SN001");
    let topics = TopicScheme::default();
    device_transport
        .subscribe(&topics.config(&key), QoS::AtLeastOnce)
        .await
        .unwrap();
    let status =
        Envelope::new(MessageType::Status, &key).with_device_id(DeviceIdentity::new(12345));
    device_transport
        .publish(&topics.data(&key), QoS::AtMostOnce, status.encode())
        .await
        .unwrap();

    let prompt = timeout(Duration::from_secs(5), device_rx.recv())
        .await
        .unwrap()
        .unwrap();
    let prompt = Envelope::decode(&prompt.payload).unwrap();
    assert_eq!(prompt.message_type, MessageType::Config);
    assert_eq!(prompt.payload.get("reregister"), Some(&json!(true)));
    assert!(!matches!(router.presence(&key), Some(Presence::Online { .. })));

    shutdown.cancel();
    let stats = server.await.unwrap();
    assert_eq!(stats.failed, 1);
}
