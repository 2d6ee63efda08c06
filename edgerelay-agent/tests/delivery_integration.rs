//! Store-and-forward behaviour of the delivery orchestrator

mod common;

use common::{buffer, log, reading, splitter, RecordingPublisher, Switch, COLUMNS};
use edgerelay_agent::{DeliveryOrchestrator, DeliveryState};
use edgerelay_core::splitter::encoded_len;
use edgerelay_core::DEFAULT_BATCH_CEILING;
use edgerelay_store::{LocalBuffer, StorageError};

fn orchestrator(
    publisher: &RecordingPublisher,
    network: &Switch,
    ceiling: usize,
) -> DeliveryOrchestrator<RecordingPublisher, Switch> {
    DeliveryOrchestrator::new(
        publisher.clone(),
        network.clone(),
        buffer(),
        splitter(ceiling),
        log().scoped("delivery"),
    )
}

#[tokio::test]
async fn starts_online_and_sends_directly() {
    let publisher = RecordingPublisher::accepting();
    let network = Switch::new(true);
    let mut delivery = orchestrator(&publisher, &network, DEFAULT_BATCH_CEILING);
    assert_eq!(delivery.state(), DeliveryState::Online);

    let state = delivery.save(reading(1)).await.unwrap();

    assert_eq!(state, DeliveryState::Online);
    assert_eq!(publisher.batches(), vec![vec![reading(1)]]);
    assert_eq!(delivery.pending().unwrap(), 0);
}

#[tokio::test]
async fn unreachable_network_buffers_without_sending() {
    let publisher = RecordingPublisher::accepting();
    let network = Switch::new(false);
    let mut delivery = orchestrator(&publisher, &network, DEFAULT_BATCH_CEILING);

    for n in 1..=3 {
        let state = delivery.save(reading(n)).await.unwrap();
        assert_eq!(state, DeliveryState::OfflinePending);
    }

    assert!(publisher.batches().is_empty());
    assert_eq!(delivery.pending().unwrap(), 3);
}

#[tokio::test]
async fn failed_direct_send_buffers_reading() {
    let publisher = RecordingPublisher::rejecting();
    let network = Switch::new(true);
    let mut delivery = orchestrator(&publisher, &network, DEFAULT_BATCH_CEILING);

    let state = delivery.save(reading(1)).await.unwrap();

    assert_eq!(state, DeliveryState::OfflinePending);
    assert_eq!(publisher.batches().len(), 1);
    assert_eq!(delivery.pending().unwrap(), 1);
}

#[tokio::test]
async fn recovery_drains_backlog_before_newest() {
    let publisher = RecordingPublisher::accepting();
    let network = Switch::new(false);
    let mut delivery = orchestrator(&publisher, &network, DEFAULT_BATCH_CEILING);

    for n in 1..=3 {
        delivery.save(reading(n)).await.unwrap();
    }
    network.set(true);
    let state = delivery.save(reading(4)).await.unwrap();

    assert_eq!(state, DeliveryState::Online);
    assert_eq!(
        publisher.batches(),
        vec![vec![reading(1), reading(2), reading(3), reading(4)]]
    );
    assert_eq!(delivery.pending().unwrap(), 0);
}

#[tokio::test]
async fn failed_drain_keeps_backlog_and_adds_newest() {
    let publisher = RecordingPublisher::rejecting();
    let network = Switch::new(false);
    let mut delivery = orchestrator(&publisher, &network, DEFAULT_BATCH_CEILING);

    for n in 1..=3 {
        delivery.save(reading(n)).await.unwrap();
    }
    network.set(true);
    let state = delivery.save(reading(4)).await.unwrap();

    assert_eq!(state, DeliveryState::OfflinePending);
    assert_eq!(delivery.pending().unwrap(), 4);
    assert_eq!(
        delivery.buffered().unwrap(),
        vec![reading(1), reading(2), reading(3), reading(4)]
    );
    assert_eq!(publisher.batches().len(), 1);
}

#[tokio::test]
async fn unreadable_backlog_still_buffers_newest() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("buffer.db");
    let buffer = LocalBuffer::open(&path, "test-device", &COLUMNS, log().scoped("buffer")).unwrap();

    let publisher = RecordingPublisher::accepting();
    let network = Switch::new(false);
    let mut delivery = DeliveryOrchestrator::new(
        publisher.clone(),
        network.clone(),
        buffer,
        splitter(DEFAULT_BATCH_CEILING),
        log().scoped("delivery"),
    );
    delivery.save(reading(1)).await.unwrap();

    let tamper = rusqlite::Connection::open(&path).unwrap();
    tamper
        .execute("UPDATE \"readings_test_device\" SET time = 'garbage'", [])
        .unwrap();
    drop(tamper);

    network.set(true);
    let result = delivery.save(reading(2)).await;

    assert!(matches!(result, Err(StorageError::CorruptRow { .. })), "{result:?}");
    assert_eq!(delivery.state(), DeliveryState::OfflinePending);
    assert_eq!(delivery.pending().unwrap(), 2);
    assert!(publisher.batches().is_empty());
}

#[tokio::test]
async fn drain_is_chunked_in_order() {
    let readings: Vec<_> = (1..=6).map(reading).collect();
    // room for two readings per chunk
    let ceiling = encoded_len(&readings[..2]);

    let publisher = RecordingPublisher::accepting();
    let network = Switch::new(false);
    let mut delivery = orchestrator(&publisher, &network, ceiling);

    for r in &readings[..5] {
        delivery.save(r.clone()).await.unwrap();
    }
    network.set(true);
    let state = delivery.save(readings[5].clone()).await.unwrap();

    assert_eq!(state, DeliveryState::Online);
    let batches = publisher.batches();
    assert!(batches.len() > 1);
    for batch in &batches {
        assert!(encoded_len(batch) <= ceiling);
    }
    assert_eq!(publisher.flattened(), readings);
    assert_eq!(delivery.pending().unwrap(), 0);
}

#[tokio::test]
async fn first_rejected_chunk_stops_the_drain() {
    let readings: Vec<_> = (1..=6).map(reading).collect();
    let ceiling = encoded_len(&readings[..2]);

    // first chunk goes through, second is rejected
    let publisher = RecordingPublisher::scripted(&[true, false], true);
    let network = Switch::new(false);
    let mut delivery = orchestrator(&publisher, &network, ceiling);

    for r in &readings[..5] {
        delivery.save(r.clone()).await.unwrap();
    }
    network.set(true);
    let state = delivery.save(readings[5].clone()).await.unwrap();

    assert_eq!(state, DeliveryState::OfflinePending);
    assert_eq!(publisher.batches().len(), 2);
    assert_eq!(delivery.pending().unwrap(), 6);

    // next window drains everything, including the chunk that already got through
    let state = delivery.save(reading(7)).await.unwrap();
    assert_eq!(state, DeliveryState::Online);
    assert_eq!(delivery.pending().unwrap(), 0);

    let resent: Vec<_> = publisher.batches()[2..].concat();
    let mut expected = readings.clone();
    expected.push(reading(7));
    assert_eq!(resent, expected);
}

#[tokio::test]
async fn network_drop_after_recovery_buffers_again() {
    let publisher = RecordingPublisher::accepting();
    let network = Switch::new(true);
    let mut delivery = orchestrator(&publisher, &network, DEFAULT_BATCH_CEILING);

    assert_eq!(delivery.save(reading(1)).await.unwrap(), DeliveryState::Online);
    network.set(false);
    assert_eq!(delivery.save(reading(2)).await.unwrap(), DeliveryState::OfflinePending);
    network.set(true);
    assert_eq!(delivery.save(reading(3)).await.unwrap(), DeliveryState::Online);

    assert_eq!(
        publisher.batches(),
        vec![vec![reading(1)], vec![reading(2), reading(3)]]
    );
}
