mod support;

use onerelay_core::SweepError;
use onerelay_provider_core::{ChannelStatus, Event};

use support::{GOOD, REVOKED, Setup, channel, harness};

#[tokio::test]
async fn sweep_restores_recovered_channels() {
    let h = harness(Setup {
        channels: vec![channel("flaky", GOOD, 0), channel("dead", REVOKED, 0)],
        ..Setup::default()
    })
    .await;
    let snapshot = h.storage.load_channel_snapshot().await.unwrap();
    for c in &snapshot.channels {
        h.storage
            .set_channel_status(c.id, ChannelStatus::AutoDisabled)
            .await
            .unwrap();
    }

    let handle = h.tester.test_all_channels(false).unwrap();
    assert!(matches!(
        h.tester.test_all_channels(false),
        Err(SweepError::AlreadyRunning)
    ));
    handle.await.unwrap();
    assert!(!h.tester.is_running());

    let snapshot = h.storage.load_channel_snapshot().await.unwrap();
    let status = |name: &str| {
        snapshot
            .channels
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.status)
            .unwrap()
    };
    assert_eq!(status("flaky"), ChannelStatus::Enabled);
    assert_eq!(status("dead"), ChannelStatus::AutoDisabled);
    assert!(snapshot.channels.iter().all(|c| c.test_time > 0));
    assert_eq!(h.state.channels.load().tier_count("default", "gpt-4o"), 1);
}

#[tokio::test]
async fn manual_disable_is_left_alone() {
    let h = harness(Setup {
        channels: vec![channel("parked", GOOD, 0)],
        ..Setup::default()
    })
    .await;
    let id = h.storage.load_channel_snapshot().await.unwrap().channels[0].id;
    h.storage
        .set_channel_status(id, ChannelStatus::ManuallyDisabled)
        .await
        .unwrap();

    let outcome = h.tester.test_channel(id, None).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.model, "gpt-4o");

    h.tester.test_all_channels(false).unwrap().await.unwrap();
    let stored = h.storage.get_channel(id).await.unwrap().unwrap();
    assert_eq!(stored.status, ChannelStatus::ManuallyDisabled);

    assert_eq!(h.tester.test_channel(id + 100, None).await.unwrap_err().status, 404);
}

#[tokio::test]
async fn status_notifications_are_deduplicated() {
    let h = harness(Setup {
        channels: vec![channel("main", GOOD, 0)],
        ..Setup::default()
    })
    .await;
    let id = h.storage.load_channel_snapshot().await.unwrap().channels[0].id;
    let mut events = h.state.events.subscribe();
    let health = h.engine.health();

    health.disable_channel(id, "main", "first").await.unwrap();
    health.disable_channel(id, "main", "again").await.unwrap();
    health.enable_channel(id, "main", "recovered").await.unwrap();

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let Event::ChannelStatus(change) = event {
            seen.push((change.status, change.reason));
        }
    }
    assert_eq!(
        seen,
        vec![
            (ChannelStatus::AutoDisabled, "first".to_string()),
            (ChannelStatus::Enabled, "recovered".to_string()),
        ]
    );
}
