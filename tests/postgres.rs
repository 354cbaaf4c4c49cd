//! Runs against a real database only when `RELAYMQ_TEST_DATABASE_URL` is set.

use std::{collections::HashSet, str::FromStr, sync::Arc, time::Duration};

use bytes::Bytes;
use chrono::TimeDelta;
use relaymq::{
    bus::{EventBus, PgDriver},
    clock::{Clock, SystemClock},
    db::{PgStore, Store},
    error::Error,
    lifecycle::Status,
    message::ArchivedMessage,
    service::{AckItem, CreateMessage, CreateTask, Service, Sweep},
};
use sqlx::postgres::PgConnectOptions;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

async fn setup() -> Option<(Arc<Service>, PgStore, CancellationToken)> {
    let url = std::env::var("RELAYMQ_TEST_DATABASE_URL").ok()?;

    let store = PgStore::connect(PgConnectOptions::from_str(&url).unwrap(), 20)
        .await
        .unwrap();
    store.migrate().await.unwrap();

    let cancel = CancellationToken::new();
    let bus = Arc::new(EventBus::new(PgDriver::new(store.pool().clone())));

    tokio::spawn({
        let bus = bus.clone();
        let cancel = cancel.clone();
        async move { bus.run(cancel).await }
    });

    let service = Service::builder()
        .store(Arc::new(store.clone()))
        .bus(bus)
        .shutdown(cancel.clone())
        .build();

    tokio::time::sleep(Duration::from_millis(200)).await;

    Some((Arc::new(service), store, cancel))
}

/// A kind no other test run touches.
fn unique_kind() -> String {
    format!("test.k{}", Uuid::now_v7().simple())
}

#[tokio::test]
async fn test_skip_locked_claims_are_disjoint() {
    let Some((service, _, cancel)) = setup().await else {
        return;
    };
    let kind = unique_kind();

    for _ in 0..60 {
        service
            .create_task(CreateTask {
                kind: kind.clone(),
                payload: Bytes::from_static(b"{}"),
                priority: None,
                auto_confirm: true,
                start_at: None,
            })
            .await
            .unwrap();
    }

    let workers = (0..6)
        .map(|_| {
            let service = service.clone();
            let kinds = vec![kind.clone()];
            tokio::spawn(async move {
                let mut claimed = Vec::new();
                loop {
                    let batch = service.take_work(&kinds, 4, Duration::ZERO).await.unwrap();
                    if batch.is_empty() {
                        break claimed;
                    }
                    claimed.extend(batch.iter().map(|task| task.id()));
                }
            })
        })
        .collect::<Vec<_>>();

    let mut seen = HashSet::new();
    for worker in workers {
        for id in worker.await.unwrap() {
            assert!(seen.insert(id), "task {id} claimed twice");
        }
    }

    assert_eq!(seen.len(), 60);
    cancel.cancel();
}

#[tokio::test]
async fn test_notification_wakes_long_poll() {
    let Some((service, _, cancel)) = setup().await else {
        return;
    };
    let queue = unique_kind();

    let waiter = {
        let service = service.clone();
        let queue = queue.clone();
        tokio::spawn(async move { service.consume(&queue, 1, Duration::from_secs(30)).await })
    };

    tokio::time::sleep(Duration::from_millis(100)).await;

    let id = service
        .create_message(CreateMessage {
            queue,
            payload: Bytes::from_static(b"ping"),
            priority: None,
            auto_confirm: true,
            start_at: None,
            hold: false,
        })
        .await
        .unwrap();

    let claimed = tokio::time::timeout(Duration::from_secs(2), waiter)
        .await
        .expect("notification arrived")
        .unwrap()
        .unwrap();

    assert_eq!(claimed[0].id(), id);
    cancel.cancel();
}

#[tokio::test]
async fn test_ack_archives_and_history_survives() {
    let Some((service, _, cancel)) = setup().await else {
        return;
    };
    let queue = unique_kind();
    let destination = format!("{queue}.next");

    let id = service
        .create_message(CreateMessage {
            queue: queue.clone(),
            payload: Bytes::from_static(b"body"),
            priority: Some(5),
            auto_confirm: true,
            start_at: None,
            hold: false,
        })
        .await
        .unwrap();

    service.consume(&queue, 1, Duration::ZERO).await.unwrap();
    service
        .redirect(vec![relaymq::service::RedirectItem {
            id,
            destination: destination.clone(),
        }])
        .await
        .unwrap();

    let claimed = service.consume(&destination, 1, Duration::ZERO).await.unwrap();
    assert_eq!(claimed[0].history().len(), 1);

    service
        .ack(vec![AckItem {
            id,
            release: Vec::new(),
        }])
        .await
        .unwrap();

    let view = service.check_messages(&[id]).await.unwrap().remove(0);
    assert!(view.archived);
    assert_eq!(view.status, "delivered");
    assert_eq!(view.history[0].queue, queue);

    // The sweep has nothing to do for this message any more.
    service.archive_messages(Sweep::default()).await.unwrap();

    let task = service
        .create_task(CreateTask {
            kind: unique_kind(),
            payload: Bytes::from_static(b"x"),
            priority: None,
            auto_confirm: false,
            start_at: None,
        })
        .await
        .unwrap();
    assert_eq!(service.check_task(task).await.unwrap().status, Status::Created);

    cancel.cancel();
}

#[tokio::test]
async fn test_ack_loses_to_a_concurrent_change() {
    let Some((service, store, cancel)) = setup().await else {
        return;
    };
    let queue = unique_kind();
    let clock = SystemClock;

    let id = service
        .create_message(CreateMessage {
            queue: queue.clone(),
            payload: Bytes::from_static(b"contended"),
            priority: None,
            auto_confirm: true,
            start_at: None,
            hold: false,
        })
        .await
        .unwrap();
    service.consume(&queue, 1, Duration::ZERO).await.unwrap();

    let mut acking = store.begin().await.unwrap();
    let mut stale = acking.get_message(id).await.unwrap();

    let mut delaying = store.begin().await.unwrap();
    let mut current = delaying.get_message(id).await.unwrap();
    current
        .delay(&clock, clock.now() + TimeDelta::minutes(5))
        .unwrap();
    delaying.save_message(&mut current).await.unwrap();
    delaying.commit().await.unwrap();

    stale.complete(&clock).unwrap();
    acking
        .upsert_archived_message(&ArchivedMessage::try_from(&stale).unwrap())
        .await
        .unwrap();
    assert!(matches!(
        acking.delete_message(&stale).await,
        Err(Error::StaleVersion { entity: "message", .. })
    ));
    drop(acking);

    let view = service.check_messages(&[id]).await.unwrap().remove(0);
    assert!(!view.archived);
    assert_eq!(view.status, "delayed");

    cancel.cancel();
}
