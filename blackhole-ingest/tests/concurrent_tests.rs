//! Concurrency tests
//!
//! Single writer per take id, parallel progress across take ids, and the
//! Busy/Timeout contract while a finalize is in flight.

mod helpers;

use blackhole_common::db::TakeStatus;
use helpers::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

#[tokio::test]
async fn test_concurrent_open_same_take_exactly_one_wins() {
    let h = harness(fast_settings()).await;
    let sessions = Arc::clone(&h.engine.sessions);

    let a = {
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move { sessions.open_take(open_request("take07", "24")).await })
    };
    let b = {
        let sessions = Arc::clone(&sessions);
        tokio::spawn(async move { sessions.open_take(open_request("take07", "24")).await })
    };

    let (a, b) = tokio::time::timeout(Duration::from_secs(5), async { tokio::join!(a, b) })
        .await
        .expect("opens did not finish in time");
    let results = [a.unwrap(), b.unwrap()];

    let winners = results.iter().filter(|r| r.is_ok()).count();
    let conflicts: Vec<_> = results
        .iter()
        .filter_map(|r| r.as_ref().err())
        .filter(|e| e.kind() == "LOCK_CONFLICT")
        .collect();
    assert_eq!(winners, 1);
    assert_eq!(conflicts.len(), 1);
    assert!(conflicts[0].retryable());
    assert_eq!(sessions.lock_table().held_ids(), vec!["take07".to_string()]);
}

#[tokio::test]
async fn test_open_conflicts_until_holder_finishes() {
    let h = harness(fast_settings()).await;
    let sessions = &h.engine.sessions;

    let handle = sessions.open_take(open_request("take07", "24")).await.unwrap();
    let err = sessions.open_take(open_request("take07", "24")).await.unwrap_err();
    assert_eq!(err.kind(), "LOCK_CONFLICT");

    sessions
        .append_samples(&handle, batch("take07", frame_samples("cam-a", 0..10, 0.0)))
        .await
        .unwrap();
    sessions.finalize_take(&handle, None).await.unwrap();

    // Lease released on commit
    sessions.open_take(open_request("take07", "24")).await.unwrap();
}

#[tokio::test]
async fn test_expired_lease_is_superseded() {
    let settings = blackhole_common::config::IngestSettings {
        lock_lease_ttl_ms: 50,
        ..fast_settings()
    };
    let h = harness(settings).await;
    let sessions = &h.engine.sessions;

    let stale = sessions.open_take(open_request("take07", "24")).await.unwrap();
    sessions
        .append_samples(&stale, batch("take07", frame_samples("cam-a", 0..10, 0.0)))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;

    let fresh = sessions.open_take(open_request("take07", "24")).await.unwrap();
    assert_ne!(fresh.session_id, stale.session_id);

    // The superseded holder can no longer write
    let err = sessions
        .append_samples(&stale, batch("take07", frame_samples("cam-a", 10..20, 0.0)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "NOT_FOUND");

    // Nothing from the superseded session survives
    let outcome = sessions
        .append_samples(&fresh, batch("take07", frame_samples("cam-a", 0..3, 0.0)))
        .await
        .unwrap();
    assert_eq!(outcome.total_samples, 3);
}

#[tokio::test]
async fn test_parallel_takes_all_commit() {
    let h = harness(fast_settings()).await;
    let mut set = JoinSet::new();

    for i in 0..8 {
        let sessions = Arc::clone(&h.engine.sessions);
        set.spawn(async move {
            let take_id = format!("parallel_{:02}", i);
            let handle = sessions.open_take(open_request(&take_id, "24")).await?;
            for chunk in 0..4i64 {
                let frames = chunk * 25..(chunk + 1) * 25;
                sessions
                    .append_samples(&handle, batch(&take_id, frame_samples("cam-a", frames, i as f64)))
                    .await?;
            }
            sessions.finalize_take(&handle, None).await
        });
    }

    let mut committed = Vec::new();
    while let Some(result) = set.join_next().await {
        committed.push(result.unwrap().unwrap());
    }
    assert_eq!(committed.len(), 8);
    assert!(committed.iter().all(|c| c.sample_count == 100));

    let rows = h.repo.scan(Some(TakeStatus::Committed)).await.unwrap();
    assert_eq!(rows.len(), 8);
    for c in &committed {
        assert!(c.file_path.exists());
    }
}

#[tokio::test]
async fn test_busy_while_finalizing_then_committed() {
    let h = harness(fast_settings()).await;
    let sessions = Arc::clone(&h.engine.sessions);
    h.repo.delay_upserts(Duration::from_millis(300));

    let handle = sessions.open_take(open_request("slow_take", "24")).await.unwrap();
    sessions
        .append_samples(&handle, batch("slow_take", frame_samples("cam-a", 0..10, 0.0)))
        .await
        .unwrap();

    let finalize = {
        let sessions = Arc::clone(&sessions);
        let handle = handle.clone();
        tokio::spawn(async move { sessions.finalize_take(&handle, None).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = sessions
        .append_samples(&handle, batch("slow_take", frame_samples("cam-a", [10], 0.0)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "BUSY");
    assert!(err.retryable());

    let err = sessions.finalize_take(&handle, None).await.unwrap_err();
    assert_eq!(err.kind(), "BUSY");
    assert_eq!(sessions.status("slow_take").await.unwrap().status, TakeStatus::Finalizing);

    let committed = finalize.await.unwrap().unwrap();
    assert_eq!(committed.sample_count, 10);
}

#[tokio::test]
async fn test_finalize_deadline_elapses_commit_continues() {
    let h = harness(fast_settings()).await;
    let sessions = &h.engine.sessions;
    h.repo.delay_upserts(Duration::from_millis(300));

    let handle = sessions.open_take(open_request("deadline_take", "24")).await.unwrap();
    sessions
        .append_samples(&handle, batch("deadline_take", frame_samples("cam-a", 0..10, 0.0)))
        .await
        .unwrap();

    let err = sessions
        .finalize_take(&handle, Some(Duration::from_millis(20)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "TIMEOUT");

    let mut status = sessions.status("deadline_take").await.unwrap();
    for _ in 0..100 {
        if status.status == TakeStatus::Committed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = sessions.status("deadline_take").await.unwrap();
    }
    assert_eq!(status.status, TakeStatus::Committed);

    let row = h.repo.get("deadline_take").await.unwrap().unwrap();
    assert_eq!(row.status, TakeStatus::Committed);
    assert_eq!(Some(row.checksum), status.checksum);
}
