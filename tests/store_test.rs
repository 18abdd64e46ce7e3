//! Store-level invariants: the transition matrix, audit durability, and
//! port-range boundaries.

use taskd::error::TaskdError;
use taskd::store::status::{transition_allowed, ALL_STATUSES};
use taskd::store::{NewTask, Status, Store};

async fn scratch_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Store::open(dir.path()).await.unwrap();
    (dir, store)
}

async fn task_in_status(store: &Store, status: Status) -> i64 {
    let id = store
        .create_task(NewTask {
            title: format!("fixture {status}"),
            ..Default::default()
        })
        .await
        .unwrap()
        .task
        .id;
    // Force the fixture state directly; the matrix below exercises the
    // validated path.
    sqlx::query("UPDATE tasks SET status = ?, started_at = ?, completed_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind((status != Status::Backlog).then(|| "2026-01-01T00:00:00Z"))
        .bind(status.is_terminal().then(|| "2026-01-01T00:00:00Z"))
        .bind(id)
        .execute(store.pool())
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn update_status_agrees_with_the_transition_table() {
    let (_dir, store) = scratch_store().await;
    for from in ALL_STATUSES {
        for to in ALL_STATUSES {
            let id = task_in_status(&store, from).await;
            let result = store.update_status(id, to).await;
            if transition_allowed(from, to) {
                assert!(
                    result.is_ok(),
                    "{from} → {to} should be accepted: {:?}",
                    result.err()
                );
            } else {
                assert!(
                    matches!(result, Err(TaskdError::InvalidTransition { .. })),
                    "{from} → {to} should be rejected"
                );
                // A rejected transition leaves the row untouched.
                assert_eq!(store.get_task(id).await.unwrap().status(), from);
            }
        }
    }
}

#[tokio::test]
async fn status_change_and_audit_row_commit_together() {
    let (_dir, store) = scratch_store().await;
    let id = store
        .create_task(NewTask {
            title: "audited".into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .task
        .id;

    let before = store.recent_events(100).await.unwrap().len();
    let change = store.update_status(id, Status::Queued).await.unwrap();

    // The audit row is visible immediately after update_status returns —
    // same transaction, no publish step in between.
    let events = store.recent_events(100).await.unwrap();
    assert_eq!(events.len(), before + 1);
    let record = events.last().unwrap();
    assert_eq!(record.event_id, change.event.event_id);
    assert_eq!(record.event_type, "task.queued");
    assert_eq!(record.task_id, Some(id));

    // And a failed transition writes nothing.
    let before = store.recent_events(100).await.unwrap().len();
    assert!(store.update_status(id, Status::Done).await.is_err());
    assert_eq!(store.recent_events(100).await.unwrap().len(), before);
}

#[tokio::test]
async fn events_for_task_follow_insertion_order() {
    let (_dir, store) = scratch_store().await;
    let id = store
        .create_task(NewTask {
            title: "ordered".into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .task
        .id;
    store.update_status(id, Status::Queued).await.unwrap();
    store.next_queued().await.unwrap().unwrap();
    store.update_status(id, Status::Done).await.unwrap();

    let types: Vec<String> = store
        .events_for_task(id)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.event_type)
        .collect();
    assert_eq!(
        types,
        vec!["task.created", "task.queued", "task.started", "task.completed"]
    );
}

#[tokio::test]
async fn full_port_range_is_conflict_until_one_frees() {
    let (_dir, store) = scratch_store().await;

    // Hold the entire range. Rows are written directly — allocating 1000
    // ports through the API would dominate the test's runtime.
    let mut holders = Vec::new();
    for port in 3000..=3999i64 {
        let id = store
            .create_task(NewTask {
                title: format!("holder {port}"),
                ..Default::default()
            })
            .await
            .unwrap()
            .task
            .id;
        sqlx::query("UPDATE tasks SET port = ? WHERE id = ?")
            .bind(port)
            .bind(id)
            .execute(store.pool())
            .await
            .unwrap();
        holders.push(id);
    }

    let extra = store
        .create_task(NewTask {
            title: "one too many".into(),
            ..Default::default()
        })
        .await
        .unwrap()
        .task
        .id;
    assert!(matches!(
        store.allocate_port(extra).await,
        Err(TaskdError::Conflict(_))
    ));

    // Freeing any port makes the next allocation succeed.
    store.release_port(holders[500]).await.unwrap();
    assert_eq!(store.allocate_port(extra).await.unwrap(), 3500);
}

#[tokio::test]
async fn next_queued_is_exclusive_under_contention() {
    let (_dir, store) = scratch_store().await;
    for i in 0..5 {
        let id = store
            .create_task(NewTask {
                title: format!("contended {i}"),
                ..Default::default()
            })
            .await
            .unwrap()
            .task
            .id;
        store.update_status(id, Status::Queued).await.unwrap();
    }

    // Eight concurrent dequeuers over five tasks: every task claimed
    // exactly once, three callers come up empty.
    let mut handles = Vec::new();
    for _ in 0..8 {
        let store = store.clone();
        handles.push(tokio::spawn(async move { store.next_queued().await }));
    }
    let mut claimed = Vec::new();
    let mut empty = 0;
    for h in handles {
        match h.await.unwrap().unwrap() {
            Some(change) => claimed.push(change.task.id),
            None => empty += 1,
        }
    }
    claimed.sort_unstable();
    claimed.dedup();
    assert_eq!(claimed.len(), 5, "each task must be claimed exactly once");
    assert_eq!(empty, 3);
}
