//! End-to-end lifecycle scenarios driven through the control surface with
//! the mock adapter.

mod common;

use common::{wait_for_status, TestDaemon};
use taskd::error::TaskdError;
use taskd::events::EventFilter;
use taskd::store::{NewTask, Status};

fn mock_task(title: &str, body: &str) -> NewTask {
    NewTask {
        title: title.to_string(),
        body: body.to_string(),
        executor: Some("mock".to_string()),
        ..Default::default()
    }
}

#[tokio::test]
async fn happy_path_runs_to_done() {
    let daemon = TestDaemon::start().await;
    let mut events = daemon
        .ctx
        .control
        .subscribe_events(EventFilter::default())
        .await;

    let task = daemon
        .ctx
        .control
        .create_task(mock_task("A", "do X"), true)
        .await
        .expect("create");

    let done = wait_for_status(&daemon.ctx, task.id, Status::Done).await;
    assert!(done.completed_at.is_some());
    assert_eq!(done.port, 0);
    assert_eq!(done.summary, "mock run complete");
    assert_eq!(done.agent_session_id, format!("mock-session-{}", task.id));

    // The status row commits before the envelope is published; give the
    // final publish a beat to land.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    // The lifecycle events arrive in publish order with increasing
    // sequences.
    let mut seen = Vec::new();
    let mut last_seq = 0;
    while let Ok(env) = events.rx.try_recv() {
        assert!(env.sequence > last_seq, "sequence must increase");
        last_seq = env.sequence;
        seen.push(env.event_type);
    }
    for expected in [
        "task.created",
        "task.queued",
        "task.started",
        "task.processing",
        "task.completed",
    ] {
        assert!(seen.iter().any(|t| t == expected), "missing {expected} in {seen:?}");
    }
    // Adapter item events flowed between started and completed.
    assert!(seen.iter().any(|t| t.starts_with("agent.item.")));

    daemon.stop().await;
}

#[tokio::test]
async fn needs_input_cycle_preserves_session() {
    let daemon = TestDaemon::start().await;
    let task = daemon
        .ctx
        .control
        .create_task(mock_task("pick one", "mock:needs-input"), true)
        .await
        .expect("create");

    let blocked = wait_for_status(&daemon.ctx, task.id, Status::Blocked).await;
    let session = blocked.agent_session_id.clone();
    assert!(!session.is_empty());

    // The question was logged for the human.
    let logs = daemon.ctx.store.recent_logs(task.id, 50).await.unwrap();
    assert!(logs
        .iter()
        .any(|l| l.content.contains("agent needs input: choose an option")));

    daemon
        .ctx
        .control
        .send_input(task.id, "A")
        .await
        .expect("send input");

    let done = wait_for_status(&daemon.ctx, task.id, Status::Done).await;
    assert_eq!(done.agent_session_id, session, "session id must survive re-entry");
    assert!(done.completed_at.is_some());

    // The feedback reached the resumed agent.
    let logs = daemon.ctx.store.recent_logs(task.id, 100).await.unwrap();
    assert!(logs.iter().any(|l| l.content.contains("continuing with feedback: A")));

    daemon.stop().await;
}

#[tokio::test]
async fn interrupt_blocks_then_retry_completes() {
    let daemon = TestDaemon::start().await;
    let task = daemon
        .ctx
        .control
        .create_task(mock_task("long haul", "mock:hang"), true)
        .await
        .expect("create");

    let processing = wait_for_status(&daemon.ctx, task.id, Status::Processing).await;
    assert!(processing.started_at.is_some());
    assert!(
        daemon.ctx.executor.running().contains(task.id).await,
        "a processing task must have a running-map entry"
    );

    let blocked = daemon.ctx.control.interrupt(task.id).await.expect("interrupt");
    assert_eq!(blocked.status(), Status::Blocked);
    assert!(
        !daemon.ctx.executor.running().contains(task.id).await,
        "interrupt must release the running-map entry"
    );

    let logs = daemon.ctx.store.recent_logs(task.id, 50).await.unwrap();
    assert!(logs.iter().any(|l| l.content == "interrupted"));

    // Hang only applies to the first run; the retried run resumes with the
    // prior session and completes.
    daemon.ctx.control.retry(task.id, None).await.expect("retry");
    let done = wait_for_status(&daemon.ctx, task.id, Status::Done).await;
    assert!(done.completed_at.is_some());

    daemon.stop().await;
}

#[tokio::test]
async fn interrupt_requires_processing() {
    let daemon = TestDaemon::start().await;
    let task = daemon
        .ctx
        .control
        .create_task(mock_task("idle", ""), false)
        .await
        .expect("create");

    let err = daemon.ctx.control.interrupt(task.id).await.unwrap_err();
    assert!(matches!(err, TaskdError::InvalidTransition { .. }));
    daemon.stop().await;
}

#[tokio::test]
async fn unknown_executor_blocks_without_resources() {
    let daemon = TestDaemon::start().await;
    let task = daemon
        .ctx
        .control
        .create_task(
            NewTask {
                title: "nope".into(),
                executor: Some("does-not-exist".into()),
                ..Default::default()
            },
            true,
        )
        .await
        .expect("create");

    let blocked = wait_for_status(&daemon.ctx, task.id, Status::Blocked).await;
    assert_eq!(blocked.worktree_path, "", "no worktree for unavailable adapter");
    assert_eq!(blocked.port, 0, "no port for unavailable adapter");

    let logs = daemon.ctx.store.recent_logs(task.id, 50).await.unwrap();
    assert!(logs.iter().any(|l| l.content.contains("does-not-exist")));

    daemon.stop().await;
}

#[tokio::test]
async fn failing_agent_blocks_with_failed_event() {
    let daemon = TestDaemon::start().await;
    let mut events = daemon
        .ctx
        .control
        .subscribe_events(EventFilter {
            types: vec!["task.failed".to_string()],
            ..Default::default()
        })
        .await;

    let task = daemon
        .ctx
        .control
        .create_task(mock_task("boom", "mock:fail"), true)
        .await
        .expect("create");

    wait_for_status(&daemon.ctx, task.id, Status::Blocked).await;
    let env = tokio::time::timeout(std::time::Duration::from_secs(5), events.rx.recv())
        .await
        .expect("task.failed event")
        .unwrap();
    assert_eq!(env.task_id, Some(task.id));
    assert_eq!(env.metadata["reason"], "mock failure injected");

    daemon.stop().await;
}

#[tokio::test]
async fn retry_of_processing_task_is_rejected() {
    let daemon = TestDaemon::start().await;
    let task = daemon
        .ctx
        .control
        .create_task(mock_task("busy", "mock:hang"), true)
        .await
        .expect("create");

    wait_for_status(&daemon.ctx, task.id, Status::Processing).await;
    let err = daemon.ctx.control.retry(task.id, None).await.unwrap_err();
    assert!(matches!(err, TaskdError::InvalidTransition { .. }));

    // Clean up the hanging agent.
    daemon.ctx.control.interrupt(task.id).await.expect("interrupt");
    daemon.stop().await;
}

#[tokio::test]
async fn done_task_can_be_reopened() {
    let daemon = TestDaemon::start().await;
    let task = daemon
        .ctx
        .control
        .create_task(mock_task("again", ""), true)
        .await
        .expect("create");
    wait_for_status(&daemon.ctx, task.id, Status::Done).await;

    daemon.ctx.control.retry(task.id, None).await.expect("reopen");
    let done = wait_for_status(&daemon.ctx, task.id, Status::Done).await;
    assert!(done.completed_at.is_some());

    daemon.stop().await;
}

#[tokio::test]
async fn workers_run_tasks_in_parallel() {
    let daemon = TestDaemon::start().await;
    let mut ids = Vec::new();
    for i in 0..4 {
        let task = daemon
            .ctx
            .control
            .create_task(mock_task(&format!("batch {i}"), ""), true)
            .await
            .expect("create");
        ids.push(task.id);
    }
    for id in ids {
        let done = wait_for_status(&daemon.ctx, id, Status::Done).await;
        assert!(done.completed_at.is_some());
    }
    daemon.stop().await;
}

#[tokio::test]
async fn tail_logs_streams_agent_output() {
    let daemon = TestDaemon::start().await;
    let task = daemon
        .ctx
        .control
        .create_task(mock_task("tailed", ""), true)
        .await
        .expect("create");
    let mut tail = daemon
        .ctx
        .control
        .tail_logs(task.id, 0)
        .await
        .expect("tail");

    wait_for_status(&daemon.ctx, task.id, Status::Done).await;

    let mut contents = Vec::new();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        match tokio::time::timeout(std::time::Duration::from_millis(700), tail.rx.recv()).await
        {
            Ok(Some(line)) => contents.push(line.content),
            _ => break,
        }
    }
    assert!(contents.iter().any(|c| c.contains("working on the task")));
    assert!(contents
        .iter()
        .any(|c| c.contains("workflow_complete")));

    daemon.stop().await;
}

#[tokio::test]
async fn orphaned_processing_task_is_recovered_on_restart() {
    use taskd::store::Store;

    let dir = tempfile::TempDir::new().unwrap();
    let data_dir = dir.path().join("data");

    // Simulate a crash: a task left in `processing` with no live process.
    {
        let store = Store::open(&data_dir).await.unwrap();
        let id = store
            .create_task(NewTask {
                title: "orphan".into(),
                executor: Some("mock".into()),
                ..Default::default()
            })
            .await
            .unwrap()
            .task
            .id;
        store.update_status(id, Status::Queued).await.unwrap();
        store.next_queued().await.unwrap().unwrap();
        assert_eq!(store.get_task(id).await.unwrap().status(), Status::Processing);
        store.close().await;
    }

    let daemon = TestDaemon::start_in(dir).await;
    let tasks = daemon
        .ctx
        .store
        .list_tasks(&Default::default())
        .await
        .unwrap();
    let orphan = tasks.iter().find(|t| t.title == "orphan").unwrap();
    let recovered = wait_for_status(&daemon.ctx, orphan.id, Status::Blocked).await;
    assert_eq!(recovered.status(), Status::Blocked);

    daemon.stop().await;
}
