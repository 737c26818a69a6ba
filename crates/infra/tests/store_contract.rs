//! Behaviour every `QueueStore` backend must share.
//!
//! The in-memory store always runs. Postgres runs when `DATABASE_URL` is set
//! (the `queue_tasks` table is truncated first, so point it at a scratch
//! database). Redis runs with `--features redis` when `REDIS_URL` is set,
//! under a fresh key prefix.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use taskforge_core::{Task, TaskError, TaskId, TaskResult, TaskStatus};
use taskforge_infra::queue::{InMemoryQueueStore, PostgresQueueStore, QueueStore, QueueStoreError};

async fn run_contract<S>(store: Arc<S>)
where
    S: QueueStore + 'static,
{
    dequeues_in_schedule_order(&*store).await;
    claims_each_task_once(store.clone()).await;
    hides_future_tasks(&*store).await;
    respects_sub_millisecond_schedules(&*store).await;
    retry_and_dead_letter_transitions(&*store).await;
    ignores_transitions_on_unknown_tasks(&*store).await;
    rejects_duplicate_ids(&*store).await;
    clears_only_old_completions(&*store).await;
}

async fn drain<S: QueueStore + ?Sized>(store: &S) {
    while store.dequeue(Utc::now()).await.unwrap().is_some() {}
}

async fn dequeues_in_schedule_order<S: QueueStore + ?Sized>(store: &S) {
    let now = Utc::now();
    let base = now - Duration::seconds(30);
    let early = Task::new("order", json!({"n": 1}), 3).scheduled_at(base);
    let middle = Task::new("order", json!({"n": 2}), 3).scheduled_at(base + Duration::seconds(1));
    let late = Task::new("order", json!({"n": 3}), 3).scheduled_at(base + Duration::seconds(2));

    store.enqueue(late.clone()).await.unwrap();
    store.enqueue(early.clone()).await.unwrap();
    store.enqueue(middle.clone()).await.unwrap();

    let mut order = Vec::new();
    for _ in 0..3 {
        let task = store.dequeue(now).await.unwrap().expect("eligible task");
        assert_eq!(task.attempts, 1);
        order.push(task.id);
    }
    assert_eq!(order, vec![early.id, middle.id, late.id]);
    assert!(store.dequeue(now).await.unwrap().is_none());
}

async fn claims_each_task_once<S: QueueStore + 'static>(store: Arc<S>) {
    let mut ids = HashSet::new();
    for i in 0..20 {
        let task = Task::new("race", json!(i), 3);
        ids.insert(task.id);
        store.enqueue(task).await.unwrap();
    }

    let mut workers = Vec::new();
    for _ in 0..6 {
        let store = store.clone();
        workers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(task) = store.dequeue(Utc::now()).await.unwrap() {
                claimed.push(task.id);
            }
            claimed
        }));
    }

    let mut claimed = Vec::new();
    for worker in workers {
        claimed.extend(worker.await.unwrap());
    }
    let unique: HashSet<TaskId> = claimed.iter().copied().collect();
    assert_eq!(claimed.len(), unique.len(), "a task was claimed twice");
    assert!(ids.is_subset(&unique));
}

async fn hides_future_tasks<S: QueueStore + ?Sized>(store: &S) {
    drain(store).await;
    let now = Utc::now();
    let task = Task::new("later", json!({}), 3).scheduled_at(now + Duration::minutes(10));
    let id = task.id;
    store.enqueue(task).await.unwrap();

    assert!(store.dequeue(now).await.unwrap().is_none());
    let claimed = store
        .dequeue(now + Duration::minutes(10))
        .await
        .unwrap()
        .expect("due task");
    assert_eq!(claimed.id, id);
}

async fn respects_sub_millisecond_schedules<S: QueueStore + ?Sized>(store: &S) {
    drain(store).await;
    let base = DateTime::from_timestamp_millis(Utc::now().timestamp_millis() - 1_000).unwrap();
    let due = base + Duration::microseconds(700);
    let task = Task::new("precise", json!({}), 3).scheduled_at(due);
    let id = task.id;
    store.enqueue(task).await.unwrap();

    assert!(store
        .dequeue(base + Duration::microseconds(300))
        .await
        .unwrap()
        .is_none());
    let claimed = store.dequeue(due).await.unwrap().expect("due task");
    assert_eq!(claimed.id, id);
}

async fn retry_and_dead_letter_transitions<S: QueueStore + ?Sized>(store: &S) {
    drain(store).await;
    let failed_before = store.failed_count().await.unwrap();

    let task = Task::new("flaky", json!({"k": "v"}), 2);
    let id = task.id;
    store.enqueue(task).await.unwrap();

    let first = store.dequeue(Utc::now()).await.unwrap().expect("first claim");
    assert_eq!(first.id, id);
    assert_eq!(first.args, json!({"k": "v"}));

    let retry_at = Utc::now() - Duration::milliseconds(1);
    store
        .fail(id, TaskError::new("first failure"), Some(retry_at))
        .await
        .unwrap();
    let record = store.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Pending);
    assert_eq!(record.last_error.as_ref().unwrap().message, "first failure");

    let second = store.dequeue(Utc::now()).await.unwrap().expect("second claim");
    assert_eq!(second.attempts, 2);
    store
        .fail(id, TaskError::new("second failure").with_context("chain"), None)
        .await
        .unwrap();

    let record = store.get(id).await.unwrap().unwrap();
    assert_eq!(record.status, TaskStatus::Failed);
    assert_eq!(record.task.attempts, 2);
    let error = record.last_error.unwrap();
    assert_eq!(error.message, "second failure");
    assert_eq!(error.context.as_deref(), Some("chain"));
    assert_eq!(store.failed_count().await.unwrap(), failed_before + 1);
}

async fn ignores_transitions_on_unknown_tasks<S: QueueStore + ?Sized>(store: &S) {
    let unknown = TaskId::new();
    store
        .complete(unknown, TaskResult::new(Utc::now(), 1))
        .await
        .unwrap();
    store.fail(unknown, TaskError::new("x"), None).await.unwrap();
    assert!(store.get(unknown).await.unwrap().is_none());

    drain(store).await;
    let task = Task::new("idle", json!({}), 3);
    let id = task.id;
    store.enqueue(task).await.unwrap();
    store
        .complete(id, TaskResult::new(Utc::now(), 1))
        .await
        .unwrap();
    assert_eq!(
        store.get(id).await.unwrap().unwrap().status,
        TaskStatus::Pending
    );
}

async fn rejects_duplicate_ids<S: QueueStore + ?Sized>(store: &S) {
    let task = Task::new("dup", json!({}), 3);
    store.enqueue(task.clone()).await.unwrap();
    let err = store.enqueue(task).await.unwrap_err();
    assert!(matches!(err, QueueStoreError::AlreadyExists(_)));
}

async fn clears_only_old_completions<S: QueueStore + ?Sized>(store: &S) {
    drain(store).await;
    let now = Utc::now();

    let old = Task::new("gc", json!({}), 3);
    let fresh = Task::new("gc", json!({}), 3);
    let (old_id, fresh_id) = (old.id, fresh.id);
    store.enqueue(old).await.unwrap();
    store.enqueue(fresh).await.unwrap();
    store.dequeue(Utc::now()).await.unwrap().expect("old claimed");
    store.dequeue(Utc::now()).await.unwrap().expect("fresh claimed");
    store
        .complete(old_id, TaskResult::new(now - Duration::days(2), 3))
        .await
        .unwrap();
    store
        .complete(fresh_id, TaskResult::new(now, 3))
        .await
        .unwrap();

    let removed = store.clear_completed(now - Duration::days(1)).await.unwrap();
    assert!(removed >= 1);
    assert!(store.get(old_id).await.unwrap().is_none());

    let kept = store.get(fresh_id).await.unwrap().unwrap();
    assert_eq!(kept.status, TaskStatus::Completed);
    assert_eq!(kept.result.unwrap().duration_ms, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn in_memory_store_honours_contract() {
    run_contract(Arc::new(InMemoryQueueStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn postgres_store_honours_contract() {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL not set; skipping postgres contract");
        return;
    };

    let store = PostgresQueueStore::connect(&url).await.unwrap();
    store.ensure_schema().await.unwrap();
    sqlx::query("TRUNCATE queue_tasks")
        .execute(store.pool())
        .await
        .unwrap();

    run_contract(Arc::new(store)).await;
}

#[cfg(feature = "redis")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn redis_store_honours_contract() {
    use taskforge_infra::queue::RedisQueueStore;

    let Ok(url) = std::env::var("REDIS_URL") else {
        eprintln!("REDIS_URL not set; skipping redis contract");
        return;
    };

    let prefix = format!("taskforge:test:{}", uuid::Uuid::now_v7());
    let store = RedisQueueStore::connect(&url, prefix).await.unwrap();
    run_contract(Arc::new(store)).await;
}
