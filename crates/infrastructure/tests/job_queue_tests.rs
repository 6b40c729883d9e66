mod common;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_test::traced_test;

use common::{count_rows, TestStorage};
use jobstore_core::{Clock, CreateJob, StorageError};
use jobstore_infrastructure::StorageConnection;

fn queues(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

async fn create_job(connection: &StorageConnection) -> Result<i64> {
    Ok(connection
        .create_job(CreateJob::new(b"Jobs.Email.Send".to_vec(), b"[]".to_vec()))
        .await?)
}

#[tokio::test]
#[traced_test]
async fn test_claim_is_exclusive_until_invisibility_timeout() -> Result<()> {
    let test = TestStorage::sqlite().await?;
    let connection = test.storage.connection();
    let queue = connection.queue();

    let job_id = create_job(&connection).await?;
    queue.enqueue("default", job_id).await?;

    let timeout = Duration::from_secs(30);
    let first = queue
        .fetch_next(&queues(&["default"]), timeout)
        .await?
        .expect("job should be available");
    assert_eq!(first.job_id, job_id);
    assert_eq!(first.queue, "default");
    assert_eq!(first.fetched_at, test.clock.now());

    // 另一个消费者在领取仍然有效时拿不到作业
    let second = queue.fetch_next(&queues(&["default"]), timeout).await?;
    assert!(second.is_none());

    test.clock.advance(chrono::Duration::seconds(31));

    let third = queue
        .fetch_next(&queues(&["default"]), timeout)
        .await?
        .expect("abandoned claim should be fetchable again");
    assert_eq!(third.job_id, job_id);
    assert_eq!(third.id, first.id);
    assert_ne!(third.fetch_token, first.fetch_token);

    // 旧的领取者已经失去所有权
    assert!(!queue.remove_from_queue(&first).await?);
    assert!(!queue.requeue(&first).await?);
    assert_eq!(count_rows(test.pool(), "job_queue").await?, 1);

    assert!(queue.remove_from_queue(&third).await?);
    assert_eq!(count_rows(test.pool(), "job_queue").await?, 0);
    assert!(logs_contain("Claimed queue entry"));
    Ok(())
}

#[tokio::test]
async fn test_fetch_from_empty_queue_returns_none() -> Result<()> {
    let test = TestStorage::sqlite().await?;
    let connection = test.storage.connection();

    let fetched = connection.fetch_next_job(&queues(&["default"])).await?;
    assert!(fetched.is_none());
    Ok(())
}

#[tokio::test]
async fn test_empty_queue_list_is_a_configuration_error() -> Result<()> {
    let test = TestStorage::sqlite().await?;
    let connection = test.storage.connection();

    let result = connection.fetch_next_job(&[]).await;
    assert!(matches!(result, Err(StorageError::Configuration(_))));
    Ok(())
}

#[tokio::test]
async fn test_queue_priority_follows_caller_order() -> Result<()> {
    let test = TestStorage::sqlite().await?;
    let connection = test.storage.connection();
    let queue = connection.queue();

    let low_first = create_job(&connection).await?;
    let low_second = create_job(&connection).await?;
    let critical = create_job(&connection).await?;
    queue.enqueue("low", low_first).await?;
    queue.enqueue("low", low_second).await?;
    queue.enqueue("critical", critical).await?;

    let order = queues(&["critical", "low"]);
    let mut fetched = Vec::new();
    while let Some(job) = connection.fetch_next_job(&order).await? {
        fetched.push(job.job_id);
    }
    assert_eq!(fetched, vec![critical, low_first, low_second]);

    // 不在请求列表中的队列不会被领取
    let other = create_job(&connection).await?;
    queue.enqueue("reports", other).await?;
    assert!(connection.fetch_next_job(&order).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_requeue_makes_entry_available_immediately() -> Result<()> {
    let test = TestStorage::sqlite().await?;
    let connection = test.storage.connection();

    let job_id = create_job(&connection).await?;
    connection.queue().enqueue("default", job_id).await?;

    let fetched = connection
        .fetch_next_job(&queues(&["default"]))
        .await?
        .expect("job should be available");
    assert!(connection.fetch_next_job(&queues(&["default"])).await?.is_none());

    assert!(connection.requeue(&fetched).await?);

    let again = connection
        .fetch_next_job(&queues(&["default"]))
        .await?
        .expect("requeued job should be available");
    assert_eq!(again.job_id, job_id);
    Ok(())
}

#[tokio::test]
async fn test_enqueue_inside_write_transaction() -> Result<()> {
    let test = TestStorage::sqlite().await?;
    let connection = test.storage.connection();

    let job_id = create_job(&connection).await?;
    let mut transaction = connection.create_write_transaction();
    transaction
        .set_job_state(job_id, jobstore_core::NewState::new("Enqueued"))
        .add_to_queue("default", job_id);
    transaction.commit().await?;

    let fetched = connection
        .fetch_next_job(&queues(&["default"]))
        .await?
        .expect("job should be queued");
    assert_eq!(fetched.job_id, job_id);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_fetchers_never_share_a_job() -> Result<()> {
    let test = TestStorage::sqlite().await?;
    let connection = test.storage.connection();

    let mut expected = HashSet::new();
    for _ in 0..20 {
        let job_id = create_job(&connection).await?;
        connection.queue().enqueue("default", job_id).await?;
        expected.insert(job_id);
    }

    let connection = Arc::new(connection);
    let mut workers = Vec::new();
    for _ in 0..4 {
        let connection = connection.clone();
        workers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(job) = connection
                .fetch_next_job(&["default".to_string()])
                .await
                .unwrap()
            {
                claimed.push(job.job_id);
            }
            claimed
        }));
    }

    let mut seen = HashSet::new();
    let mut total = 0;
    for worker in workers {
        for job_id in worker.await? {
            total += 1;
            assert!(seen.insert(job_id), "job {job_id} was claimed twice");
        }
    }

    assert_eq!(total, 20);
    assert_eq!(seen, expected);
    Ok(())
}
