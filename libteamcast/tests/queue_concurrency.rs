//! Lease-based queue behaviour under concurrent workers

mod common;

use std::time::Duration;

use chrono::Utc;
use common::{fast_config, setup, setup_with_adapters, TestEnv};
use futures::future::join_all;
use libteamcast::error::PlatformError;
use libteamcast::platforms::mock::MockAdapter;
use libteamcast::queue::{JobStatus, QueueJob};
use libteamcast::{Config, Platform, PostStatus, TeamcastError};

/// Twitter publishes take `delay_ms`; Facebook is instant
async fn with_slow_twitter(config: Config, delay_ms: u64) -> TestEnv {
    let twitter = MockAdapter::new(Platform::Twitter).with_delay(Duration::from_millis(delay_ms));
    setup_with_adapters(config, twitter, MockAdapter::new(Platform::Facebook)).await
}

#[tokio::test]
async fn test_each_job_claimed_by_exactly_one_worker() {
    let env = setup().await;
    let post = env.draft(env.owner, vec![Platform::Twitter]).await;
    let now = Utc::now();
    env.repos
        .queue
        .enqueue(&QueueJob::new(post.id, now, 3, now))
        .await
        .unwrap();

    let claims = join_all((0..8).map(|i| {
        let queue = env.repos.queue.clone();
        let worker_id = format!("worker-{i}");
        async move {
            queue
                .claim_next(&worker_id, Utc::now(), chrono::Duration::minutes(5))
                .await
                .unwrap()
        }
    }))
    .await;

    let winners: Vec<_> = claims.into_iter().flatten().collect();
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].status, JobStatus::Processing);
}

#[tokio::test]
async fn test_concurrent_dispatchers_publish_each_post_once() {
    let env = with_slow_twitter(fast_config(), 30).await;
    env.connect(Platform::Twitter).await;

    let mut post_ids = Vec::new();
    for _ in 0..5 {
        let post = env.draft(env.owner, vec![Platform::Twitter]).await;
        env.service.posts().queue(post.id, env.owner).await.unwrap();
        post_ids.push(post.id);
    }

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let dispatcher = env.service.dispatcher(format!("worker-{i}"));
            tokio::spawn(async move { dispatcher.run_once().await.unwrap() })
        })
        .collect();
    let mut processed = 0;
    for handle in handles {
        processed += handle.await.unwrap().processed;
    }

    assert_eq!(processed, 5);
    assert_eq!(env.twitter.publish_calls(), 5);
    for post_id in post_ids {
        let post = env.service.posts().get(post_id, env.owner).await.unwrap();
        assert_eq!(post.status(), PostStatus::Published);
    }
}

#[tokio::test]
async fn test_cancel_loses_to_running_publish() {
    let env = with_slow_twitter(fast_config(), 300).await;
    env.connect(Platform::Twitter).await;
    let post = env.draft(env.owner, vec![Platform::Twitter]).await;
    env.service.posts().queue(post.id, env.owner).await.unwrap();

    let dispatcher = env.service.dispatcher("worker-1");
    let running = tokio::spawn(async move { dispatcher.run_once().await.unwrap() });

    // wait until the worker holds the job
    let mut claimed = false;
    for _ in 0..100 {
        let job = env.repos.queue.job_for_post(post.id).await.unwrap().unwrap();
        if job.status == JobStatus::Processing {
            claimed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(claimed, "worker never claimed the job");

    let err = env.service.posts().cancel(post.id, env.owner).await.unwrap_err();
    assert!(matches!(err, TeamcastError::Conflict(_)));

    let report = running.await.unwrap();
    assert_eq!(report.published, 1);
    let stored = env.service.posts().get(post.id, env.owner).await.unwrap();
    assert_eq!(stored.status(), PostStatus::Published);
}

#[tokio::test]
async fn test_expired_lease_reclaimed_once() {
    let env = setup().await;
    let post = env.draft(env.owner, vec![Platform::Twitter]).await;
    env.service.posts().queue(post.id, env.owner).await.unwrap();
    env.repos
        .queue
        .claim_post(post.id, "lost-worker", Utc::now(), chrono::Duration::milliseconds(1))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let first = env.service.dispatcher("reaper-a");
    let second = env.service.dispatcher("reaper-b");
    let now = Utc::now();
    let (a, b) = tokio::join!(first.reap(now), second.reap(now));
    assert_eq!(a.unwrap() + b.unwrap(), 1);

    let job = env.repos.queue.job_for_post(post.id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempt_count, 1);

    // the lost worker can no longer complete
    let err = env
        .repos
        .queue
        .complete(job.id, "lost-worker", Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(err, TeamcastError::Conflict(_)));
}

#[tokio::test]
async fn test_long_publish_keeps_its_lease() {
    let mut config = fast_config();
    config.queue.lease_secs = 3;
    config.publishing.adapter_timeout_secs = 1;
    config.publishing.max_retries = 6;
    let env = with_slow_twitter(config, 700).await;
    env.connect(Platform::Twitter).await;
    for _ in 0..6 {
        env.twitter.push_publish(Err(PlatformError::Network("reset".to_string())));
    }
    let post = env.draft(env.owner, vec![Platform::Twitter]).await;
    env.service.posts().queue(post.id, env.owner).await.unwrap();

    // seven calls take about 4.9s, well past one 3s lease
    let dispatcher = env.service.dispatcher("worker-1");
    let running = tokio::spawn(async move { dispatcher.run_once().await.unwrap() });

    tokio::time::sleep(Duration::from_millis(3500)).await;
    let rival = env.service.dispatcher("worker-2").run_once().await.unwrap();
    assert_eq!(rival.reaped, 0);
    assert_eq!(rival.processed, 0);

    let report = running.await.unwrap();
    assert_eq!(report.published, 1);
    assert_eq!(env.twitter.publish_calls(), 7);
    assert_eq!(env.twitter.published().len(), 1);
}

#[tokio::test]
async fn test_publish_stops_once_its_lease_is_taken() {
    let env = with_slow_twitter(fast_config(), 300).await;
    env.connect(Platform::Twitter).await;
    env.twitter.push_publish(Err(PlatformError::Network("reset".to_string())));
    let post = env.draft(env.owner, vec![Platform::Twitter]).await;
    env.service.posts().queue(post.id, env.owner).await.unwrap();

    let dispatcher = env.service.dispatcher("worker-1");
    let running = tokio::spawn(async move { dispatcher.run_once().await.unwrap() });

    let mut in_flight = false;
    for _ in 0..100 {
        if env.twitter.publish_calls() == 1 {
            in_flight = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(in_flight, "worker never called the platform");

    // a reaper whose clock runs an hour ahead takes the job away
    let reclaimed = env
        .repos
        .queue
        .reclaim_expired(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(reclaimed.len(), 1);

    let report = running.await.unwrap();
    assert_eq!(report.errored, 1);
    assert_eq!(report.published, 0);
    // the retry never went out
    assert_eq!(env.twitter.publish_calls(), 1);
}

#[tokio::test]
async fn test_job_with_expired_lease_is_not_processed() {
    let env = setup().await;
    env.connect(Platform::Twitter).await;
    let post = env.draft(env.owner, vec![Platform::Twitter]).await;
    env.service.posts().queue(post.id, env.owner).await.unwrap();
    let job = env
        .repos
        .queue
        .claim_post(post.id, "worker-1", Utc::now(), chrono::Duration::milliseconds(1))
        .await
        .unwrap()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = env.service.publishing().process_job(job, "worker-1").await.unwrap_err();
    assert!(matches!(err, TeamcastError::Conflict(_)));
    assert_eq!(env.twitter.publish_calls(), 0);
}
