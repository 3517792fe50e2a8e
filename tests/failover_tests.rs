//! Worker failure tests: dead workers are swept out, their attempts time
//! out and their tasks land on the survivors; with nobody left, the job
//! fails once attempts are exhausted.

mod test_harness;

use std::time::Duration;

use mapred_lite::proto::JobPhase;
use mapred_lite::scheduler::job::AttemptOutcome;
use test_harness::{wait_for, TestCluster, WorkerOptions};

#[tokio::test]
async fn test_dead_worker_tasks_land_on_survivors() {
    // worker-2 naps for thirty seconds per task, so it is guaranteed to be
    // holding work when it dies.
    let cluster_options = |i: usize| WorkerOptions {
        simulate_straggler: i == 1,
        straggler_delay: Duration::from_secs(30),
        ..Default::default()
    };
    // Straggler detection is switched off so the dead-worker path, not a
    // backup attempt, is what rescues the job.
    let mut cluster = TestCluster::start_custom(2, cluster_options, |mut config| {
        config.straggler_threshold = 1_000_000.0;
        config
    })
    .await;
    cluster
        .upload(
            "/data/input/words.txt",
            b"hello world\nhello mapreduce\nworld of distributed systems\nmapreduce is powerful\nhello again\n",
        )
        .await;

    let job_id = cluster
        .submit(
            "/data/input/words.txt",
            "/data/output/failover",
            "wordcount",
            "wordcount",
            4,
            1,
        )
        .await;

    // Wait until the doomed worker actually holds an attempt.
    let state_handle = cluster.scheduler.state();
    let holding = wait_for(
        || async {
            let state = state_handle.read().await;
            state
                .worker("worker-2")
                .map(|w| !w.in_flight.is_empty())
                .unwrap_or(false)
        },
        Duration::from_secs(5),
        Duration::from_millis(50),
    )
    .await;
    assert!(holding, "worker-2 never received an attempt");

    cluster.kill_worker("worker-2");

    assert!(
        cluster
            .wait_for_phase(job_id, JobPhase::Completed, Duration::from_secs(20))
            .await,
        "job did not recover from the worker death"
    );

    // The dead worker's attempts were timed out, and every committed task
    // was committed by the survivor.
    let state = state_handle.read().await;
    let timed_out = (0..4)
        .map(|i| mapred_lite::scheduler::job::TaskId::map(job_id, i))
        .flat_map(|t| state.attempts_of(&t).into_iter().cloned().collect::<Vec<_>>())
        .filter(|a| a.worker_id == "worker-2" && a.outcome == AttemptOutcome::TimedOut)
        .count();
    assert!(timed_out >= 1, "no attempt was timed out on the dead worker");
    assert_eq!(
        state.worker("worker-2").unwrap().liveness,
        mapred_lite::scheduler::job::Liveness::Dead
    );

    let pairs = cluster.read_output("/data/output/failover", 1).await;
    assert_eq!(pairs.iter().find(|(k, _)| k == "hello").unwrap().1, "3");
}

#[tokio::test]
async fn test_job_fails_when_every_worker_dies() {
    // A single worker and a single allowed attempt: its death takes the
    // job with it.
    let mut cluster = TestCluster::start_custom(
        1,
        |_| WorkerOptions {
            simulate_straggler: true,
            straggler_delay: Duration::from_secs(60),
            ..Default::default()
        },
        |mut config| {
            config.max_attempts = 1;
            config
        },
    )
    .await;
    cluster.upload("/data/input/words.txt", b"hello\n").await;

    let job_id = cluster
        .submit(
            "/data/input/words.txt",
            "/data/output/doomed",
            "wordcount",
            "wordcount",
            1,
            1,
        )
        .await;

    let state_handle = cluster.scheduler.state();
    let holding = wait_for(
        || async {
            let state = state_handle.read().await;
            state
                .worker("worker-1")
                .map(|w| !w.in_flight.is_empty())
                .unwrap_or(false)
        },
        Duration::from_secs(5),
        Duration::from_millis(50),
    )
    .await;
    assert!(holding, "worker-1 never received an attempt");

    cluster.kill_worker("worker-1");

    assert!(
        cluster
            .wait_for_phase(job_id, JobPhase::Failed, Duration::from_secs(10))
            .await,
        "job should fail once its only worker is gone"
    );

    let status = cluster.client().await.status(job_id).await.unwrap();
    assert!(status.error_message.is_some());

    // No canonical output was ever written for the failed job.
    assert!(
        !cluster
            .store
            .exists(&mapred_lite::blobstore::output_partition("/data/output/doomed", 0))
            .await
    );
}

#[tokio::test]
async fn test_worker_reregistration_after_death() {
    // Kill a worker, let the sweeper declare it dead, then bring up a
    // replacement under a fresh id: queued work must flow to it.
    let mut cluster = TestCluster::start_custom(
        1,
        |_| WorkerOptions {
            simulate_straggler: true,
            straggler_delay: Duration::from_secs(60),
            ..Default::default()
        },
        |c| c,
    )
    .await;
    cluster.upload("/data/input/words.txt", b"hello world\n").await;

    let job_id = cluster
        .submit(
            "/data/input/words.txt",
            "/data/output/replaced",
            "wordcount",
            "wordcount",
            2,
            1,
        )
        .await;

    let state_handle = cluster.scheduler.state();
    assert!(
        wait_for(
            || async {
                let state = state_handle.read().await;
                state
                    .worker("worker-1")
                    .map(|w| !w.in_flight.is_empty())
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
            Duration::from_millis(50),
        )
        .await
    );
    cluster.kill_worker("worker-1");

    // Replacement is fast (no straggler hook).
    cluster.spawn_worker(WorkerOptions::default()).await;

    assert!(
        cluster
            .wait_for_phase(job_id, JobPhase::Completed, Duration::from_secs(20))
            .await,
        "replacement worker did not pick the job up"
    );
}
