//! End-to-end tests: real gRPC servers, real workers, a tempdir blob
//! store. Scenarios follow the word-count jobs the system ships with.

mod test_harness;

use std::time::Duration;

use mapred_lite::proto::JobPhase;
use test_harness::TestCluster;

const WORDCOUNT_INPUT: &str = "hello world\nhello mapreduce\nworld of distributed systems\nmapreduce is powerful\nhello again\n";

fn expected_wordcount() -> Vec<(String, String)> {
    let mut pairs: Vec<(String, String)> = [
        ("again", "1"),
        ("distributed", "1"),
        ("hello", "3"),
        ("is", "1"),
        ("mapreduce", "2"),
        ("of", "1"),
        ("powerful", "1"),
        ("systems", "1"),
        ("world", "2"),
    ]
    .iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    pairs.sort();
    pairs
}

#[tokio::test]
async fn test_wordcount_small() {
    let cluster = TestCluster::start(2).await;
    cluster
        .upload("/data/input/words.txt", WORDCOUNT_INPUT.as_bytes())
        .await;

    let job_id = cluster
        .submit(
            "/data/input/words.txt",
            "/data/output/wc",
            "wordcount",
            "wordcount",
            2,
            2,
        )
        .await;

    assert!(
        cluster
            .wait_for_phase(job_id, JobPhase::Completed, Duration::from_secs(15))
            .await,
        "word count job did not complete"
    );
    assert_eq!(
        cluster.read_output("/data/output/wc", 2).await,
        expected_wordcount()
    );

    // The streaming results RPC sees the same nine lines.
    let lines = cluster
        .client()
        .await
        .results("/data/output/wc".to_string(), 0)
        .await
        .unwrap();
    assert_eq!(lines.len(), 9);

    // And a limit caps the stream.
    let limited = cluster
        .client()
        .await
        .results("/data/output/wc".to_string(), 4)
        .await
        .unwrap();
    assert_eq!(limited.len(), 4);
}

#[tokio::test]
async fn test_empty_input_completes_with_empty_outputs() {
    let cluster = TestCluster::start(2).await;
    cluster.upload("/data/input/empty.txt", b"").await;

    let job_id = cluster
        .submit(
            "/data/input/empty.txt",
            "/data/output/empty",
            "wordcount",
            "wordcount",
            2,
            2,
        )
        .await;

    assert!(
        cluster
            .wait_for_phase(job_id, JobPhase::Completed, Duration::from_secs(15))
            .await,
        "empty-input job did not complete"
    );

    // Both output partitions exist and are empty files.
    for r in 0..2 {
        let path = mapred_lite::blobstore::output_partition("/data/output/empty", r);
        let contents = cluster.store.read(&path).await.unwrap();
        assert!(contents.is_empty(), "partition {r} is not empty");
    }
    assert!(cluster.read_output("/data/output/empty", 2).await.is_empty());
}

#[tokio::test]
async fn test_single_map_single_reduce() {
    let cluster = TestCluster::start(1).await;
    cluster
        .upload("/data/input/words.txt", WORDCOUNT_INPUT.as_bytes())
        .await;

    let job_id = cluster
        .submit(
            "/data/input/words.txt",
            "/data/output/single",
            "wordcount",
            "wordcount",
            1,
            1,
        )
        .await;

    assert!(
        cluster
            .wait_for_phase(job_id, JobPhase::Completed, Duration::from_secs(15))
            .await
    );
    assert_eq!(
        cluster.read_output("/data/output/single", 1).await,
        expected_wordcount()
    );
}

#[tokio::test]
async fn test_tasks_queue_when_slots_are_scarce() {
    // Six maps, one single-slot worker: everything must still commit.
    let cluster = TestCluster::start(1).await;
    cluster
        .upload("/data/input/words.txt", WORDCOUNT_INPUT.as_bytes())
        .await;

    let job_id = cluster
        .submit(
            "/data/input/words.txt",
            "/data/output/queued",
            "wordcount",
            "wordcount",
            6,
            2,
        )
        .await;

    assert!(
        cluster
            .wait_for_phase(job_id, JobPhase::Completed, Duration::from_secs(20))
            .await,
        "job starved behind its own queue"
    );
    assert_eq!(
        cluster.read_output("/data/output/queued", 2).await,
        expected_wordcount()
    );
}

#[tokio::test]
async fn test_concurrent_jobs_are_isolated() {
    let cluster = TestCluster::start(3).await;
    cluster
        .upload("/data/input/words.txt", WORDCOUNT_INPUT.as_bytes())
        .await;

    let mut job_ids = Vec::new();
    for i in 0..3 {
        let job_id = cluster
            .submit(
                "/data/input/words.txt",
                &format!("/data/output/job-{i}"),
                "wordcount",
                "wordcount",
                2,
                2,
            )
            .await;
        job_ids.push(job_id);
    }

    for job_id in &job_ids {
        assert!(
            cluster
                .wait_for_phase(*job_id, JobPhase::Completed, Duration::from_secs(20))
                .await,
            "job {job_id} did not complete"
        );
    }
    for i in 0..3 {
        assert_eq!(
            cluster.read_output(&format!("/data/output/job-{i}"), 2).await,
            expected_wordcount(),
            "job {i} produced wrong output"
        );
    }

    // Intermediate partitions are namespaced per job: one directory per
    // job id, none shared.
    let state = cluster.scheduler.state();
    let state = state.read().await;
    for job_id in &job_ids {
        for m in 0..2 {
            for r in 0..2 {
                let path = mapred_lite::blobstore::intermediate_partition(*job_id, m, r);
                assert!(
                    cluster.store.exists(&path).await,
                    "missing intermediate partition {path}"
                );
            }
        }
        assert_eq!(
            state.job(job_id).unwrap().phase,
            mapred_lite::scheduler::job::JobPhase::Completed
        );
    }
}

#[tokio::test]
async fn test_submission_validation_over_grpc() {
    let cluster = TestCluster::start(1).await;
    cluster.upload("/data/input/ok.txt", b"one line\n").await;
    let mut client = cluster.client().await;

    // Missing input.
    assert!(client
        .submit(
            "/data/input/no-such-file.txt".into(),
            "/data/output/x".into(),
            "wordcount".into(),
            "wordcount".into(),
            2,
            2,
        )
        .await
        .is_err());

    // Zero maps.
    assert!(client
        .submit(
            "/data/input/ok.txt".into(),
            "/data/output/x".into(),
            "wordcount".into(),
            "wordcount".into(),
            0,
            2,
        )
        .await
        .is_err());

    // Empty reducer ref.
    assert!(client
        .submit(
            "/data/input/ok.txt".into(),
            "/data/output/x".into(),
            "wordcount".into(),
            "".into(),
            2,
            2,
        )
        .await
        .is_err());

    // Unknown job id on the status RPC.
    assert!(client.status(uuid::Uuid::new_v4()).await.is_err());
}

#[tokio::test]
async fn test_upload_blob_over_grpc() {
    let cluster = TestCluster::start(1).await;
    let mut client = cluster.client().await;

    client
        .upload_bytes(b"uploaded via rpc\n".to_vec(), "/data/input/up.txt".to_string())
        .await
        .unwrap();
    assert_eq!(
        cluster.store.read("/data/input/up.txt").await.unwrap(),
        b"uploaded via rpc\n"
    );
}

#[tokio::test]
async fn test_rerun_produces_identical_output() {
    let cluster = TestCluster::start(2).await;
    cluster
        .upload("/data/input/words.txt", WORDCOUNT_INPUT.as_bytes())
        .await;

    for run in 0..2 {
        let output = format!("/data/output/rerun-{run}");
        let job_id = cluster
            .submit("/data/input/words.txt", &output, "wordcount", "wordcount", 2, 2)
            .await;
        assert!(
            cluster
                .wait_for_phase(job_id, JobPhase::Completed, Duration::from_secs(15))
                .await
        );
    }

    // Identical job, identical input: byte-identical partitions (key order
    // inside a partition is deterministic).
    for r in 0..2 {
        let a = cluster
            .store
            .read(&mapred_lite::blobstore::output_partition("/data/output/rerun-0", r))
            .await
            .unwrap();
        let b = cluster
            .store
            .read(&mapred_lite::blobstore::output_partition("/data/output/rerun-1", r))
            .await
            .unwrap();
        assert_eq!(a, b, "partition {r} differs between reruns");
    }
}
