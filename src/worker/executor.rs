use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::blobstore::{intermediate_partition, output_partition, tmp_path, BlobStore};
use crate::error::MapredError;
use crate::scheduler::job::AttemptOutcome;
use crate::shuffle::{decode_records, encode_record, partition_for_key};
use crate::worker::udf;

/// Byte and record counters reported with each completion.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttemptStats {
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub records_out: u64,
}

/// Result of running one attempt on this worker.
#[derive(Debug)]
pub struct ExecutionResult {
    pub attempt_id: Uuid,
    pub outcome: AttemptOutcome,
    pub stats: AttemptStats,
    pub error: Option<String>,
    /// Temporary blobs the attempt wrote; promoted or deleted according to
    /// the scheduler's disposition.
    pub tmp_outputs: Vec<(String, String)>,
}

impl ExecutionResult {
    fn cancelled(attempt_id: Uuid, tmp_outputs: Vec<(String, String)>) -> Self {
        Self {
            attempt_id,
            outcome: AttemptOutcome::Cancelled,
            stats: AttemptStats::default(),
            error: None,
            tmp_outputs,
        }
    }

    fn failed(attempt_id: Uuid, error: MapredError) -> Self {
        Self {
            attempt_id,
            outcome: AttemptOutcome::Error,
            stats: AttemptStats::default(),
            error: Some(error.to_string()),
            tmp_outputs: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MapTaskSpec {
    pub job_id: Uuid,
    pub task_index: u32,
    pub attempt_id: Uuid,
    pub input_path: String,
    pub split: (u64, u64),
    pub mapper_ref: String,
    pub num_reduces: u32,
}

#[derive(Debug, Clone)]
pub struct ReduceTaskSpec {
    pub job_id: Uuid,
    pub task_index: u32,
    pub attempt_id: Uuid,
    pub num_maps: u32,
    pub reducer_ref: String,
    pub output_path: String,
}

/// Executes map and reduce attempts against the shared blob store.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    store: BlobStore,
    simulate_straggler: bool,
    straggler_delay: Duration,
}

impl TaskExecutor {
    pub fn new(store: BlobStore, simulate_straggler: bool, straggler_delay: Duration) -> Self {
        Self {
            store,
            simulate_straggler,
            straggler_delay,
        }
    }

    /// Test hook: hold the task for `straggler_delay` so the scheduler's
    /// backup machinery has something to chase. Cancellable.
    async fn maybe_straggle(&self, cancel: &CancellationToken) -> bool {
        if !self.simulate_straggler {
            return true;
        }
        tracing::warn!(delay = ?self.straggler_delay, "Simulating straggler");
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.straggler_delay) => true,
        }
    }

    /// Run one map attempt: read the assigned line range, feed each line to
    /// the mapper, partition by key hash, and write every reduce partition
    /// (empty ones included) to its temporary path.
    pub async fn execute_map(&self, spec: MapTaskSpec, cancel: CancellationToken) -> ExecutionResult {
        let attempt_id = spec.attempt_id;
        if !self.maybe_straggle(&cancel).await {
            return ExecutionResult::cancelled(attempt_id, Vec::new());
        }

        let mapper = match udf::resolve_mapper(&spec.mapper_ref) {
            Ok(mapper) => mapper,
            Err(e) => return ExecutionResult::failed(attempt_id, e),
        };
        let lines = match self
            .store
            .read_lines_range(&spec.input_path, spec.split.0, spec.split.1)
            .await
        {
            Ok(lines) => lines,
            Err(e) => return ExecutionResult::failed(attempt_id, e),
        };

        let mut stats = AttemptStats::default();
        let mut partitions: Vec<Vec<u8>> = vec![Vec::new(); spec.num_reduces as usize];
        for line in &lines {
            if cancel.is_cancelled() {
                return ExecutionResult::cancelled(attempt_id, Vec::new());
            }
            stats.bytes_in += line.len() as u64 + 1;
            // A bad line is skipped, not fatal; the rest of the split is
            // still worth mapping.
            let pairs = match mapper.map(line) {
                Ok(pairs) => pairs,
                Err(e) => {
                    tracing::warn!(error = %e, "Mapper error on line; skipping");
                    continue;
                }
            };
            for (key, value) in pairs {
                let r = partition_for_key(&key, spec.num_reduces) as usize;
                encode_record(&mut partitions[r], &key, &value);
                stats.records_out += 1;
            }
        }

        let mut tmp_outputs = Vec::with_capacity(spec.num_reduces as usize);
        for (r, buf) in partitions.iter().enumerate() {
            if cancel.is_cancelled() {
                self.cleanup(&tmp_outputs).await;
                return ExecutionResult::cancelled(attempt_id, Vec::new());
            }
            let canonical = intermediate_partition(spec.job_id, spec.task_index, r as u32);
            let tmp = tmp_path(&canonical, attempt_id);
            if let Err(e) = self.store.write_tmp(&tmp, buf).await {
                self.cleanup(&tmp_outputs).await;
                return ExecutionResult::failed(attempt_id, e);
            }
            stats.bytes_out += buf.len() as u64;
            tmp_outputs.push((tmp, canonical));
        }

        tracing::info!(
            job_id = %spec.job_id,
            task_index = spec.task_index,
            attempt_id = %attempt_id,
            lines = lines.len(),
            records_out = stats.records_out,
            "Map attempt finished"
        );
        ExecutionResult {
            attempt_id,
            outcome: AttemptOutcome::Success,
            stats,
            error: None,
            tmp_outputs,
        }
    }

    /// Run one reduce attempt: merge all M committed partitions for this
    /// index, group by key in sorted order, reduce each group, and write
    /// the output lines to the temporary output partition.
    pub async fn execute_reduce(
        &self,
        spec: ReduceTaskSpec,
        cancel: CancellationToken,
    ) -> ExecutionResult {
        let attempt_id = spec.attempt_id;
        if !self.maybe_straggle(&cancel).await {
            return ExecutionResult::cancelled(attempt_id, Vec::new());
        }

        let reducer = match udf::resolve_reducer(&spec.reducer_ref) {
            Ok(reducer) => reducer,
            Err(e) => return ExecutionResult::failed(attempt_id, e),
        };

        let mut stats = AttemptStats::default();
        // TODO: spill to sorted run files and merge once the partition set
        // outgrows memory; grouping is fully in-memory for now.
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for m in 0..spec.num_maps {
            if cancel.is_cancelled() {
                return ExecutionResult::cancelled(attempt_id, Vec::new());
            }
            let partition = intermediate_partition(spec.job_id, m, spec.task_index);
            let data = match self.store.read(&partition).await {
                Ok(data) => data,
                Err(e) => return ExecutionResult::failed(attempt_id, e),
            };
            stats.bytes_in += data.len() as u64;
            let records = match decode_records(&data) {
                Ok(records) => records,
                Err(e) => return ExecutionResult::failed(attempt_id, e),
            };
            for (key, value) in records {
                groups.entry(key).or_default().push(value);
            }
        }

        let mut output = String::new();
        for (key, values) in &groups {
            if cancel.is_cancelled() {
                return ExecutionResult::cancelled(attempt_id, Vec::new());
            }
            // A key group the reducer chokes on is skipped, not fatal.
            let pairs = match reducer.reduce(key, values) {
                Ok(pairs) => pairs,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Reducer error on key; skipping");
                    continue;
                }
            };
            for (out_key, out_value) in pairs {
                output.push_str(&out_key);
                output.push('\t');
                output.push_str(&out_value);
                output.push('\n');
                stats.records_out += 1;
            }
        }

        let canonical = output_partition(&spec.output_path, spec.task_index);
        let tmp = tmp_path(&canonical, attempt_id);
        if let Err(e) = self.store.write_tmp(&tmp, output.as_bytes()).await {
            return ExecutionResult::failed(attempt_id, e);
        }
        stats.bytes_out = output.len() as u64;

        tracing::info!(
            job_id = %spec.job_id,
            task_index = spec.task_index,
            attempt_id = %attempt_id,
            keys = groups.len(),
            records_out = stats.records_out,
            "Reduce attempt finished"
        );
        ExecutionResult {
            attempt_id,
            outcome: AttemptOutcome::Success,
            stats,
            error: None,
            tmp_outputs: vec![(tmp, canonical)],
        }
    }

    /// Promote this attempt's temporaries to their canonical paths. The
    /// scheduler normally promotes the winner itself, so this is usually a
    /// no-op; promote is idempotent either way.
    pub async fn commit_outputs(&self, tmp_outputs: &[(String, String)]) {
        for (tmp, canonical) in tmp_outputs {
            if let Err(e) = self.store.promote(tmp, canonical).await {
                tracing::warn!(tmp, canonical, error = %e, "Commit-side promote failed");
            }
        }
    }

    /// Delete this attempt's temporaries (losing or cancelled attempts).
    pub async fn cleanup(&self, tmp_outputs: &[(String, String)]) {
        for (tmp, _) in tmp_outputs {
            if let Err(e) = self.store.delete(tmp).await {
                tracing::warn!(tmp, error = %e, "Failed to delete temporary");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn executor(store: &BlobStore) -> TaskExecutor {
        TaskExecutor::new(store.clone(), false, Duration::from_secs(10))
    }

    fn map_spec(job_id: Uuid, index: u32, split: (u64, u64), num_reduces: u32) -> MapTaskSpec {
        MapTaskSpec {
            job_id,
            task_index: index,
            attempt_id: Uuid::new_v4(),
            input_path: "/data/input/words.txt".to_string(),
            split,
            mapper_ref: "wordcount".to_string(),
            num_reduces,
        }
    }

    #[tokio::test]
    async fn test_map_writes_every_partition() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        store
            .write("/data/input/words.txt", b"hello world\nhello again\n")
            .await
            .unwrap();

        let job_id = Uuid::new_v4();
        let spec = map_spec(job_id, 0, (0, 2), 4);
        let result = executor(&store).execute_map(spec, CancellationToken::new()).await;

        assert_eq!(result.outcome, AttemptOutcome::Success);
        assert_eq!(result.stats.records_out, 4);
        // All four partitions written, empty ones included.
        assert_eq!(result.tmp_outputs.len(), 4);
        for (tmp, _) in &result.tmp_outputs {
            assert!(store.exists(tmp).await);
        }
    }

    #[tokio::test]
    async fn test_map_then_reduce_end_to_end() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        store
            .write("/data/input/words.txt", b"hello world\nhello again\n")
            .await
            .unwrap();

        let job_id = Uuid::new_v4();
        let exec = executor(&store);

        let map_result = exec
            .execute_map(map_spec(job_id, 0, (0, 2), 1), CancellationToken::new())
            .await;
        assert_eq!(map_result.outcome, AttemptOutcome::Success);
        exec.commit_outputs(&map_result.tmp_outputs).await;

        let reduce_result = exec
            .execute_reduce(
                ReduceTaskSpec {
                    job_id,
                    task_index: 0,
                    attempt_id: Uuid::new_v4(),
                    num_maps: 1,
                    reducer_ref: "wordcount".to_string(),
                    output_path: "/data/output/wc".to_string(),
                },
                CancellationToken::new(),
            )
            .await;
        assert_eq!(reduce_result.outcome, AttemptOutcome::Success);
        exec.commit_outputs(&reduce_result.tmp_outputs).await;

        let output = store
            .read_to_string("/data/output/wc/reduce-0.txt")
            .await
            .unwrap();
        // BTreeMap grouping makes the key order deterministic.
        assert_eq!(output, "again\t1\nhello\t2\nworld\t1\n");
    }

    #[tokio::test]
    async fn test_unknown_mapper_is_a_user_code_error() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        store.write("/data/input/words.txt", b"x\n").await.unwrap();

        let mut spec = map_spec(Uuid::new_v4(), 0, (0, 1), 1);
        spec.mapper_ref = "definitely-not-registered".to_string();
        let result = executor(&store).execute_map(spec, CancellationToken::new()).await;

        assert_eq!(result.outcome, AttemptOutcome::Error);
        assert!(result.error.unwrap().contains("unknown mapper ref"));
    }

    #[tokio::test]
    async fn test_reduce_skips_keys_the_reducer_rejects() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let job_id = Uuid::new_v4();

        // One key the sum reducer can handle, one it cannot.
        let mut buf = Vec::new();
        crate::shuffle::encode_record(&mut buf, "good", "2");
        crate::shuffle::encode_record(&mut buf, "good", "3");
        crate::shuffle::encode_record(&mut buf, "bad", "not-a-number");
        store
            .write(&intermediate_partition(job_id, 0, 0), &buf)
            .await
            .unwrap();

        let exec = executor(&store);
        let result = exec
            .execute_reduce(
                ReduceTaskSpec {
                    job_id,
                    task_index: 0,
                    attempt_id: Uuid::new_v4(),
                    num_maps: 1,
                    reducer_ref: "wordcount".to_string(),
                    output_path: "/data/output/skips".to_string(),
                },
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.outcome, AttemptOutcome::Success);
        assert_eq!(result.stats.records_out, 1);
        exec.commit_outputs(&result.tmp_outputs).await;

        let output = store
            .read_to_string("/data/output/skips/reduce-0.txt")
            .await
            .unwrap();
        assert_eq!(output, "good\t5\n");
    }

    #[tokio::test]
    async fn test_reduce_fails_when_a_partition_is_missing() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());

        let result = executor(&store)
            .execute_reduce(
                ReduceTaskSpec {
                    job_id: Uuid::new_v4(),
                    task_index: 0,
                    attempt_id: Uuid::new_v4(),
                    num_maps: 1,
                    reducer_ref: "wordcount".to_string(),
                    output_path: "/data/output/x".to_string(),
                },
                CancellationToken::new(),
            )
            .await;
        assert_eq!(result.outcome, AttemptOutcome::Error);
    }

    #[tokio::test]
    async fn test_pre_cancelled_attempt_runs_nothing() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        store.write("/data/input/words.txt", b"a b c\n").await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = executor(&store)
            .execute_map(map_spec(Uuid::new_v4(), 0, (0, 1), 2), cancel)
            .await;
        assert_eq!(result.outcome, AttemptOutcome::Cancelled);
        assert!(result.tmp_outputs.is_empty());
    }
}
