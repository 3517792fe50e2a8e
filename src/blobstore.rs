use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use uuid::Uuid;

use crate::error::{MapredError, Result};

/// The shared blob store: a directory tree mounted by every process,
/// addressed by string paths like `/data/input/book.txt`. All writes go
/// through a unique temporary path and become visible only on rename, so
/// readers never observe partial data and concurrent writers never collide.
#[derive(Debug, Clone)]
pub struct BlobStore {
    root: PathBuf,
}

/// Canonical path of one intermediate shuffle partition.
pub fn intermediate_partition(job_id: Uuid, map_index: u32, reduce_index: u32) -> String {
    format!("/data/intermediate/{job_id}/map-{map_index}-reduce-{reduce_index}.pb")
}

/// Canonical path of one final output partition.
pub fn output_partition(output_path: &str, reduce_index: u32) -> String {
    format!("{}/reduce-{reduce_index}.txt", output_path.trim_end_matches('/'))
}

/// Unique temporary path for an attempt's output.
pub fn tmp_path(final_path: &str, attempt_id: Uuid) -> String {
    format!("{final_path}.tmp.{attempt_id}")
}

impl BlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a store path to a filesystem path under the root.
    /// Store paths are rooted at `/`, e.g. `/data/input/book.txt`.
    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }

    fn io_err(path: &Path, source: std::io::Error) -> MapredError {
        MapredError::BlobStore {
            path: path.to_path_buf(),
            source,
        }
    }

    pub async fn exists(&self, path: &str) -> bool {
        tokio::fs::try_exists(self.resolve(path)).await.unwrap_or(false)
    }

    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        tokio::fs::read(&full).await.map_err(|e| Self::io_err(&full, e))
    }

    pub async fn read_to_string(&self, path: &str) -> Result<String> {
        let full = self.resolve(path);
        tokio::fs::read_to_string(&full)
            .await
            .map_err(|e| Self::io_err(&full, e))
    }

    /// Write bytes to `path` via a unique temporary and an atomic rename.
    pub async fn write(&self, path: &str, contents: &[u8]) -> Result<()> {
        let tmp = tmp_path(path, Uuid::new_v4());
        self.write_tmp(&tmp, contents).await?;
        self.promote(&tmp, path).await
    }

    /// Write bytes directly to a temporary path (no rename). The caller
    /// promotes or discards it later.
    pub async fn write_tmp(&self, tmp: &str, contents: &[u8]) -> Result<()> {
        let full = self.resolve(tmp);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Self::io_err(&full, e))?;
        }
        tokio::fs::write(&full, contents)
            .await
            .map_err(|e| Self::io_err(&full, e))
    }

    /// Promote a temporary to its canonical path. Idempotent: if the
    /// temporary is gone but the canonical blob exists, another party
    /// already promoted it and this is a no-op.
    pub async fn promote(&self, tmp: &str, final_path: &str) -> Result<()> {
        let tmp_full = self.resolve(tmp);
        let final_full = self.resolve(final_path);
        match tokio::fs::rename(&tmp_full, &final_full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if tokio::fs::try_exists(&final_full).await.unwrap_or(false) {
                    Ok(())
                } else {
                    Err(Self::io_err(&tmp_full, e))
                }
            }
            Err(e) => Err(Self::io_err(&tmp_full, e)),
        }
    }

    /// Delete a blob. Missing blobs are fine (cancel and discard are
    /// idempotent).
    pub async fn delete(&self, path: &str) -> Result<()> {
        let full = self.resolve(path);
        match tokio::fs::remove_file(&full).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(&full, e)),
        }
    }

    /// Number of lines in a text blob. Used at submission to derive splits.
    pub async fn line_count(&self, path: &str) -> Result<u64> {
        let contents = self.read_to_string(path).await?;
        Ok(contents.lines().count() as u64)
    }

    /// Read the half-open line range `[start, end)` of a text blob.
    pub async fn read_lines_range(&self, path: &str, start: u64, end: u64) -> Result<Vec<String>> {
        let contents = self.read_to_string(path).await?;
        Ok(contents
            .lines()
            .skip(start as usize)
            .take(end.saturating_sub(start) as usize)
            .map(str::to_string)
            .collect())
    }

    /// Blob paths directly under `dir`, sorted by name.
    pub async fn list(&self, dir: &str) -> Result<Vec<String>> {
        let full = self.resolve(dir);
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&full).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(Self::io_err(&full, e)),
        };
        while let Some(entry) = entries.next_entry().await.map_err(|e| Self::io_err(&full, e))? {
            if entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
                names.push(format!(
                    "{}/{}",
                    dir.trim_end_matches('/'),
                    entry.file_name().to_string_lossy()
                ));
            }
        }
        names.sort();
        Ok(names)
    }

    /// Delete temporaries under `dir` (recursively) older than `max_age`.
    /// Returns the number removed.
    pub async fn gc_tmp(&self, dir: &str, max_age: Duration) -> Result<usize> {
        let full = self.resolve(dir);
        let cutoff = SystemTime::now() - max_age;
        let mut removed = 0;
        let mut stack = vec![full];
        while let Some(current) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&current).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(Self::io_err(&current, e)),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Self::io_err(&current, e))?
            {
                let path = entry.path();
                let file_type = match entry.file_type().await {
                    Ok(t) => t,
                    Err(_) => continue,
                };
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                let name = entry.file_name();
                let is_tmp = name.to_string_lossy().contains(".tmp.");
                if !is_tmp {
                    continue;
                }
                let modified = entry
                    .metadata()
                    .await
                    .and_then(|m| m.modified())
                    .unwrap_or(SystemTime::UNIX_EPOCH);
                if modified < cutoff && tokio::fs::remove_file(&path).await.is_ok() {
                    tracing::debug!(path = %path.display(), "Garbage-collected stale temporary");
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());

        store.write("/data/input/a.txt", b"hello\nworld\n").await.unwrap();
        assert!(store.exists("/data/input/a.txt").await);
        assert_eq!(store.read("/data/input/a.txt").await.unwrap(), b"hello\nworld\n");
        assert_eq!(store.line_count("/data/input/a.txt").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_promote_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let attempt = Uuid::new_v4();
        let tmp = tmp_path("/data/out/f.txt", attempt);

        store.write_tmp(&tmp, b"payload").await.unwrap();
        store.promote(&tmp, "/data/out/f.txt").await.unwrap();
        // Second promote finds no tmp but the final blob exists.
        store.promote(&tmp, "/data/out/f.txt").await.unwrap();
        assert_eq!(store.read("/data/out/f.txt").await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn test_promote_fails_when_nothing_exists() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        let tmp = tmp_path("/data/out/g.txt", Uuid::new_v4());
        assert!(store.promote(&tmp, "/data/out/g.txt").await.is_err());
    }

    #[tokio::test]
    async fn test_read_lines_range() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        store.write("/data/input/b.txt", b"a\nb\nc\nd\n").await.unwrap();

        let lines = store.read_lines_range("/data/input/b.txt", 1, 3).await.unwrap();
        assert_eq!(lines, vec!["b", "c"]);

        // Range past the end is just empty.
        let lines = store.read_lines_range("/data/input/b.txt", 4, 4).await.unwrap();
        assert!(lines.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());
        store.delete("/data/never/was.txt").await.unwrap();
    }

    #[tokio::test]
    async fn test_gc_only_removes_old_temporaries() {
        let dir = tempdir().unwrap();
        let store = BlobStore::new(dir.path());

        let tmp = tmp_path("/data/intermediate/j/part.pb", Uuid::new_v4());
        store.write_tmp(&tmp, b"stale").await.unwrap();
        store.write("/data/intermediate/j/part.pb", b"canonical").await.unwrap();

        // With a large max_age nothing qualifies.
        assert_eq!(store.gc_tmp("/data/intermediate", Duration::from_secs(3600)).await.unwrap(), 0);
        // With zero max_age the temporary goes, the canonical blob stays.
        assert_eq!(store.gc_tmp("/data/intermediate", Duration::ZERO).await.unwrap(), 1);
        assert!(!store.exists(&tmp).await);
        assert!(store.exists("/data/intermediate/j/part.pb").await);
    }

    #[test]
    fn test_partition_paths() {
        let job = Uuid::nil();
        assert_eq!(
            intermediate_partition(job, 3, 1),
            format!("/data/intermediate/{job}/map-3-reduce-1.pb")
        );
        assert_eq!(output_partition("/data/output/wc/", 2), "/data/output/wc/reduce-2.txt");
    }
}
