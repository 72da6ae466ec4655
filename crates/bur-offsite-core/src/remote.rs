//! RemoteStore: the SSH/rsync surface the upload/download/retention engines talk to
//! (spec §4.2, §4.3).
//!
//! Narrowed from the teacher's multi-cloud `StorageBackend` trait down to the operations the
//! source's `utils/remote.py` and `rsync_manager.py` actually perform over SSH.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{RemoteError, RemoteResult};
use crate::model::TransferStats;
use crate::process;

const RSYNC_SSH_ARGS: &str = "-ahce ssh";
const RSYNC_DAEMON_ARGS: &str = "-ahc";
const NUMBER_TRIES: u32 = 3;

/// Shared handle to the off-site archive, cloned into pool tasks spawned by the engines.
pub type SharedStore = Arc<dyn RemoteStore>;

/// Operations the upload/download/retention engines need against the off-site archive.
///
/// One implementor (`SshRsyncStore`) shells out over SSH; tests use an in-memory
/// `FakeRemoteStore` so engine logic can be exercised without a real host.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn path_exists(&self, remote_path: &str) -> RemoteResult<bool>;

    async fn mkdir_p(&self, remote_path: &str) -> RemoteResult<()>;

    /// Remove a remote directory and confirm it is gone afterward.
    async fn remove_dir(&self, remote_path: &str) -> RemoteResult<()>;

    /// List immediate entries under `remote_path` matching `glob` (e.g. `"*"`).
    async fn list(&self, remote_path: &str, glob: &str) -> RemoteResult<Vec<String>>;

    /// `(file_count, dir_count)` beneath `remote_path`.
    async fn count_content(&self, remote_path: &str) -> RemoteResult<(usize, usize)>;

    async fn size_mb(&self, remote_path: &str) -> RemoteResult<u64>;

    /// Upload `local_path` to `remote_path`, returning rsync's `--stats` summary.
    async fn put(&self, local_path: &Path, remote_path: &str) -> RemoteResult<TransferStats>;

    /// Download `remote_path` to `local_path`, returning rsync's `--stats` summary.
    async fn get(&self, remote_path: &str, local_path: &Path) -> RemoteResult<TransferStats>;

    /// Order `paths` newest-first by the mtime of their most-recently-modified non-empty
    /// descendant file, matching the source's `sort_remote_folders_by_content`. Paths with no
    /// files are dropped.
    async fn sort_by_newest_content(&self, paths: &[String]) -> RemoteResult<Vec<String>>;
}

/// SSH+rsync implementation, mirroring `utils/remote.py` and `rsync_manager.py` exactly.
#[derive(Debug, Clone)]
pub struct SshRsyncStore {
    host_address: String,
    use_ssh: bool,
    ssh_timeout: Duration,
}

impl SshRsyncStore {
    pub fn new(host_address: impl Into<String>, use_ssh: bool, ssh_timeout: Duration) -> Self {
        Self {
            host_address: host_address.into(),
            use_ssh,
            ssh_timeout,
        }
    }

    async fn ssh(&self, command: &str) -> RemoteResult<process::ProcessOutput> {
        process::run_ssh(&self.host_address, command, self.ssh_timeout)
            .await
            .map_err(|e| map_process_err(e, &self.host_address, command))
    }

    fn rsync_args(&self) -> &'static str {
        if self.use_ssh {
            RSYNC_SSH_ARGS
        } else {
            RSYNC_DAEMON_ARGS
        }
    }
}

#[async_trait]
impl RemoteStore for SshRsyncStore {
    async fn path_exists(&self, remote_path: &str) -> RemoteResult<bool> {
        let command = format!("test -d {remote_path} || test -f {remote_path}");
        let out = self.ssh(&command).await?;
        Ok(out.status_success)
    }

    async fn mkdir_p(&self, remote_path: &str) -> RemoteResult<()> {
        let command = format!(
            "test -d {remote_path} || mkdir -p {remote_path}",
        );
        let out = self.ssh(&command).await?;
        if !out.status_success {
            return Err(RemoteError::Ssh {
                host: self.host_address.clone(),
                stderr: out.stderr,
            });
        }
        Ok(())
    }

    async fn remove_dir(&self, remote_path: &str) -> RemoteResult<()> {
        let command = format!("rm -rf {remote_path}");
        self.ssh(&command).await?;

        let still_there = self.path_exists(remote_path).await?;
        if still_there {
            return Err(RemoteError::Ssh {
                host: self.host_address.clone(),
                stderr: format!("'{remote_path}' still exists after rm -rf"),
            });
        }
        Ok(())
    }

    async fn list(&self, remote_path: &str, glob: &str) -> RemoteResult<Vec<String>> {
        let command = format!("find {remote_path} -name '{glob}'");
        let out = self.ssh(&command).await?;
        if !out.status_success {
            return Err(RemoteError::Ssh {
                host: self.host_address.clone(),
                stderr: out.stderr,
            });
        }
        Ok(out
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect())
    }

    async fn count_content(&self, remote_path: &str) -> RemoteResult<(usize, usize)> {
        let command = format!(
            "find {remote_path} -type f | wc -l && find {remote_path} -mindepth 1 -type d | wc -l"
        );
        let out = self.ssh(&command).await?;
        if !out.status_success {
            return Err(RemoteError::Ssh {
                host: self.host_address.clone(),
                stderr: out.stderr,
            });
        }
        let mut lines = out.stdout.lines().map(str::trim);
        let files = parse_count(lines.next(), "file count")?;
        let dirs = parse_count(lines.next(), "dir count")?;
        Ok((files, dirs))
    }

    async fn size_mb(&self, remote_path: &str) -> RemoteResult<u64> {
        let command = format!("du -bms {remote_path}");
        let out = self.ssh(&command).await?;
        if !out.status_success {
            return Err(RemoteError::Ssh {
                host: self.host_address.clone(),
                stderr: out.stderr,
            });
        }
        let field = out
            .stdout
            .split_whitespace()
            .next()
            .ok_or_else(|| RemoteError::ParseFailure {
                what: "du output".into(),
                detail: out.stdout.clone(),
            })?;
        field.parse::<u64>().map_err(|_| RemoteError::ParseFailure {
            what: "du output".into(),
            detail: out.stdout,
        })
    }

    async fn put(&self, local_path: &Path, remote_path: &str) -> RemoteResult<TransferStats> {
        let local_count = count_local_files(local_path).await.map_err(RemoteError::Io)?;
        let dst = format!("{}:{remote_path}", self.host_address);
        let args = self.rsync_args();

        let mut last_err = None;
        for attempt in 1..=NUMBER_TRIES {
            match run_rsync_once(args, &local_path.display().to_string(), &dst, self.ssh_timeout).await {
                Ok(stats) if stats.transferred == local_count => return Ok(stats),
                Ok(stats) => {
                    last_err = Some(
                        RemoteError::Transfer {
                            path: local_path.display().to_string(),
                            expected: local_count,
                            actual: stats.transferred,
                        }
                        .also_log("transferred count did not match the local file count", attempt),
                    )
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(RemoteError::Transfer {
            path: local_path.display().to_string(),
            expected: local_count,
            actual: 0,
        }))
    }

    async fn get(&self, remote_path: &str, local_path: &Path) -> RemoteResult<TransferStats> {
        let src = format!("{}:{remote_path}", self.host_address);
        let args = self.rsync_args();

        let mut last_err = None;
        for attempt in 1..=NUMBER_TRIES {
            match run_rsync_once(args, &src, &local_path.display().to_string(), self.ssh_timeout).await {
                Ok(stats) => {
                    let dest_count = count_local_files(local_path).await.unwrap_or(0);
                    let (origin_count, _) = self.count_content(remote_path).await?;
                    if stats.transferred == dest_count && stats.transferred == origin_count {
                        return Ok(stats);
                    }
                    last_err = Some(
                        RemoteError::Transfer {
                            path: remote_path.to_owned(),
                            expected: origin_count,
                            actual: stats.transferred,
                        }
                        .also_log("transferred count did not match the origin/destination file count", attempt),
                    );
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(last_err.unwrap_or(RemoteError::Transfer {
            path: remote_path.to_owned(),
            expected: 0,
            actual: 0,
        }))
    }

    async fn sort_by_newest_content(&self, paths: &[String]) -> RemoteResult<Vec<String>> {
        let mut dated = Vec::with_capacity(paths.len());
        for path in paths {
            let command = format!(
                "find {path} ! -path {path} -printf '%T+\\t%p\\n' | sort | head -1"
            );
            let out = self.ssh(&command).await?;
            if let Some(line) = out.stdout.lines().next() {
                if let Some((stamp, _)) = line.split_once('\t') {
                    dated.push((stamp.to_owned(), path.clone()));
                }
            }
        }
        dated.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(dated.into_iter().map(|(_, path)| path).collect())
    }
}

fn map_process_err(err: process::ProcessError, host: &str, command: &str) -> RemoteError {
    match err {
        process::ProcessError::Timeout { timeout_secs, .. } => RemoteError::Timeout {
            host: host.to_owned(),
            command: command.to_owned(),
            timeout_secs,
        },
        process::ProcessError::Spawn { source, .. } => RemoteError::Io(source),
    }
}

fn parse_count(line: Option<&str>, what: &str) -> RemoteResult<usize> {
    line.and_then(|l| l.parse::<usize>().ok())
        .ok_or_else(|| RemoteError::ParseFailure {
            what: what.to_owned(),
            detail: line.unwrap_or_default().to_owned(),
        })
}

/// Run rsync with `--stats` once and parse the stats block, per `rsync_manager.py`. Callers
/// own the retry loop, since success also depends on a file-count check only they can make.
async fn run_rsync_once(rsync_args: &str, src: &str, dst: &str, timeout_duration: Duration) -> RemoteResult<TransferStats> {
    let args: Vec<&str> = rsync_args.split_whitespace().chain(["--stats", src, dst]).collect();

    let out = process::run("rsync", &args, timeout_duration)
        .await
        .map_err(|e| map_process_err(e, dst, "rsync"))?;
    if !out.status_success {
        tracing::warn!(stderr = %out.stderr, "rsync process exited non-zero");
        return Err(RemoteError::Transfer {
            path: src.to_owned(),
            expected: 0,
            actual: 0,
        });
    }
    parse_rsync_stats(&out.stdout)
}

impl RemoteError {
    fn also_log(self, reason: &str, attempt: u32) -> Self {
        tracing::warn!(attempt, reason, "rsync transfer attempt failed");
        self
    }
}

/// Count regular files under `path`, recursively; a single file counts as 1. Mirrors the
/// source's `get_number_of_content_from_path` file-counting half.
async fn count_local_files(path: &Path) -> std::io::Result<usize> {
    let meta = tokio::fs::metadata(path).await?;
    if meta.is_file() {
        return Ok(1);
    }

    let mut total = 0usize;
    let mut stack = vec![path.to_owned()];
    while let Some(current) = stack.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.metadata().await?.is_dir() {
                stack.push(entry.path());
            } else {
                total += 1;
            }
        }
    }
    Ok(total)
}

/// Parse rsync's `--stats` block for the fields `rsync_manager.py` reads.
fn parse_rsync_stats(stdout: &str) -> RemoteResult<TransferStats> {
    let mut total_files = None;
    let mut created = None;
    let mut deleted = None;
    let mut transferred = None;
    let mut rate = None;
    let mut speedup = None;

    for line in stdout.lines() {
        let line = line.trim();
        if let Some(v) = line.strip_prefix("Number of files:") {
            total_files = first_number(v);
        } else if let Some(v) = line.strip_prefix("Number of created files:") {
            created = first_number(v);
        } else if let Some(v) = line.strip_prefix("Number of deleted files:") {
            deleted = first_number(v);
        } else if let Some(v) = line.strip_prefix("Number of regular files transferred:") {
            transferred = first_number(v);
        } else if let Some(v) = line.strip_prefix("sent ") {
            if let Some(idx) = v.find("bytes/sec") {
                rate = v[..idx].rsplit(' ').nth(1).map(str::to_owned);
            }
        } else if let Some(v) = line.strip_prefix("speedup is ") {
            speedup = Some(v.trim_end_matches('.').to_owned());
        }
    }

    Ok(TransferStats {
        total_files: total_files.unwrap_or(0),
        created: created.unwrap_or(0),
        deleted: deleted.unwrap_or(0),
        transferred: transferred.unwrap_or(0),
        rate: rate.unwrap_or_default(),
        speedup: speedup.unwrap_or_default(),
    })
}

fn first_number(s: &str) -> Option<usize> {
    s.trim()
        .split(|c: char| !c.is_ascii_digit())
        .find(|chunk| !chunk.is_empty())
        .and_then(|n| n.parse().ok())
}

/// In-memory double for integration tests: no process is ever spawned.
///
/// Models a directory tree well enough to exercise real listing/retention logic: every
/// `mkdir_p`/`put` registers the path as existing and links it into its parent's child list,
/// the way `find`'s output would on a real host.
#[cfg(any(test, feature = "test-support"))]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Node {
        is_file: bool,
        mtime_rank: u64,
    }

    #[derive(Debug, Default)]
    pub struct FakeRemoteStore {
        nodes: Mutex<HashMap<String, Node>>,
        children: Mutex<HashMap<String, Vec<String>>>,
        next_mtime_rank: Mutex<u64>,
    }

    impl FakeRemoteStore {
        pub fn new() -> Self {
            Self::default()
        }

        fn register(&self, path: &str, is_file: bool) {
            let rank = {
                let mut next = self.next_mtime_rank.lock().unwrap();
                *next += 1;
                *next
            };
            self.nodes.lock().unwrap().insert(path.to_owned(), Node { is_file, mtime_rank: rank });

            if let Some((parent, _)) = path.rsplit_once('/') {
                if !parent.is_empty() {
                    self.nodes.lock().unwrap().entry(parent.to_owned()).or_insert_with(|| Node {
                        is_file: false,
                        mtime_rank: 0,
                    });
                    let mut children = self.children.lock().unwrap();
                    let entry = children.entry(parent.to_owned()).or_default();
                    if !entry.iter().any(|c| c == path) {
                        entry.push(path.to_owned());
                    }
                }
            }
        }
    }

    #[async_trait]
    impl RemoteStore for FakeRemoteStore {
        async fn path_exists(&self, remote_path: &str) -> RemoteResult<bool> {
            Ok(self.nodes.lock().unwrap().contains_key(remote_path))
        }

        async fn mkdir_p(&self, remote_path: &str) -> RemoteResult<()> {
            if !self.nodes.lock().unwrap().contains_key(remote_path) {
                self.register(remote_path, false);
            }
            Ok(())
        }

        async fn remove_dir(&self, remote_path: &str) -> RemoteResult<()> {
            self.nodes.lock().unwrap().remove(remote_path);
            self.children.lock().unwrap().remove(remote_path);
            if let Some((parent, _)) = remote_path.rsplit_once('/') {
                if let Some(siblings) = self.children.lock().unwrap().get_mut(parent) {
                    siblings.retain(|c| c != remote_path);
                }
            }
            Ok(())
        }

        async fn list(&self, remote_path: &str, _glob: &str) -> RemoteResult<Vec<String>> {
            Ok(self.children.lock().unwrap().get(remote_path).cloned().unwrap_or_default())
        }

        async fn count_content(&self, remote_path: &str) -> RemoteResult<(usize, usize)> {
            let children = self.children.lock().unwrap().get(remote_path).cloned().unwrap_or_default();
            let nodes = self.nodes.lock().unwrap();
            let files = children.iter().filter(|c| nodes.get(*c).map(|n| n.is_file).unwrap_or(false)).count();
            let dirs = children.len() - files;
            Ok((files, dirs))
        }

        async fn size_mb(&self, _remote_path: &str) -> RemoteResult<u64> {
            Ok(0)
        }

        async fn put(&self, _local_path: &Path, remote_path: &str) -> RemoteResult<TransferStats> {
            self.register(remote_path, true);
            Ok(TransferStats {
                total_files: 1,
                created: 1,
                deleted: 0,
                transferred: 1,
                rate: "0.00MB/s".into(),
                speedup: "1.00".into(),
            })
        }

        async fn get(&self, remote_path: &str, _local_path: &Path) -> RemoteResult<TransferStats> {
            let count = if self.nodes.lock().unwrap().contains_key(remote_path) { 1 } else { 0 };
            Ok(TransferStats {
                total_files: count,
                created: 0,
                deleted: 0,
                transferred: count,
                rate: "0.00MB/s".into(),
                speedup: "1.00".into(),
            })
        }

        async fn sort_by_newest_content(&self, paths: &[String]) -> RemoteResult<Vec<String>> {
            let nodes = self.nodes.lock().unwrap();
            let children = self.children.lock().unwrap();

            let mut dated: Vec<(u64, String)> = paths
                .iter()
                .filter(|p| children.get(*p).map(|c| !c.is_empty()).unwrap_or(false))
                .map(|p| {
                    let oldest = children[p]
                        .iter()
                        .filter_map(|c| nodes.get(c).map(|n| n.mtime_rank))
                        .min()
                        .unwrap_or(0);
                    (oldest, p.clone())
                })
                .collect();
            dated.sort_by(|a, b| b.0.cmp(&a.0));
            Ok(dated.into_iter().map(|(_, path)| path).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rsync_stats_block() {
        let stdout = "\
Number of files: 12
Number of created files: 3
Number of deleted files: 0
Number of regular files transferred: 3
sent 1024 bytes  received 35 bytes  100.00 bytes/sec
total size is 900  speedup is 0.85
";
        let stats = parse_rsync_stats(stdout).unwrap();
        assert_eq!(stats.total_files, 12);
        assert_eq!(stats.created, 3);
        assert_eq!(stats.transferred, 3);
        assert_eq!(stats.speedup, "0.85");
    }

    #[tokio::test]
    async fn fake_store_put_then_get_roundtrips_count() {
        let store = fake::FakeRemoteStore::new();
        let tmp = tempfile::NamedTempFile::new().unwrap();
        store.put(tmp.path(), "/archive/cust/tag").await.unwrap();
        let stats = store.get("/archive/cust/tag", tmp.path()).await.unwrap();
        assert_eq!(stats.total_files, 1);
    }
}
