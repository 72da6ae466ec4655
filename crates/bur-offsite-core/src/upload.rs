//! UploadEngine: per-backup upload state machine (spec §4.5).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::context::RunContext;
use crate::crypto::CryptoCodec;
use crate::descriptor::Descriptor;
use crate::error::{BurError, BurResult};
use crate::model::{
    Customer, UploadVolumeState, VolumeOutcome, BACKUP_METADATA_FILE, FILE_LIST_DESCRIPTOR,
    SUCCESS_FLAG_FILE, VOLUME_LIST_DESCRIPTOR,
};
use crate::remote::SharedStore;
use crate::validator::Validator;
use crate::volume::VolumeProcessor;

#[derive(Debug)]
pub struct UploadOutcome {
    pub tag: String,
    pub volumes_transferred: usize,
}

pub struct UploadEngine {
    ctx: Arc<RunContext>,
    processor: VolumeProcessor,
    validator: Validator,
    descriptor: Descriptor,
}

impl UploadEngine {
    pub fn new(ctx: Arc<RunContext>, codec: CryptoCodec) -> Self {
        let processor = VolumeProcessor::new(codec, ctx.ssh_timeout);
        Self {
            ctx,
            processor,
            validator: Validator::new(),
            descriptor: Descriptor::new(),
        }
    }

    /// Upload every backup tag under `customer.local_backup_root` in mtime order, or just
    /// `backup_tag` if given. Failures on one backup do not stop the next.
    pub async fn process_customer(
        &self,
        store: &SharedStore,
        customer: &Customer,
        full_root: &str,
        backup_tag: Option<&str>,
    ) -> BurResult<Vec<BurResult<UploadOutcome>>> {
        let tags = match backup_tag {
            Some(tag) => vec![tag.to_owned()],
            None => self.list_local_backup_tags(customer, &customer.local_backup_root).await?,
        };

        let mut results = Vec::with_capacity(tags.len());
        for tag in tags {
            let customer_name = customer.name.clone();
            let tag_owned = tag.clone();
            let result = match self.ctx.max_delay {
                Some(limit) => {
                    crate::watchdog::watch(
                        limit,
                        self.process_backup(store, customer, full_root, &tag),
                        move || {
                            tracing::warn!(customer = %customer_name, tag = %tag_owned, "backup is taking longer than the configured max delay");
                        },
                    )
                    .await
                }
                None => self.process_backup(store, customer, full_root, &tag).await,
            };
            results.push(result);
        }
        Ok(results)
    }

    /// Only tags that pass `validate_backup_per_volume` are returned, oldest (by directory
    /// mtime) first, matching `get_local_backup_list`.
    async fn list_local_backup_tags(&self, customer: &Customer, local_backup_root: &Path) -> BurResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(local_backup_root)
            .await
            .map_err(|e| BurError::Config(e.to_string()))?;

        let mut candidates = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| BurError::Config(e.to_string()))? {
            if entry.file_type().await.map_err(|e| BurError::Config(e.to_string()))?.is_dir() {
                candidates.push(entry.file_name().to_string_lossy().into_owned());
            }
        }

        let mut tagged = Vec::with_capacity(candidates.len());
        for tag in candidates {
            let backup_path = local_backup_root.join(&tag);
            let volume_dirs = match subdirectory_names(&backup_path).await {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!(tag, error = %e, "skipping unreadable backup directory");
                    continue;
                }
            };

            if let Err(e) = self
                .validator
                .validate_backup_per_volume(customer, &backup_path, &volume_dirs)
                .await
            {
                tracing::warn!(tag, error = %e, "skipping invalid backup directory");
                continue;
            }

            let mtime = tokio::fs::metadata(&backup_path)
                .await
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
            tagged.push((tag, mtime));
        }

        tagged.sort_by_key(|(_, mtime)| *mtime);
        Ok(tagged.into_iter().map(|(tag, _)| tag).collect())
    }

    /// `ProcessBackup`: prepare, partition, encode, transfer, join, check, metadata,
    /// descriptors, cleanup.
    pub async fn process_backup(
        &self,
        store: &SharedStore,
        customer: &Customer,
        full_root: &str,
        tag: &str,
    ) -> BurResult<UploadOutcome> {
        let remote_backup_path = format!("{full_root}/{}/{tag}", customer.name);
        let local_backup_path = customer.local_backup_root.join(tag);
        let tmp_backup_path = self.ctx.tmp_root.join(&customer.name).join(tag);

        self.prepare(store, &remote_backup_path, &tmp_backup_path, &local_backup_path)
            .await?;

        let (volumes, top_level_files) = self.partition_backup(&local_backup_path).await?;

        let classified = self
            .partition_volumes(store, &remote_backup_path, &tmp_backup_path, &volumes)
            .await?;

        let outcomes = self
            .encode_and_transfer(store, &remote_backup_path, &local_backup_path, &tmp_backup_path, classified)
            .await?;

        let failed: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.status)
            .map(|o| format!("{}: {}", o.volume_path.display(), o.output))
            .collect();
        if !failed.is_empty() {
            return Err(BurError::Encode {
                volume: tag.to_owned(),
                reason: failed.join("; "),
            });
        }

        self.transfer_metadata_files(
            store,
            &remote_backup_path,
            &local_backup_path,
            &tmp_backup_path,
            &top_level_files,
        )
        .await?;

        self.write_descriptors_if_absent(store, &remote_backup_path, &volumes, &top_level_files)
            .await?;

        if let Err(e) = tokio::fs::remove_dir_all(&tmp_backup_path).await {
            tracing::warn!(tag, error = %e, "failed to clean up on-site temp directory");
        }

        Ok(UploadOutcome {
            tag: tag.to_owned(),
            volumes_transferred: outcomes.len(),
        })
    }

    async fn prepare(
        &self,
        store: &SharedStore,
        remote_backup_path: &str,
        tmp_backup_path: &Path,
        local_backup_path: &Path,
    ) -> BurResult<()> {
        store.mkdir_p(remote_backup_path).await.map_err(BurError::Transfer)?;
        tokio::fs::create_dir_all(tmp_backup_path)
            .await
            .map_err(|e| BurError::Config(e.to_string()))?;

        let required_mb = dir_size_mb(local_backup_path).await.unwrap_or(0);
        let available_mb = available_space_mb(tmp_backup_path).await.unwrap_or(u64::MAX);
        self.validator
            .check_disk_space(&tmp_backup_path.display().to_string(), required_mb, available_mb)?;
        Ok(())
    }

    async fn partition_backup(&self, local_backup_path: &Path) -> BurResult<(Vec<String>, Vec<String>)> {
        let mut entries = tokio::fs::read_dir(local_backup_path)
            .await
            .map_err(|e| BurError::Config(e.to_string()))?;

        let mut volumes = Vec::new();
        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| BurError::Config(e.to_string()))? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await.map_err(|e| BurError::Config(e.to_string()))?.is_dir() {
                volumes.push(name);
            } else {
                files.push(name);
            }
        }

        if volumes.is_empty() || files.is_empty() {
            return Err(BurError::Encode {
                volume: local_backup_path.display().to_string(),
                reason: "backup directory has no volumes or no top-level files".into(),
            });
        }
        volumes.sort();
        files.sort();
        Ok((volumes, files))
    }

    async fn partition_volumes(
        &self,
        store: &SharedStore,
        remote_backup_path: &str,
        tmp_backup_path: &Path,
        volumes: &[String],
    ) -> BurResult<Vec<(String, UploadVolumeState)>> {
        let mut classified = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let remote_tar = format!("{remote_backup_path}/{volume}.tar");
            if store.path_exists(&remote_tar).await.map_err(BurError::Transfer)? {
                classified.push((volume.clone(), UploadVolumeState::Transferred));
                continue;
            }

            let tmp_tar = tmp_backup_path.join(format!("{volume}.tar"));
            if tmp_tar.is_file() {
                classified.push((volume.clone(), UploadVolumeState::Processed));
                continue;
            }

            let tmp_volume_dir = tmp_backup_path.join(volume);
            if tmp_volume_dir.is_dir() {
                let _ = tokio::fs::remove_dir_all(&tmp_volume_dir).await;
            }

            classified.push((volume.clone(), UploadVolumeState::Pending));
        }
        Ok(classified)
    }

    /// Runs the process pool (encode) feeding the transfer pool (put) as soon as each volume
    /// outcome arrives, then joins both, per spec §4.5 steps 3-5.
    async fn encode_and_transfer(
        &self,
        store: &SharedStore,
        remote_backup_path: &str,
        local_backup_path: &Path,
        tmp_backup_path: &Path,
        classified: Vec<(String, UploadVolumeState)>,
    ) -> BurResult<Vec<VolumeOutcome>> {
        let encode_permits = Arc::new(Semaphore::new(self.ctx.process_pool_size.max(1)));
        let mut encode_set = tokio::task::JoinSet::new();

        for (volume, state) in classified {
            match state {
                UploadVolumeState::Transferred => continue,
                UploadVolumeState::Processed => {
                    let tar_path = tmp_backup_path.join(format!("{volume}.tar"));
                    encode_set.spawn(async move { VolumeOutcome::ok(tar_path) });
                }
                UploadVolumeState::Pending | UploadVolumeState::Unfinished => {
                    let processor = self.processor.clone();
                    let volume_dir = local_backup_path.join(&volume);
                    let tmp_volume_dir = tmp_backup_path.join(&volume);
                    let thread_pool_size = self.ctx.thread_pool_size;
                    let permits = encode_permits.clone();
                    encode_set.spawn(async move {
                        let _permit = permits.acquire_owned().await.expect("semaphore not closed");
                        match processor.encode(&volume_dir, &tmp_volume_dir, thread_pool_size).await {
                            Ok(outcome) => outcome,
                            Err(e) => VolumeOutcome::failed(tmp_volume_dir, e.to_string()),
                        }
                    });
                }
            }
        }

        let transfer_permits = Arc::new(Semaphore::new(self.ctx.transfer_pool_size.max(1)));
        let mut transfer_set = tokio::task::JoinSet::new();

        while let Some(joined) = encode_set.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => VolumeOutcome::failed(PathBuf::new(), join_err.to_string()),
            };

            if !outcome.status {
                transfer_set.spawn(async move { outcome });
                continue;
            }

            let permits = transfer_permits.clone();
            let store = store.clone();
            let remote_backup_path = remote_backup_path.to_owned();
            transfer_set.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore not closed");
                put_volume(store, remote_backup_path, outcome).await
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = transfer_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => outcomes.push(VolumeOutcome::failed(PathBuf::new(), join_err.to_string())),
            }
        }
        Ok(outcomes)
    }

    async fn transfer_metadata_files(
        &self,
        store: &SharedStore,
        remote_backup_path: &str,
        local_backup_path: &Path,
        tmp_backup_path: &Path,
        top_level_files: &[String],
    ) -> BurResult<()> {
        let mut pending_success_flag = false;

        for file in top_level_files {
            let remote_file_path = format!("{remote_backup_path}/{file}");
            if store.path_exists(&remote_file_path).await.map_err(BurError::Transfer)? {
                tracing::warn!(file, "metadata file already present on remote, skipping");
                continue;
            }

            if file == SUCCESS_FLAG_FILE {
                pending_success_flag = true;
                continue;
            }

            if file == BACKUP_METADATA_FILE {
                self.transfer_encrypted_metadata(store, remote_backup_path, local_backup_path, tmp_backup_path, file)
                    .await?;
            } else {
                tracing::info!(file, "ignoring unrecognised top-level file");
            }
        }

        // BACKUP_OK is the atomic completion marker and MUST be written last.
        if pending_success_flag {
            let local = local_backup_path.join(SUCCESS_FLAG_FILE);
            let remote = format!("{remote_backup_path}/{SUCCESS_FLAG_FILE}");
            store.put(&local, &remote).await.map_err(BurError::Transfer)?;
        }

        Ok(())
    }

    async fn transfer_encrypted_metadata(
        &self,
        store: &SharedStore,
        remote_backup_path: &str,
        local_backup_path: &Path,
        tmp_backup_path: &Path,
        file: &str,
    ) -> BurResult<()> {
        let src = local_backup_path.join(file);
        let encrypted = self
            .processor
            .codec_ref()
            .encrypt_one(&src, tmp_backup_path)
            .await
            .map_err(BurError::Crypto)?;

        let tar_path = tmp_backup_path.join(format!("{file}.tar"));
        let out = crate::process::run(
            "tar",
            &[
                "-cf",
                tar_path.to_str().unwrap_or_default(),
                "-C",
                tmp_backup_path.to_str().unwrap_or_default(),
                encrypted
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default(),
            ],
            self.ctx.ssh_timeout,
        )
        .await
        .map_err(|e| BurError::Encode {
            volume: file.to_owned(),
            reason: e.to_string(),
        })?;
        if !out.status_success {
            return Err(BurError::Encode {
                volume: file.to_owned(),
                reason: out.stderr,
            });
        }

        let remote_tar = format!("{remote_backup_path}/{file}.tar");
        store.put(&tar_path, &remote_tar).await.map_err(BurError::Transfer)?;

        let _ = tokio::fs::remove_file(&encrypted).await;
        let _ = tokio::fs::remove_file(&tar_path).await;
        Ok(())
    }

    async fn write_descriptors_if_absent(
        &self,
        store: &SharedStore,
        remote_backup_path: &str,
        volumes: &[String],
        top_level_files: &[String],
    ) -> BurResult<()> {
        self.write_descriptor_if_absent(store, remote_backup_path, VOLUME_LIST_DESCRIPTOR, volumes)
            .await?;
        self.write_descriptor_if_absent(store, remote_backup_path, FILE_LIST_DESCRIPTOR, top_level_files)
            .await
    }

    async fn write_descriptor_if_absent(
        &self,
        store: &SharedStore,
        remote_backup_path: &str,
        name: &str,
        names: &[String],
    ) -> BurResult<()> {
        let remote_path = format!("{remote_backup_path}/{name}");
        if store.path_exists(&remote_path).await.map_err(BurError::Transfer)? {
            return Ok(());
        }

        let tmp_file = std::env::temp_dir().join(name);
        self.descriptor.write(&tmp_file, names).await?;
        store.put(&tmp_file, &remote_path).await.map_err(BurError::Transfer)?;
        tokio::fs::remove_file(&tmp_file).await.map_err(|e| BurError::Encode {
            volume: name.to_owned(),
            reason: e.to_string(),
        })
    }
}

/// `RemoteStore.Put` a finished volume archive, removing the local `.tar` on success.
async fn put_volume(store: SharedStore, remote_backup_path: String, mut outcome: VolumeOutcome) -> VolumeOutcome {
    let remote_path = format!(
        "{remote_backup_path}/{}",
        outcome
            .volume_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    let transfer_start = std::time::Instant::now();
    match store.put(&outcome.volume_path, &remote_path).await {
        Ok(stats) => {
            outcome.transfer_time = transfer_start.elapsed();
            outcome.transfer_stats = Some(stats);
            let _ = tokio::fs::remove_file(&outcome.volume_path).await;
        }
        Err(e) => {
            outcome.status = false;
            outcome.output = e.to_string();
        }
    }
    outcome
}

async fn subdirectory_names(path: &Path) -> std::io::Result<Vec<String>> {
    let mut entries = tokio::fs::read_dir(path).await?;
    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    Ok(names)
}

async fn dir_size_mb(dir: &Path) -> std::io::Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![dir.to_owned()];
    while let Some(current) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(e) => e,
            Err(_) => continue,
        };
        while let Some(entry) = entries.next_entry().await? {
            let meta = entry.metadata().await?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total / (1024 * 1024))
}

async fn available_space_mb(path: &Path) -> std::io::Result<u64> {
    let path = path.to_owned();
    let mb = tokio::task::spawn_blocking(move || {
        let disks = sysinfo::Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|d| path.starts_with(d.mount_point()))
            .max_by_key(|d| d.mount_point().as_os_str().len())
            .map(|d| d.available_space() / 1_000_000)
            .unwrap_or(u64::MAX)
    })
    .await
    .unwrap_or(u64::MAX);
    Ok(mb)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_valid_backup(root: &Path, tag: &str) {
        let backup_path = root.join(tag);
        tokio::fs::create_dir(&backup_path).await.unwrap();
        tokio::fs::create_dir(backup_path.join("volume_1")).await.unwrap();
        tokio::fs::write(backup_path.join(crate::model::SUCCESS_FLAG_FILE), b"").await.unwrap();
    }

    #[tokio::test]
    async fn lists_backup_tags_by_mtime_oldest_first() {
        let root = tempfile::tempdir().unwrap();
        // Named so that alphabetical order is the reverse of creation (mtime) order.
        make_valid_backup(root.path(), "2018-12-05").await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        make_valid_backup(root.path(), "2018-12-04").await;

        let ctx = Arc::new(RunContext {
            gpg_home: "/tmp/gpg".into(),
            gpg_recipient: "offsite@example.com".into(),
            tmp_root: "/tmp/bur".into(),
            host_address: "bkp@archive".into(),
            rsync_ssh: true,
            process_pool_size: 5,
            thread_pool_size: 5,
            transfer_pool_size: 8,
            ssh_timeout: std::time::Duration::from_secs(120),
            max_delay: None,
        });
        let codec = CryptoCodec::new(ctx.gpg_home.clone(), "n", "e@example.com", ctx.ssh_timeout);
        let engine = UploadEngine::new(ctx, codec);
        let customer = Customer::new("ACME", root.path());

        let tags = engine.list_local_backup_tags(&customer, root.path()).await.unwrap();
        assert_eq!(tags, vec!["2018-12-05".to_string(), "2018-12-04".to_string()]);
    }

    #[tokio::test]
    async fn invalid_backup_tags_are_skipped() {
        let root = tempfile::tempdir().unwrap();
        make_valid_backup(root.path(), "2018-12-04").await;
        // No BACKUP_OK flag here, so validate_backup_per_volume should reject this tag.
        tokio::fs::create_dir(root.path().join("2018-12-05")).await.unwrap();

        let ctx = Arc::new(RunContext {
            gpg_home: "/tmp/gpg".into(),
            gpg_recipient: "offsite@example.com".into(),
            tmp_root: "/tmp/bur".into(),
            host_address: "bkp@archive".into(),
            rsync_ssh: true,
            process_pool_size: 5,
            thread_pool_size: 5,
            transfer_pool_size: 8,
            ssh_timeout: std::time::Duration::from_secs(120),
            max_delay: None,
        });
        let codec = CryptoCodec::new(ctx.gpg_home.clone(), "n", "e@example.com", ctx.ssh_timeout);
        let engine = UploadEngine::new(ctx, codec);
        let customer = Customer::new("ACME", root.path());

        let tags = engine.list_local_backup_tags(&customer, root.path()).await.unwrap();
        assert_eq!(tags, vec!["2018-12-04".to_string()]);
    }
}
