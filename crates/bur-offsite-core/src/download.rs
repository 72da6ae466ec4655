//! DownloadEngine: per-backup download state machine (spec §4.6).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Semaphore;

use crate::context::RunContext;
use crate::crypto::CryptoCodec;
use crate::descriptor::Descriptor;
use crate::error::{BurError, BurResult};
use crate::model::{
    Customer, DownloadVolumeState, VolumeOutcome, BACKUP_METADATA_FILE, FILE_LIST_DESCRIPTOR,
    SUCCESS_FLAG_FILE, VOLUME_LIST_DESCRIPTOR,
};
use crate::remote::SharedStore;
use crate::validator::Validator;
use crate::volume::VolumeProcessor;

#[derive(Debug)]
pub struct DownloadOutcome {
    pub tag: String,
    pub volumes_restored: usize,
}

pub struct DownloadEngine {
    ctx: Arc<RunContext>,
    processor: VolumeProcessor,
    validator: Validator,
    descriptor: Descriptor,
}

impl DownloadEngine {
    pub fn new(ctx: Arc<RunContext>, codec: CryptoCodec) -> Self {
        let processor = VolumeProcessor::new(codec, ctx.ssh_timeout);
        Self {
            ctx,
            processor,
            validator: Validator::new(),
            descriptor: Descriptor::new(),
        }
    }

    /// `DownloadBackup`: resolve, prepare, guard, partition, transfer+decode, join, metadata,
    /// verify.
    pub async fn download_backup(
        &self,
        store: &SharedStore,
        customer: &Customer,
        full_root: &str,
        tag: &str,
        destination_root: &Path,
    ) -> BurResult<DownloadOutcome> {
        let remote_backup_path = self.resolve(store, full_root, customer, tag).await?;
        let local_backup_path = destination_root.join(&customer.name).join(tag);

        tokio::fs::create_dir_all(&local_backup_path)
            .await
            .map_err(|e| BurError::Decode {
                volume: tag.to_owned(),
                reason: e.to_string(),
            })?;

        let remote_size_mb = store.size_mb(&remote_backup_path).await.map_err(BurError::Transfer)?;
        self.validator
            .check_disk_space(&local_backup_path.display().to_string(), remote_size_mb, u64::MAX)?;

        let ok_remote = format!("{remote_backup_path}/{SUCCESS_FLAG_FILE}");
        if !store.path_exists(&ok_remote).await.map_err(BurError::Transfer)? {
            return Err(BurError::MissingSuccessFlag(remote_backup_path));
        }

        let volume_list_remote = format!("{remote_backup_path}/{VOLUME_LIST_DESCRIPTOR}");
        let volumes = self.fetch_descriptor(store, &volume_list_remote, &local_backup_path).await?;

        let classified = self
            .partition_volumes(&local_backup_path, &volumes)
            .await?;

        let outcomes = self
            .transfer_and_decode(store, &remote_backup_path, &local_backup_path, classified)
            .await?;

        let mut failures: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.status)
            .map(|o| format!("{}: {}", o.volume_path.display(), o.output))
            .collect();

        self.restore_metadata_files(store, &remote_backup_path, &local_backup_path).await?;

        failures.extend(self.verify(&local_backup_path, &volumes).await);

        if !failures.is_empty() {
            return Err(BurError::DownloadProcessFailed {
                backup: tag.to_owned(),
                failures,
            });
        }

        Ok(DownloadOutcome {
            tag: tag.to_owned(),
            volumes_restored: outcomes.len(),
        })
    }

    async fn resolve(
        &self,
        store: &SharedStore,
        full_root: &str,
        customer: &Customer,
        tag: &str,
    ) -> BurResult<String> {
        let candidate = format!("{full_root}/{}/{tag}", customer.name);
        if !store.path_exists(&candidate).await.map_err(BurError::Transfer)? {
            return Err(BurError::UnknownBackupTag(tag.to_owned()));
        }
        Ok(candidate)
    }

    async fn fetch_descriptor(
        &self,
        store: &SharedStore,
        remote_path: &str,
        local_stage_dir: &Path,
    ) -> BurResult<Vec<String>> {
        let name = remote_path.rsplit('/').next().unwrap_or(remote_path);
        let local_path = local_stage_dir.join(name);
        store.get(remote_path, &local_path).await.map_err(BurError::Transfer)?;
        let names = self.descriptor.read(&local_path).await?;
        let _ = tokio::fs::remove_file(&local_path).await;
        Ok(names)
    }

    async fn partition_volumes(
        &self,
        local_backup_path: &Path,
        volumes: &[String],
    ) -> BurResult<Vec<(String, DownloadVolumeState)>> {
        let mut classified = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let volume_dir = local_backup_path.join(volume);
            if volume_dir.is_dir() {
                if self.validator.validate_volume_metadata(&volume_dir).await.is_ok() {
                    classified.push((volume.clone(), DownloadVolumeState::Done));
                    continue;
                }
                let _ = tokio::fs::remove_dir_all(&volume_dir).await;
            }

            let tar_path = local_backup_path.join(format!("{volume}.tar"));
            if tar_path.is_file() {
                classified.push((volume.clone(), DownloadVolumeState::ReadyToDecode));
            } else {
                classified.push((volume.clone(), DownloadVolumeState::Missing));
            }
        }
        Ok(classified)
    }

    async fn transfer_and_decode(
        &self,
        store: &SharedStore,
        remote_backup_path: &str,
        local_backup_path: &Path,
        classified: Vec<(String, DownloadVolumeState)>,
    ) -> BurResult<Vec<VolumeOutcome>> {
        let transfer_permits = Arc::new(Semaphore::new(self.ctx.transfer_pool_size.max(1)));
        let mut transfer_set = tokio::task::JoinSet::new();

        for (volume, state) in classified {
            match state {
                DownloadVolumeState::Done => continue,
                DownloadVolumeState::ReadyToDecode => {
                    let tar_path = local_backup_path.join(format!("{volume}.tar"));
                    transfer_set.spawn(async move { VolumeOutcome::ok(tar_path) });
                }
                DownloadVolumeState::Missing => {
                    let permits = transfer_permits.clone();
                    let store = store.clone();
                    let remote_tar = format!("{remote_backup_path}/{volume}.tar");
                    let local_tar = local_backup_path.join(format!("{volume}.tar"));
                    transfer_set.spawn(async move {
                        let _permit = permits.acquire_owned().await.expect("semaphore not closed");
                        let transfer_start = std::time::Instant::now();
                        match store.get(&remote_tar, &local_tar).await {
                            Ok(stats) => {
                                let mut outcome = VolumeOutcome::ok(local_tar);
                                outcome.transfer_time = transfer_start.elapsed();
                                outcome.transfer_stats = Some(stats);
                                outcome
                            }
                            Err(e) => VolumeOutcome::failed(local_tar, e.to_string()),
                        }
                    });
                }
            }
        }

        let decode_permits = Arc::new(Semaphore::new(self.ctx.process_pool_size.max(1)));
        let mut decode_set = tokio::task::JoinSet::new();

        while let Some(joined) = transfer_set.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(join_err) => VolumeOutcome::failed(PathBuf::new(), join_err.to_string()),
            };

            if !outcome.status {
                decode_set.spawn(async move { outcome });
                continue;
            }

            let processor = self.processor.clone();
            let thread_pool_size = self.ctx.thread_pool_size;
            let permits = decode_permits.clone();
            decode_set.spawn(async move {
                let _permit = permits.acquire_owned().await.expect("semaphore not closed");
                let transfer_time = outcome.transfer_time;
                let transfer_stats = outcome.transfer_stats.clone();
                match processor.decode(&outcome.volume_path, thread_pool_size).await {
                    Ok(mut decoded) => {
                        decoded.transfer_time = transfer_time;
                        decoded.transfer_stats = transfer_stats;
                        decoded
                    }
                    Err(e) => VolumeOutcome::failed(outcome.volume_path, e.to_string()),
                }
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = decode_set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_err) => outcomes.push(VolumeOutcome::failed(PathBuf::new(), join_err.to_string())),
            }
        }
        Ok(outcomes)
    }

    async fn restore_metadata_files(
        &self,
        store: &SharedStore,
        remote_backup_path: &str,
        local_backup_path: &Path,
    ) -> BurResult<()> {
        let file_list_remote = format!("{remote_backup_path}/{FILE_LIST_DESCRIPTOR}");
        let names = self.fetch_descriptor(store, &file_list_remote, local_backup_path).await?;

        for name in names {
            let local_path = local_backup_path.join(&name);
            if local_path.exists() {
                continue;
            }

            if name == SUCCESS_FLAG_FILE {
                let remote = format!("{remote_backup_path}/{SUCCESS_FLAG_FILE}");
                store.get(&remote, &local_path).await.map_err(BurError::Transfer)?;
                continue;
            }

            if name.ends_with(".tar") && name.trim_end_matches(".tar") == format!("{BACKUP_METADATA_FILE}.gz") {
                self.restore_encrypted_metadata(store, remote_backup_path, local_backup_path, &name)
                    .await?;
            } else {
                let remote = format!("{remote_backup_path}/{name}");
                store.get(&remote, &local_path).await.map_err(BurError::Transfer)?;
            }
        }
        Ok(())
    }

    async fn restore_encrypted_metadata(
        &self,
        store: &SharedStore,
        remote_backup_path: &str,
        local_backup_path: &Path,
        tar_name: &str,
    ) -> BurResult<()> {
        let remote_tar = format!("{remote_backup_path}/{tar_name}");
        let local_tar = local_backup_path.join(tar_name);
        store.get(&remote_tar, &local_tar).await.map_err(BurError::Transfer)?;

        let out = crate::process::run(
            "tar",
            &[
                "-C",
                local_backup_path.to_str().unwrap_or_default(),
                "-xf",
                local_tar.to_str().unwrap_or_default(),
            ],
            self.ctx.ssh_timeout,
        )
        .await
        .map_err(|e| BurError::Decode {
            volume: tar_name.to_owned(),
            reason: e.to_string(),
        })?;
        if !out.status_success {
            return Err(BurError::Decode {
                volume: tar_name.to_owned(),
                reason: out.stderr,
            });
        }

        let gpg_name = tar_name.trim_end_matches(".tar");
        let gpg_path = local_backup_path.join(gpg_name);
        let decrypted = self
            .processor
            .codec_ref()
            .decrypt_one(&gpg_path)
            .await
            .map_err(BurError::Crypto)?;

        let final_path = local_backup_path.join(BACKUP_METADATA_FILE);
        tokio::fs::rename(&decrypted, &final_path)
            .await
            .map_err(|e| BurError::Decode {
                volume: BACKUP_METADATA_FILE.to_owned(),
                reason: e.to_string(),
            })?;

        let _ = tokio::fs::remove_file(&gpg_path).await;
        let _ = tokio::fs::remove_file(&local_tar).await;
        Ok(())
    }

    /// Check `BACKUP_OK` and every expected volume directory are present locally, and that
    /// per-file md5 matches metadata, per spec §4.6 step 8. Collects every problem found rather
    /// than stopping at the first, so the caller can fold them into the same failures list as
    /// the transfer/decode outcomes instead of losing them behind a single early error.
    async fn verify(&self, local_backup_path: &Path, volumes: &[String]) -> Vec<String> {
        let mut problems = Vec::new();

        if !tokio::fs::try_exists(local_backup_path.join(SUCCESS_FLAG_FILE))
            .await
            .unwrap_or(false)
        {
            problems.push(BurError::MissingSuccessFlag(local_backup_path.display().to_string()).to_string());
        }

        for volume in volumes {
            let volume_dir = local_backup_path.join(volume);
            if !volume_dir.is_dir() {
                problems.push(BurError::MissingVolume(volume.clone()).to_string());
                continue;
            }

            let metadata_path = self.validator.metadata_file_for(&volume_dir);
            let metadata = match self.validator.load_volume_metadata(&metadata_path).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    problems.push(format!("{volume}: {e}"));
                    continue;
                }
            };
            for entry in &metadata.objects {
                for (filename, object_meta) in entry {
                    let file_path = volume_dir.join(filename);
                    let actual = match self.validator.compute_md5(&file_path).await {
                        Ok(actual) => actual,
                        Err(e) => {
                            problems.push(format!("{volume}/{filename}: {e}"));
                            continue;
                        }
                    };
                    if !actual.eq_ignore_ascii_case(&object_meta.md5) {
                        problems.push(
                            crate::error::ValidationError::ChecksumMismatch {
                                volume: volume.clone(),
                                file: filename.clone(),
                                expected: object_meta.md5.clone(),
                                actual,
                            }
                            .to_string(),
                        );
                    }
                }
            }
        }
        problems
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeRemoteStore;
    use std::time::Duration;

    fn test_engine() -> DownloadEngine {
        let ctx = Arc::new(RunContext {
            gpg_home: "/tmp/gpg".into(),
            gpg_recipient: "offsite@example.com".into(),
            tmp_root: "/tmp/bur".into(),
            host_address: "bkp@archive".into(),
            rsync_ssh: true,
            process_pool_size: 5,
            thread_pool_size: 5,
            transfer_pool_size: 8,
            ssh_timeout: Duration::from_secs(120),
            max_delay: None,
        });
        let codec = CryptoCodec::new(ctx.gpg_home.clone(), "n", "e@example.com", ctx.ssh_timeout);
        DownloadEngine::new(ctx, codec)
    }

    #[tokio::test]
    async fn resolve_fails_with_unknown_backup_tag_when_remote_path_is_absent() {
        let engine = test_engine();
        let store: SharedStore = Arc::new(FakeRemoteStore::new());
        let customer = Customer::new("ACME", "/data/acme");

        let err = engine.resolve(&store, "/archive", &customer, "2018-12-04").await.unwrap_err();
        assert!(matches!(err, BurError::UnknownBackupTag(_)));
    }

    #[tokio::test]
    async fn resolve_succeeds_when_remote_path_exists() {
        let engine = test_engine();
        let store: SharedStore = Arc::new(FakeRemoteStore::new());
        store.mkdir_p("/archive/ACME/2018-12-04").await.unwrap();
        let customer = Customer::new("ACME", "/data/acme");

        let resolved = engine.resolve(&store, "/archive", &customer, "2018-12-04").await.unwrap();
        assert_eq!(resolved, "/archive/ACME/2018-12-04");
    }
}
