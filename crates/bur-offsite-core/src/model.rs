//! Core data types shared across the pipeline (spec §3).

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A customer's identity and the root of its on-site staging area.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Customer {
    pub name: String,
    pub local_backup_root: PathBuf,
}

impl Customer {
    pub fn new(name: impl Into<String>, local_backup_root: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            local_backup_root: local_backup_root.into(),
        }
    }

    /// "genie-volume" customers skip per-volume metadata validation (spec §4.8).
    pub fn is_genie_volume(&self) -> bool {
        self.name == GENIE_VOLUME_DEPLOYMENT
    }
}

/// Well-known customer id that opts a deployment out of per-volume metadata checks.
pub const GENIE_VOLUME_DEPLOYMENT: &str = "genie_vol_bkp";

/// Off-site archive connection parameters, read-only after load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OffsiteConfig {
    pub host: String,
    pub user: String,
    pub remote_root: String,
    pub folder: String,
    pub retention_count: usize,
}

impl OffsiteConfig {
    pub fn host_address(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    pub fn full_root(&self) -> String {
        format!("{}/{}", self.remote_root.trim_end_matches('/'), self.folder)
    }

    /// Remote path for one customer's backups: `full_root/customer`.
    pub fn customer_root(&self, customer: &str) -> String {
        format!("{}/{}", self.full_root(), customer)
    }

    /// Remote path for a single backup set: `full_root/customer/tag`.
    pub fn backup_path(&self, customer: &str, tag: &str) -> String {
        format!("{}/{}", self.customer_root(customer), tag)
    }
}

/// Well-known top-level file names inside a BackupSet (spec §3, §6).
pub const SUCCESS_FLAG_FILE: &str = "BACKUP_OK";
pub const BACKUP_METADATA_FILE: &str = "backup.metadata";
pub const METADATA_FILE_SUFFIX: &str = "_metadata";
pub const VOLUME_LIST_DESCRIPTOR: &str = "bur_volume_list_descriptor.dat";
pub const FILE_LIST_DESCRIPTOR: &str = "bur_file_list_descriptor.dat";

/// A directory under a customer's local_backup_root whose basename is the backup tag.
#[derive(Debug, Clone)]
pub struct BackupSet {
    pub tag: String,
    pub path: PathBuf,
    pub volumes: Vec<String>,
    pub top_level_files: Vec<String>,
}

/// One entry of a volume's `*_metadata` JSON `objects` array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeObjectMetadata {
    pub length: Option<u64>,
    pub offset: Option<u64>,
    pub compression: Option<String>,
    pub md5: String,
}

/// The parsed `*_metadata` file of a Volume: `{ "objects": [ {filename: {...}}, ... ] }`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct VolumeMetadata {
    pub objects: Vec<std::collections::HashMap<String, VolumeObjectMetadata>>,
}

/// Parsed `--stats` summary of one rsync invocation (spec §4.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferStats {
    pub total_files: usize,
    pub created: usize,
    pub deleted: usize,
    pub transferred: usize,
    pub rate: String,
    pub speedup: String,
}

/// Produced by VolumeProcessor and updated by the transfer pool (spec §3).
#[derive(Debug, Clone)]
pub struct VolumeOutcome {
    pub volume_path: PathBuf,
    pub processing_time: Duration,
    pub archive_time: Duration,
    pub transfer_time: Duration,
    pub transfer_stats: Option<TransferStats>,
    pub status: bool,
    pub output: String,
}

impl VolumeOutcome {
    pub fn ok(volume_path: PathBuf) -> Self {
        Self {
            volume_path,
            processing_time: Duration::ZERO,
            archive_time: Duration::ZERO,
            transfer_time: Duration::ZERO,
            transfer_stats: None,
            status: true,
            output: String::new(),
        }
    }

    pub fn failed(volume_path: PathBuf, reason: impl Into<String>) -> Self {
        Self {
            volume_path,
            processing_time: Duration::ZERO,
            archive_time: Duration::ZERO,
            transfer_time: Duration::ZERO,
            transfer_stats: None,
            status: false,
            output: reason.into(),
        }
    }
}

/// Classification of a local volume during UploadEngine's partition step (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadVolumeState {
    Transferred,
    Processed,
    Unfinished,
    Pending,
}

/// Classification of a remote volume during DownloadEngine's partition step (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadVolumeState {
    Done,
    ReadyToDecode,
    Missing,
}

/// Ephemeral map `customer -> ordered remote backup paths (newest first by mtime)`.
#[derive(Debug, Clone, Default)]
pub struct RemoteBackupIndex {
    pub paths_newest_first: Vec<String>,
}
