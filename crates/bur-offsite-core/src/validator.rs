//! Validator: disk-space checks and backup-structure/metadata validation (spec §4.8),
//! grounded on `utils/backup_handler.py`.

use std::collections::HashSet;
use std::path::Path;

use md5::{Digest, Md5};

use crate::error::{ValidationError, ValidationResult};
use crate::model::{
    Customer, VolumeMetadata, BACKUP_METADATA_FILE, METADATA_FILE_SUFFIX, SUCCESS_FLAG_FILE,
};

#[derive(Debug, Default, Clone)]
pub struct Validator;

impl Validator {
    pub fn new() -> Self {
        Self
    }

    /// Fail if `available_mb` at `path` is smaller than `required_mb`, matching
    /// `check_local_disk_space_for_upload`/`_download`.
    pub fn check_disk_space(
        &self,
        path: &str,
        required_mb: u64,
        available_mb: u64,
    ) -> ValidationResult<()> {
        if available_mb < required_mb {
            return Err(ValidationError::InsufficientDiskSpace {
                path: path.to_owned(),
                required_mb,
                available_mb,
            });
        }
        Ok(())
    }

    /// A volume is "processed" once its encoded archive exists on disk, matching
    /// `check_is_processed_volume`.
    pub fn is_processed_volume(&self, encoded_path: &Path) -> bool {
        encoded_path.is_file()
    }

    /// Dispatches backup-structure validation: genie deployments skip the per-volume
    /// structural check and only require the `BACKUP_OK` flag, per `validate_backup_per_volume`.
    pub async fn validate_backup_per_volume(
        &self,
        customer: &Customer,
        backup_path: &Path,
        volume_dirs: &[String],
    ) -> ValidationResult<()> {
        self.is_backup_ok_valid(backup_path).await?;

        if customer.is_genie_volume() {
            return Ok(());
        }
        self.is_backup_volume_valid(backup_path, volume_dirs).await
    }

    /// Every name in `volume_dirs` must exist under `backup_path` as a directory, and nothing
    /// unexpected may be present alongside them (besides the known top-level files).
    async fn is_backup_volume_valid(
        &self,
        backup_path: &Path,
        volume_dirs: &[String],
    ) -> ValidationResult<()> {
        for volume in volume_dirs {
            let path = backup_path.join(volume);
            if !path.is_dir() {
                return Err(ValidationError::MetadataInvalid {
                    volume: volume.clone(),
                    reason: format!("expected directory '{}' does not exist", path.display()),
                });
            }
        }
        self.report_unexpected_files_presence(backup_path, volume_dirs).await
    }

    /// Warn-log (non-fatal) about entries under `backup_path` that are neither a known volume
    /// nor a recognised top-level file, matching `report_unexpected_files_presence`.
    async fn report_unexpected_files_presence(
        &self,
        backup_path: &Path,
        volume_dirs: &[String],
    ) -> ValidationResult<()> {
        let known: HashSet<&str> = volume_dirs
            .iter()
            .map(String::as_str)
            .chain([SUCCESS_FLAG_FILE, BACKUP_METADATA_FILE])
            .collect();

        let mut entries = match tokio::fs::read_dir(backup_path).await {
            Ok(e) => e,
            Err(_) => return Ok(()),
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !known.contains(name.as_ref()) {
                tracing::warn!(backup_path = %backup_path.display(), entry = %name, "unexpected entry in backup set");
            }
        }
        Ok(())
    }

    /// The `BACKUP_OK` success flag must exist, matching `is_backup_ok_valid`.
    pub async fn is_backup_ok_valid(&self, backup_path: &Path) -> ValidationResult<()> {
        let flag = backup_path.join(SUCCESS_FLAG_FILE);
        if !tokio::fs::try_exists(&flag).await.unwrap_or(false) {
            return Err(ValidationError::MetadataInvalid {
                volume: backup_path.display().to_string(),
                reason: format!("missing '{SUCCESS_FLAG_FILE}' flag"),
            });
        }
        Ok(())
    }

    /// Locate `<volume>_metadata` next to `volume_dir`, matching `get_volume_metadata_file`.
    pub fn metadata_file_for(&self, volume_dir: &Path) -> std::path::PathBuf {
        let volume_name = volume_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        volume_dir
            .parent()
            .unwrap_or(volume_dir)
            .join(format!("{volume_name}{METADATA_FILE_SUFFIX}"))
    }

    /// Parse a volume's metadata JSON, matching `get_metadata_file_json`.
    pub async fn load_volume_metadata(&self, metadata_path: &Path) -> ValidationResult<VolumeMetadata> {
        let content = tokio::fs::read_to_string(metadata_path)
            .await
            .map_err(|_| ValidationError::MetadataUnreadable(metadata_path.display().to_string()))?;
        serde_json::from_str(&content).map_err(|e| ValidationError::MetadataInvalid {
            volume: metadata_path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Every `objects` entry must have exactly one key, that key must exist as a file inside
    /// `volume_dir`, and must carry an `md5` subkey, matching `validate_metadata_content`.
    pub fn validate_metadata_content(
        &self,
        volume_dir: &Path,
        metadata: &VolumeMetadata,
    ) -> ValidationResult<()> {
        let volume_name = volume_dir.display().to_string();

        for entry in &metadata.objects {
            if entry.len() != 1 {
                return Err(ValidationError::MetadataInvalid {
                    volume: volume_name.clone(),
                    reason: format!("expected exactly one key per object entry, got {}", entry.len()),
                });
            }
            let (filename, object_meta) = entry.iter().next().expect("checked len == 1");

            let file_path = volume_dir.join(filename);
            if !file_path.is_file() {
                return Err(ValidationError::MetadataInvalid {
                    volume: volume_name.clone(),
                    reason: format!("'{filename}' is listed in metadata but missing from the volume"),
                });
            }
            if object_meta.md5.trim().is_empty() {
                return Err(ValidationError::MetadataInvalid {
                    volume: volume_name.clone(),
                    reason: format!("'{filename}' has no md5 entry"),
                });
            }
        }
        Ok(())
    }

    /// Validate a volume's metadata file content end-to-end, matching `validate_volume_metadata`.
    pub async fn validate_volume_metadata(&self, volume_dir: &Path) -> ValidationResult<()> {
        let metadata_path = self.metadata_file_for(volume_dir);
        let metadata = self.load_volume_metadata(&metadata_path).await?;
        self.validate_metadata_content(volume_dir, &metadata)
    }

    /// Recompute a file's MD5 as a lowercase hex string.
    pub async fn compute_md5(&self, file_path: &Path) -> ValidationResult<String> {
        let bytes = tokio::fs::read(file_path)
            .await
            .map_err(|_| ValidationError::MetadataUnreadable(file_path.display().to_string()))?;
        let mut hasher = Md5::new();
        hasher.update(&bytes);
        Ok(hex::encode(hasher.finalize()))
    }

    /// Recompute and compare one file's MD5 against the value recorded in its metadata.
    pub async fn checksum_matches(&self, file_path: &Path, expected_md5: &str) -> ValidationResult<bool> {
        let actual = self.compute_md5(file_path).await?;
        Ok(actual.eq_ignore_ascii_case(expected_md5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use crate::model::VolumeObjectMetadata;

    #[test]
    fn disk_space_check_fails_when_short() {
        let validator = Validator::new();
        let err = validator.check_disk_space("/data", 100, 50).unwrap_err();
        assert!(matches!(err, ValidationError::InsufficientDiskSpace { .. }));
    }

    #[test]
    fn disk_space_check_passes_when_sufficient() {
        let validator = Validator::new();
        assert!(validator.check_disk_space("/data", 100, 100).is_ok());
    }

    #[tokio::test]
    async fn is_backup_ok_valid_requires_the_flag_file() {
        let tmp = tempfile::tempdir().unwrap();
        let validator = Validator::new();
        assert!(validator.is_backup_ok_valid(tmp.path()).await.is_err());

        tokio::fs::write(tmp.path().join(SUCCESS_FLAG_FILE), b"").await.unwrap();
        assert!(validator.is_backup_ok_valid(tmp.path()).await.is_ok());
    }

    #[test]
    fn validate_metadata_content_requires_a_single_key_per_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let validator = Validator::new();
        let mut entry = HashMap::new();
        entry.insert("a".to_string(), VolumeObjectMetadata { length: None, offset: None, compression: None, md5: "x".into() });
        entry.insert("b".to_string(), VolumeObjectMetadata { length: None, offset: None, compression: None, md5: "y".into() });
        let metadata = VolumeMetadata { objects: vec![entry] };

        let err = validator.validate_metadata_content(tmp.path(), &metadata).unwrap_err();
        assert!(matches!(err, ValidationError::MetadataInvalid { .. }));
    }

    #[test]
    fn validate_metadata_content_requires_file_and_md5_present() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("object.bin"), b"data").unwrap();
        let validator = Validator::new();

        let mut entry = HashMap::new();
        entry.insert(
            "object.bin".to_string(),
            VolumeObjectMetadata { length: None, offset: None, compression: None, md5: "deadbeef".into() },
        );
        let metadata = VolumeMetadata { objects: vec![entry] };
        assert!(validator.validate_metadata_content(tmp.path(), &metadata).is_ok());
    }

    #[tokio::test]
    async fn checksum_matches_computes_real_md5() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("object.bin");
        tokio::fs::write(&file, b"hello").await.unwrap();

        let validator = Validator::new();
        // md5("hello") = 5d41402abc4b2a76b9719d911017c592
        assert!(validator
            .checksum_matches(&file, "5d41402abc4b2a76b9719d911017c592")
            .await
            .unwrap());
        assert!(!validator.checksum_matches(&file, "0").await.unwrap());
    }
}
