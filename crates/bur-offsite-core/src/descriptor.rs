//! Descriptor: the volume-list and file-list manifests written alongside a backup set
//! (spec §3, §9 Open Question (c)).
//!
//! Serialized as newline-delimited UTF-8 text, one name per line — chosen over JSON/bincode
//! to avoid a second serialization format and to avoid implying a specific byte layout.

use std::path::Path;

use crate::error::{BurError, BurResult};

/// Reads and writes a list of names to a single flat file.
#[derive(Debug, Default, Clone)]
pub struct Descriptor;

impl Descriptor {
    pub fn new() -> Self {
        Self
    }

    /// Write `names` to `path`, one per line, overwriting any existing content.
    pub async fn write(&self, path: &Path, names: &[String]) -> BurResult<()> {
        let body = names.join("\n");
        tokio::fs::write(path, body).await.map_err(|e| BurError::Encode {
            volume: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Read the names listed in `path`, skipping blank lines.
    pub async fn read(&self, path: &Path) -> BurResult<Vec<String>> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| BurError::NoVolumeList(format!("{}: {e}", path.display())))?;

        let names: Vec<String> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_owned)
            .collect();

        if names.is_empty() {
            return Err(BurError::NoVolumeList(path.display().to_string()));
        }
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_roundtrips_names() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("bur_volume_list_descriptor.dat");
        let descriptor = Descriptor::new();

        let names = vec!["volume_1".to_string(), "volume_2".to_string()];
        descriptor.write(&path, &names).await.unwrap();

        let read_back = descriptor.read(&path).await.unwrap();
        assert_eq!(read_back, names);
    }

    #[tokio::test]
    async fn read_rejects_an_empty_descriptor() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("empty.dat");
        tokio::fs::write(&path, "\n\n").await.unwrap();

        let err = Descriptor::new().read(&path).await.unwrap_err();
        assert!(matches!(err, BurError::NoVolumeList(_)));
    }

    #[tokio::test]
    async fn read_reports_missing_file_as_no_volume_list() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("missing.dat");

        let err = Descriptor::new().read(&path).await.unwrap_err();
        assert!(matches!(err, BurError::NoVolumeList(_)));
    }
}
