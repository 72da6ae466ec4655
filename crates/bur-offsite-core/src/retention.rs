//! RetentionEngine: select and delete stale remote backups per customer (spec §4.7).

use crate::error::{BurError, BurResult};
use crate::remote::RemoteStore;

#[derive(Debug, Clone, Default)]
pub struct RetentionEngine;

impl RetentionEngine {
    pub fn new() -> Self {
        Self
    }

    /// Apply retention for one customer: keep the newest `retention_count` non-empty remote
    /// backups, deleting the rest.
    pub async fn apply(
        &self,
        store: &dyn RemoteStore,
        customer_root: &str,
        retention_count: usize,
    ) -> BurResult<Vec<String>> {
        let entries = store
            .list(customer_root, "*")
            .await
            .map_err(BurError::Transfer)?;

        let mut non_empty = Vec::new();
        for path in entries {
            let (files, dirs) = store.count_content(&path).await.map_err(BurError::Transfer)?;
            if files + dirs > 0 {
                non_empty.push(path);
            }
        }

        if non_empty.len() <= retention_count {
            return Ok(Vec::new());
        }

        let ordered = store
            .sort_by_newest_content(&non_empty)
            .await
            .map_err(BurError::Transfer)?;
        let stale = &ordered[retention_count.min(ordered.len())..];

        let mut not_removed = Vec::new();
        let mut removed = Vec::new();
        for path in stale {
            match store.remove_dir(path).await {
                Ok(()) => removed.push(path.clone()),
                Err(_) => not_removed.push(path.clone()),
            }
        }

        if !not_removed.is_empty() {
            return Err(BurError::RetentionRemovalFailed(not_removed));
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::fake::FakeRemoteStore;

    #[tokio::test]
    async fn does_nothing_when_within_retention_count() {
        let store = FakeRemoteStore::new();
        store.put(&std::path::PathBuf::from("/tmp/x"), "/archive/cust/tag1").await.unwrap();

        let engine = RetentionEngine::new();
        let removed = engine.apply(&store, "/archive/cust", 4).await.unwrap();
        assert!(removed.is_empty());
    }
}
