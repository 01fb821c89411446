use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::store::TenantStore;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that compacts a tenant's WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<TenantStore>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&store, threshold).await;
    }
}

/// Returns whether a compaction ran.
pub async fn compact_if_due(store: &TenantStore, threshold: u64) -> bool {
    let appends = store.appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    let tenant = &store.organization().slug;
    match store.compact().await {
        Ok(()) => {
            info!(tenant, appends, "WAL compacted");
            true
        }
        Err(e) => {
            warn!(tenant, "WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use crate::notify::NotifyHub;
    use crate::store::Store;
    use std::path::PathBuf;
    use ulid::Ulid;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_compactor");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[tokio::test]
    async fn compacts_only_past_threshold() {
        let path = test_wal_path("threshold.wal");
        let store = TenantStore::open(path.clone(), "acme", Arc::new(NotifyHub::new())).unwrap();
        let org_id = store.organization().id;

        let service = Service {
            id: Ulid::new(),
            org_id,
            name: "Corte".into(),
            duration_min: 30,
            active: true,
        };
        for i in 0..5 {
            let mut s = service.clone();
            s.name = format!("Corte {i}");
            store.apply_setup(org_id, SetupChange::ServiceSaved(s)).await.unwrap();
        }
        let before = std::fs::metadata(&path).unwrap().len();

        assert!(!compact_if_due(&store, 100).await);
        assert!(compact_if_due(&store, 5).await);
        assert_eq!(store.appends_since_compact().await, 0);

        // Five saves of one service collapse to one record.
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before);
        let reopened = TenantStore::open(path, "acme", Arc::new(NotifyHub::new())).unwrap();
        assert_eq!(reopened.organization().id, org_id);
        let got = reopened.service(org_id, service.id).await.unwrap().unwrap();
        assert_eq!(got.name, "Corte 4");
    }
}
