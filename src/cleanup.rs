// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! Deletes a core and, if it was the last referencer, the executable (and
//! its links) it pointed at. Order matters: the index row is removed first
//! so a crash mid-cleanup leaves an orphan file (an operator-reclaimable
//! leak) rather than a dangling search hit pointing at a missing file.

use anyhow::Context;

use crate::error::IndexError;
use crate::index::{Index, SortField, SortOrder};
use crate::store::Store;
use crate::wire::Uid;

/// `size=0` is enough: only `total` is needed to decide whether any other
/// core still references this executable hash.
const REFERENCE_CHECK_SIZE: usize = 0;

pub async fn cleanup_one(store: &Store, index: &dyn Index, uid: Uid) -> anyhow::Result<()> {
    // Read before deleting: the executable hash lives on the document we are
    // about to remove.
    let coredump = index.find(uid).await.ok();

    match index.delete(uid).await {
        Ok(()) | Err(IndexError::NotFound) => {}
        Err(e) => return Err(e).with_context(|| format!("deleting {uid} from index")),
    }
    store
        .delete_core(uid)
        .await
        .with_context(|| format!("deleting core file {uid}"))?;

    if let Some(coredump) = coredump {
        reclaim_executable_if_orphaned(store, index, &coredump.executable_hash).await?;
    }
    Ok(())
}

async fn reclaim_executable_if_orphaned(
    store: &Store,
    index: &dyn Index,
    hash: &str,
) -> anyhow::Result<()> {
    let query = format!("executable_hash:{hash}");
    let page = index
        .search(
            &query,
            SortField::DumpedAt,
            SortOrder::Desc,
            REFERENCE_CHECK_SIZE,
            0,
        )
        .await
        .with_context(|| format!("checking remaining references to executable {hash}"))?;
    if page.total == 0 {
        store
            .delete_executable(hash)
            .await
            .with_context(|| format!("deleting orphaned executable {hash}"))?;
        store
            .delete_links(hash)
            .await
            .with_context(|| format!("deleting orphaned links for executable {hash}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::TantivyIndex;
    use crate::wire::chrono_compat::Timestamp;
    use crate::wire::Coredump;
    use std::collections::BTreeMap;
    use std::io::Cursor;

    fn sample(uid: Uid, hash: &str) -> Coredump {
        Coredump {
            uid,
            dumped_at: Timestamp::from_unix_seconds(100),
            hostname: "h1".to_string(),
            executable: "x".to_string(),
            executable_path: "/bin/x".to_string(),
            executable_hash: hash.to_string(),
            executable_size: 4,
            core_size: 5,
            lang: None,
            trace: None,
            analyzed_at: None,
            analyzed: false,
            metadata: BTreeMap::new(),
            forwarder_version: "1".to_string(),
            indexer_version: "1".to_string(),
        }
    }

    #[tokio::test]
    async fn last_referencer_cleanup_removes_executable() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let index = TantivyIndex::open(dir.path()).unwrap();
        let mut data = Cursor::new(b"ELF1".to_vec());
        store.put_executable("aa", &mut data).await.unwrap();

        let uid = Uid::new();
        let mut core = Cursor::new(b"CORE1".to_vec());
        store.put_core(uid, &mut core).await.unwrap();
        index.index(sample(uid, "aa")).await.unwrap();

        cleanup_one(&store, &index, uid).await.unwrap();

        assert!(store.get_core(uid).await.is_err());
        assert!(!store.has_executable("aa").await);
    }

    #[tokio::test]
    async fn executable_survives_while_another_core_references_it() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let index = TantivyIndex::open(dir.path()).unwrap();
        let mut data = Cursor::new(b"ELF1".to_vec());
        store.put_executable("aa", &mut data).await.unwrap();

        let uid1 = Uid::new();
        let uid2 = Uid::new();
        for uid in [uid1, uid2] {
            let mut core = Cursor::new(b"CORE1".to_vec());
            store.put_core(uid, &mut core).await.unwrap();
            index.index(sample(uid, "aa")).await.unwrap();
        }

        cleanup_one(&store, &index, uid1).await.unwrap();

        assert!(store.has_executable("aa").await);
    }

    #[tokio::test]
    async fn cleaning_up_an_already_gone_uid_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let index = TantivyIndex::open(dir.path()).unwrap();
        cleanup_one(&store, &index, Uid::new()).await.unwrap();
    }
}
