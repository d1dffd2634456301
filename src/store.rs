// SPDX-FileCopyrightText: The rcoredump contributors
//
// SPDX-License-Identifier: GPL-3.0-only

//! A content-addressed blob store with three namespaces: cores (addressed by
//! uid), executables (addressed by SHA-1), and links (addressed by
//! `(executable_hash, library_name)`, scoped under the executable).
//!
//! All operations are safe for concurrent callers on distinct keys; no
//! locking is needed because writes to a given key are idempotent (same
//! bytes, by the content-addressing precondition) or target disjoint paths.

use std::path::{Path, PathBuf};

use tokio::io::AsyncRead;

use crate::error::StoreError;
use crate::wire::Uid;

/// A cheap, cloneable handle onto the on-disk store layout, shared across
/// tasks without extra locking.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

fn is_not_found(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
}

async fn ensure_dir(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::create_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

impl Store {
    /// Opens (creating if necessary) the store rooted at `data_dir/store`.
    ///
    /// Directories are created with mode 0774; `AlreadyExists` is success.
    pub async fn open(data_dir: &Path) -> Result<Store, StoreError> {
        let root = data_dir.join("store");
        for sub in ["cores", "executables", "links"] {
            let dir = root.join(sub);
            ensure_dir(&dir).await?;
            set_mode_0774(&dir).await;
        }
        Ok(Store { root })
    }

    /// The path a core's bytes live at, for callers (the analyzer) that need
    /// to hand a real filesystem path to an external process.
    pub(crate) fn core_path(&self, uid: Uid) -> PathBuf {
        self.root.join("cores").join(uid.to_hex())
    }

    /// The path an executable's bytes live at, for the same reason as
    /// [`Store::core_path`].
    pub(crate) fn executable_path(&self, hash: &str) -> PathBuf {
        self.root.join("executables").join(hash)
    }

    fn link_dir(&self, hash: &str) -> PathBuf {
        self.root.join("links").join(hash)
    }

    fn link_path(&self, hash: &str, name: &str) -> PathBuf {
        self.link_dir(hash).join(name)
    }

    /// Streams `reader` into `cores/<uid>`, returning the number of bytes written.
    ///
    /// On write failure the partial file may remain; callers treat upload
    /// failure as fatal for that request and do not index the document.
    pub async fn put_core<R: AsyncRead + Unpin>(
        &self,
        uid: Uid,
        reader: &mut R,
    ) -> Result<u64, StoreError> {
        copy_into(reader, &self.core_path(uid)).await
    }

    pub async fn get_core(&self, uid: Uid) -> Result<tokio::fs::File, StoreError> {
        open_or_not_found(&self.core_path(uid)).await
    }

    pub async fn stat_core(&self, uid: Uid) -> Result<std::fs::Metadata, StoreError> {
        stat_or_not_found(&self.core_path(uid)).await
    }

    pub async fn delete_core(&self, uid: Uid) -> Result<(), StoreError> {
        remove_tolerant(&self.core_path(uid)).await
    }

    /// Streams `reader` into `executables/<hash>`. Callers are expected to
    /// check [`Store::has_executable`] first; a concurrent re-put is
    /// idempotent because the bytes are identical under the hash
    /// precondition.
    pub async fn put_executable<R: AsyncRead + Unpin>(
        &self,
        hash: &str,
        reader: &mut R,
    ) -> Result<u64, StoreError> {
        copy_into(reader, &self.executable_path(hash)).await
    }

    pub async fn has_executable(&self, hash: &str) -> bool {
        tokio::fs::metadata(self.executable_path(hash)).await.is_ok()
    }

    pub async fn stat_executable(&self, hash: &str) -> Result<std::fs::Metadata, StoreError> {
        stat_or_not_found(&self.executable_path(hash)).await
    }

    pub async fn get_executable(&self, hash: &str) -> Result<tokio::fs::File, StoreError> {
        open_or_not_found(&self.executable_path(hash)).await
    }

    pub async fn delete_executable(&self, hash: &str) -> Result<(), StoreError> {
        remove_tolerant(&self.executable_path(hash)).await
    }

    pub async fn put_link<R: AsyncRead + Unpin>(
        &self,
        hash: &str,
        name: &str,
        reader: &mut R,
    ) -> Result<u64, StoreError> {
        ensure_dir(&self.link_dir(hash)).await?;
        copy_into(reader, &self.link_path(hash, name)).await
    }

    pub async fn get_link(&self, hash: &str, name: &str) -> Result<tokio::fs::File, StoreError> {
        open_or_not_found(&self.link_path(hash, name)).await
    }

    pub async fn delete_link(&self, hash: &str, name: &str) -> Result<(), StoreError> {
        remove_tolerant(&self.link_path(hash, name)).await
    }

    /// Removes every link stored for `hash`, tolerating an already-empty or
    /// already-absent directory.
    pub async fn delete_links(&self, hash: &str) -> Result<(), StoreError> {
        match tokio::fs::remove_dir_all(self.link_dir(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocking equivalent of [`Store::put_core`], for callers already
    /// running on a blocking thread (the upload pipeline decodes gzip
    /// segments synchronously, see [`crate::upload`]).
    pub fn put_core_sync(&self, uid: Uid, reader: &mut impl std::io::Read) -> Result<u64, StoreError> {
        copy_into_sync(reader, &self.core_path(uid))
    }

    /// Blocking equivalent of [`Store::put_executable`].
    pub fn put_executable_sync(
        &self,
        hash: &str,
        reader: &mut impl std::io::Read,
    ) -> Result<u64, StoreError> {
        copy_into_sync(reader, &self.executable_path(hash))
    }

    /// Blocking equivalent of [`Store::stat_executable`].
    pub fn stat_executable_sync(&self, hash: &str) -> Result<std::fs::Metadata, StoreError> {
        match std::fs::metadata(self.executable_path(hash)) {
            Ok(m) => Ok(m),
            Err(e) if is_not_found(&e) => Err(StoreError::NotFound),
            Err(e) => Err(e.into()),
        }
    }

    /// Blocking equivalent of [`Store::put_link`].
    pub fn put_link_sync(
        &self,
        hash: &str,
        name: &str,
        reader: &mut impl std::io::Read,
    ) -> Result<u64, StoreError> {
        std::fs::create_dir_all(self.link_dir(hash))?;
        copy_into_sync(reader, &self.link_path(hash, name))
    }

    /// Lists every hash currently present under `executables/`, for the
    /// startup consistency scan that cross-checks the store against the
    /// index. Blocking: run via `spawn_blocking` from async callers.
    ///
    /// This only reports; it never deletes. A hash with no index reference
    /// is the same kind of operator-reclaimable leak the upload pipeline can
    /// already produce on a crash between `PutCore` and indexing.
    pub fn list_executable_hashes_blocking(&self) -> Vec<String> {
        walkdir::WalkDir::new(self.root.join("executables"))
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .collect()
    }
}

fn copy_into_sync(reader: &mut impl std::io::Read, path: &Path) -> Result<u64, StoreError> {
    let mut file = std::fs::File::create(path)?;
    let written = std::io::copy(reader, &mut file)?;
    Ok(written)
}

#[cfg(unix)]
async fn set_mode_0774(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o774)).await;
}

#[cfg(not(unix))]
async fn set_mode_0774(_path: &Path) {}

async fn copy_into<R: AsyncRead + Unpin>(reader: &mut R, path: &Path) -> Result<u64, StoreError> {
    let mut file = tokio::fs::File::create(path).await?;
    let written = tokio::io::copy(reader, &mut file).await?;
    Ok(written)
}

async fn open_or_not_found(path: &Path) -> Result<tokio::fs::File, StoreError> {
    match tokio::fs::File::open(path).await {
        Ok(f) => Ok(f),
        Err(e) if is_not_found(&e) => Err(StoreError::NotFound),
        Err(e) => Err(e.into()),
    }
}

async fn stat_or_not_found(path: &Path) -> Result<std::fs::Metadata, StoreError> {
    match tokio::fs::metadata(path).await {
        Ok(m) => Ok(m),
        Err(e) if is_not_found(&e) => Err(StoreError::NotFound),
        Err(e) => Err(e.into()),
    }
}

async fn remove_tolerant(path: &Path) -> Result<(), StoreError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn core_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let uid = Uid::new();
        let mut data = Cursor::new(b"CORE1".to_vec());
        let written = store.put_core(uid, &mut data).await.unwrap();
        assert_eq!(written, 5);
        let mut file = store.get_core(uid).await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"CORE1");
        store.delete_core(uid).await.unwrap();
        assert!(matches!(
            store.get_core(uid).await.unwrap_err(),
            StoreError::NotFound
        ));
    }

    #[tokio::test]
    async fn executable_dedup_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        assert!(!store.has_executable("aa").await);
        let mut data = Cursor::new(b"ELF1".to_vec());
        store.put_executable("aa", &mut data).await.unwrap();
        assert!(store.has_executable("aa").await);
        let mut data2 = Cursor::new(b"ELF1".to_vec());
        store.put_executable("aa", &mut data2).await.unwrap();
        let meta = store.stat_executable("aa").await.unwrap();
        assert_eq!(meta.len(), 4);
    }

    #[tokio::test]
    async fn links_are_scoped_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let mut data = Cursor::new(b"SO1".to_vec());
        store.put_link("aa", "libfoo.so", &mut data).await.unwrap();
        assert!(store.get_link("aa", "libfoo.so").await.is_ok());
        store.delete_links("aa").await.unwrap();
        assert!(matches!(
            store.get_link("aa", "libfoo.so").await.unwrap_err(),
            StoreError::NotFound
        ));
        // deleting again (already gone) is tolerated.
        store.delete_links("aa").await.unwrap();
    }

    #[tokio::test]
    async fn list_executable_hashes_reports_every_stored_blob() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let mut a = Cursor::new(b"ELF1".to_vec());
        let mut b = Cursor::new(b"ELF2".to_vec());
        store.put_executable("aa", &mut a).await.unwrap();
        store.put_executable("bb", &mut b).await.unwrap();
        let mut hashes = store.list_executable_hashes_blocking();
        hashes.sort();
        assert_eq!(hashes, vec!["aa".to_string(), "bb".to_string()]);
    }

    #[tokio::test]
    async fn sync_put_core_is_visible_to_async_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let uid = Uid::new();
        let mut data = Cursor::new(b"CORE-SYNC".to_vec());
        let written = store.put_core_sync(uid, &mut data).unwrap();
        assert_eq!(written, 9);
        let mut file = store.get_core(uid).await.unwrap();
        let mut buf = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut file, &mut buf)
            .await
            .unwrap();
        assert_eq!(buf, b"CORE-SYNC");
    }
}
