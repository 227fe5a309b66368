//! Filesystem backend.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{KeyValueStore, Namespace, PersistenceError, StorageKey};

/// One file per key under `<root>/<namespace>/<name>`.
///
/// Writes go to a temp file in the same directory which is then renamed over
/// the target, so a crash mid-write leaves the previous value intact.
#[derive(Clone, Debug)]
pub struct FileKeyValueStore {
    root: PathBuf,
}

impl FileKeyValueStore {
    /// Store rooted at `root`. Directories are created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the namespaces.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn namespace_dir(&self, namespace: Namespace) -> PathBuf {
        self.root.join(namespace.as_str())
    }

    fn path_for(&self, key: &StorageKey) -> Result<PathBuf, PersistenceError> {
        if !StorageKey::is_valid_name(&key.name) {
            return Err(PersistenceError::InvalidKey(key.to_string()));
        }
        Ok(self.namespace_dir(key.namespace).join(&key.name))
    }

    async fn ensure_dir(dir: &Path) -> Result<(), PersistenceError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| PersistenceError::io(dir, err))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o700);
            tokio::fs::set_permissions(dir, perms)
                .await
                .map_err(|err| PersistenceError::io(dir, err))?;
        }
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for FileKeyValueStore {
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, PersistenceError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(PersistenceError::io(path, err)),
        }
    }

    async fn put(&self, key: &StorageKey, value: &[u8]) -> Result<(), PersistenceError> {
        let path = self.path_for(key)?;
        let dir = self.namespace_dir(key.namespace);
        Self::ensure_dir(&dir).await?;

        let tmp = dir.join(format!(".{}.tmp-{}", key.name, Uuid::new_v4().simple()));

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|err| PersistenceError::io(&tmp, err))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&tmp, perms)
                .await
                .map_err(|err| PersistenceError::io(&tmp, err))?;
        }

        let written = async {
            file.write_all(value).await?;
            file.flush().await?;
            file.sync_all().await
        }
        .await;
        drop(file);

        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(PersistenceError::io(&tmp, err));
        }

        if let Err(err) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(PersistenceError::io(path, err));
        }

        Ok(())
    }

    async fn delete(&self, key: &StorageKey) -> Result<bool, PersistenceError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(PersistenceError::io(path, err)),
        }
    }

    async fn list(&self, namespace: Namespace) -> Result<Vec<String>, PersistenceError> {
        let dir = self.namespace_dir(namespace);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(PersistenceError::io(dir, err)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|err| PersistenceError::io(&dir, err))?
        {
            if let Some(name) = entry.file_name().to_str()
                && StorageKey::is_valid_name(name)
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
