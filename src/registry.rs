//! Registered bot users and their admin approval state.
//!
//! The registry is memory-only unless opened on a file. A file-backed registry
//! re-reads the file whenever its stamp changed since the last access, so
//! approvals written by `cfbot users approve` reach a running bot. Mutations
//! rewrite the whole table atomically (temp file + rename).

use crate::protocol::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    pub display_name: String,
    pub registered_at: DateTime<Utc>,
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Registration {
    Created(UserRecord),
    /// A record already existed and was left untouched.
    Existing(UserRecord),
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("user {requester} is not allowed to approve registrations")]
    Unauthorized { requester: UserId },

    #[error("no registration found for user {0}")]
    NotFound(UserId),

    #[error("user {0} is already approved")]
    AlreadyApproved(UserId),

    #[error("failed to access registry file {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("registry file {} is not valid JSON: {source}", .path.display())]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Modification time and size of the registry file as last read or written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

#[derive(Default)]
struct Table {
    users: BTreeMap<UserId, UserRecord>,
    stamp: Option<FileStamp>,
}

pub struct UserRegistry {
    admin_id: Option<UserId>,
    path: Option<PathBuf>,
    table: Mutex<Table>,
}

impl UserRegistry {
    pub fn in_memory(admin_id: Option<UserId>) -> Self {
        Self {
            admin_id,
            path: None,
            table: Mutex::new(Table::default()),
        }
    }

    /// Open a file-backed registry. A missing file is an empty registry.
    pub fn open(path: impl Into<PathBuf>, admin_id: Option<UserId>) -> Result<Self, RegistryError> {
        let registry = Self {
            admin_id,
            path: Some(path.into()),
            table: Mutex::new(Table::default()),
        };
        let users = {
            let mut table = registry.lock();
            registry.reload(&mut table)?;
            table.users.len()
        };

        if let Some(path) = &registry.path {
            tracing::info!(path = %path.display(), users, "Loaded user registry");
        }
        Ok(registry)
    }

    pub fn admin_id(&self) -> Option<UserId> {
        self.admin_id
    }

    /// Registration and approval are enforced only when an admin is configured.
    pub fn requires_approval(&self) -> bool {
        self.admin_id.is_some()
    }

    pub fn is_admin(&self, user_id: UserId) -> bool {
        self.admin_id == Some(user_id)
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Re-read the backing file if it changed since it was last seen.
    fn reload(&self, table: &mut Table) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let stamp = file_stamp(path).map_err(|source| RegistryError::Io {
            path: path.clone(),
            source,
        })?;
        if stamp == table.stamp {
            return Ok(());
        }

        table.users = match stamp {
            Some(_) => read_records(path)?,
            None => BTreeMap::new(),
        };
        table.stamp = stamp;
        Ok(())
    }

    /// Lock for a read. A file that cannot be re-read leaves the last good copy in place.
    fn read_table(&self) -> MutexGuard<'_, Table> {
        let mut table = self.lock();
        if let Err(error) = self.reload(&mut table) {
            tracing::warn!(error = %error, "Failed to reload user registry, using cached records");
        }
        table
    }

    pub fn register(
        &self,
        user_id: UserId,
        display_name: &str,
    ) -> Result<Registration, RegistryError> {
        let mut table = self.lock();
        self.reload(&mut table)?;
        if let Some(existing) = table.users.get(&user_id) {
            return Ok(Registration::Existing(existing.clone()));
        }

        let record = UserRecord {
            id: user_id,
            display_name: display_name.trim().to_string(),
            registered_at: Utc::now(),
            approved: false,
            approved_at: None,
        };
        table.users.insert(user_id, record.clone());
        if let Err(error) = self.persist(&mut table) {
            table.users.remove(&user_id);
            return Err(error);
        }

        tracing::info!(user_id, "Registered new user");
        Ok(Registration::Created(record))
    }

    pub fn approve(&self, user_id: UserId, requester: UserId) -> Result<UserRecord, RegistryError> {
        if !self.is_admin(requester) {
            return Err(RegistryError::Unauthorized { requester });
        }

        let mut table = self.lock();
        self.reload(&mut table)?;
        let previous = table
            .users
            .get(&user_id)
            .cloned()
            .ok_or(RegistryError::NotFound(user_id))?;
        if previous.approved {
            return Err(RegistryError::AlreadyApproved(user_id));
        }

        let approved = UserRecord {
            approved: true,
            approved_at: Some(Utc::now()),
            ..previous.clone()
        };
        table.users.insert(user_id, approved.clone());
        if let Err(error) = self.persist(&mut table) {
            table.users.insert(user_id, previous);
            return Err(error);
        }

        tracing::info!(user_id, requester, "Approved user");
        Ok(approved)
    }

    /// The admin is always approved.
    pub fn is_approved(&self, user_id: UserId) -> bool {
        self.is_admin(user_id)
            || self
                .read_table()
                .users
                .get(&user_id)
                .map(|record| record.approved)
                .unwrap_or(false)
    }

    pub fn get(&self, user_id: UserId) -> Option<UserRecord> {
        self.read_table().users.get(&user_id).cloned()
    }

    /// All records ordered by user id.
    pub fn list(&self) -> Vec<UserRecord> {
        self.read_table().users.values().cloned().collect()
    }

    fn persist(&self, table: &mut Table) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let records: Vec<&UserRecord> = table.users.values().collect();
        let content = serde_json::to_vec_pretty(&records).map_err(|source| RegistryError::Serde {
            path: path.clone(),
            source,
        })?;
        write_atomically(path, &content).map_err(|source| RegistryError::Io {
            path: path.clone(),
            source,
        })?;

        // Our own write must not trigger a reload on the next access.
        table.stamp = file_stamp(path).ok().flatten();
        Ok(())
    }
}

fn file_stamp(path: &Path) -> io::Result<Option<FileStamp>> {
    match fs::metadata(path) {
        Ok(meta) => Ok(Some(FileStamp {
            modified: meta.modified()?,
            len: meta.len(),
        })),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(error) => Err(error),
    }
}

fn read_records(path: &Path) -> Result<BTreeMap<UserId, UserRecord>, RegistryError> {
    let content = fs::read_to_string(path).map_err(|source| RegistryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    if content.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    let records: Vec<UserRecord> =
        serde_json::from_str(&content).map_err(|source| RegistryError::Serde {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(records.into_iter().map(|record| (record.id, record)).collect())
}

fn write_atomically(path: &Path, content: &[u8]) -> io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)?;

    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "registry".to_string());
    let tmp_path = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

    let result = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADMIN: UserId = 1000;

    fn temp_registry_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("cfbot-registry-test-{}", uuid::Uuid::new_v4()))
            .join("users.json")
    }

    #[test]
    fn test_register_twice_keeps_first_record() {
        let registry = UserRegistry::in_memory(Some(ADMIN));
        let first = match registry.register(1, "Ana").unwrap() {
            Registration::Created(record) => record,
            other => panic!("expected Created, got {:?}", other),
        };
        assert!(!first.approved);

        match registry.register(1, "Someone Else").unwrap() {
            Registration::Existing(record) => assert_eq!(record, first),
            other => panic!("expected Existing, got {:?}", other),
        }
        assert_eq!(registry.get(1), Some(first));
    }

    #[test]
    fn test_approve_requires_admin() {
        let registry = UserRegistry::in_memory(Some(ADMIN));
        registry.register(1, "Ana").unwrap();

        for requester in [1, 2, -ADMIN] {
            let err = registry.approve(1, requester).unwrap_err();
            assert!(matches!(err, RegistryError::Unauthorized { .. }));
        }
        assert!(!registry.is_approved(1));
        assert_eq!(registry.get(1).unwrap().approved_at, None);
    }

    #[test]
    fn test_approve_without_configured_admin_is_unauthorized() {
        let registry = UserRegistry::in_memory(None);
        registry.register(1, "Ana").unwrap();
        assert!(matches!(
            registry.approve(1, ADMIN),
            Err(RegistryError::Unauthorized { .. })
        ));
        assert!(!registry.requires_approval());
    }

    #[test]
    fn test_approve_flow_and_errors() {
        let registry = UserRegistry::in_memory(Some(ADMIN));
        assert!(matches!(
            registry.approve(5, ADMIN),
            Err(RegistryError::NotFound(5))
        ));

        registry.register(5, "Budi").unwrap();
        let approved = registry.approve(5, ADMIN).unwrap();
        assert!(approved.approved);
        assert!(approved.approved_at.is_some());
        assert!(registry.is_approved(5));

        assert!(matches!(
            registry.approve(5, ADMIN),
            Err(RegistryError::AlreadyApproved(5))
        ));
    }

    #[test]
    fn test_admin_is_always_approved() {
        let registry = UserRegistry::in_memory(Some(ADMIN));
        assert!(registry.is_approved(ADMIN));
        assert!(!registry.is_approved(ADMIN + 1));
    }

    #[test]
    fn test_file_registry_persists_across_reopen() {
        let path = temp_registry_path();
        {
            let registry = UserRegistry::open(&path, Some(ADMIN)).unwrap();
            registry.register(2, "Citra").unwrap();
            registry.register(1, "Ana").unwrap();
            registry.approve(2, ADMIN).unwrap();
        }

        let reopened = UserRegistry::open(&path, Some(ADMIN)).unwrap();
        let ids: Vec<UserId> = reopened.list().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(reopened.is_approved(2));
        assert!(!reopened.is_approved(1));

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_file_registry_sees_changes_from_another_handle() {
        let path = temp_registry_path();
        let bot = UserRegistry::open(&path, Some(ADMIN)).unwrap();
        bot.register(7, "Dewi").unwrap();

        let cli = UserRegistry::open(&path, Some(ADMIN)).unwrap();
        cli.approve(7, ADMIN).unwrap();
        assert!(bot.is_approved(7));

        // The bot's next write must keep the approval made elsewhere.
        bot.register(8, "Eko").unwrap();
        let reopened = UserRegistry::open(&path, Some(ADMIN)).unwrap();
        assert!(reopened.is_approved(7));
        assert_eq!(reopened.get(8).map(|r| r.display_name), Some("Eko".to_string()));

        assert!(matches!(
            bot.approve(7, ADMIN),
            Err(RegistryError::AlreadyApproved(7))
        ));

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_reads_keep_cached_records_when_file_turns_corrupt() {
        let path = temp_registry_path();
        let registry = UserRegistry::open(&path, Some(ADMIN)).unwrap();
        registry.register(3, "Fajar").unwrap();
        registry.approve(3, ADMIN).unwrap();

        fs::write(&path, "[ definitely not the registry").unwrap();
        assert!(registry.is_approved(3));
        assert!(matches!(
            registry.register(4, "Gita"),
            Err(RegistryError::Serde { .. })
        ));

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_open_rejects_corrupt_file() {
        let path = temp_registry_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "{ not json").unwrap();

        let result = UserRegistry::open(&path, None);
        assert!(matches!(result, Err(RegistryError::Serde { .. })));

        let _ = fs::remove_dir_all(path.parent().unwrap());
    }
}
