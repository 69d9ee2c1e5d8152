//! Per-user conversation state.
//!
//! A `SessionStore` is built once per process and shared by reference with the
//! dispatcher. Sessions are memory-only and disappear on logout or restart.

use crate::cloudflare::{mask_secret, Credentials};
use crate::menu::SelectionItem;
use crate::protocol::UserId;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};

pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

/// Position of a user in the dialog. Flow steps carry the transient data the
/// next transition needs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Step {
    #[default]
    None,

    // Quick login
    AwaitAccountId,
    AwaitApiToken,

    LoggedIn,
    AwaitWorkerName,
    AwaitWorkerFile {
        worker_name: String,
    },
    AwaitKvName,
    AwaitDeleteWorker,
    AwaitDeleteKv,
    BindingSelectWorker {
        workers: Vec<SelectionItem>,
    },
    BindingSelectKv {
        worker_name: String,
        namespaces: Vec<SelectionItem>,
    },

    // Registration and post-approval credential capture
    InputName,
    WaitingApproval,
    InputApiToken,
    InputAccountId,
    InputZoneId,
    InputKvNamespaceId,
}

impl Step {
    pub fn name(&self) -> &'static str {
        match self {
            Step::None => "none",
            Step::AwaitAccountId => "await_account_id",
            Step::AwaitApiToken => "await_api_token",
            Step::LoggedIn => "logged_in",
            Step::AwaitWorkerName => "await_worker_name",
            Step::AwaitWorkerFile { .. } => "await_worker_file",
            Step::AwaitKvName => "await_kv_name",
            Step::AwaitDeleteWorker => "await_delete_worker",
            Step::AwaitDeleteKv => "await_delete_kv",
            Step::BindingSelectWorker { .. } => "binding_select_worker",
            Step::BindingSelectKv { .. } => "binding_select_kv",
            Step::InputName => "input_name",
            Step::WaitingApproval => "waiting_approval",
            Step::InputApiToken => "input_api_token",
            Step::InputAccountId => "input_account_id",
            Step::InputZoneId => "input_zone_id",
            Step::InputKvNamespaceId => "input_kv_namespace_id",
        }
    }

    /// True once credentials were validated: the main menu and its sub-flows.
    pub fn is_logged_in(&self) -> bool {
        matches!(
            self,
            Step::LoggedIn
                | Step::AwaitWorkerName
                | Step::AwaitWorkerFile { .. }
                | Step::AwaitKvName
                | Step::AwaitDeleteWorker
                | Step::AwaitDeleteKv
                | Step::BindingSelectWorker { .. }
                | Step::BindingSelectKv { .. }
        )
    }

    /// The step a completed or abandoned flow settles back to.
    fn settled(self) -> Step {
        if self.is_logged_in() {
            Step::LoggedIn
        } else {
            self
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialField {
    ApiToken,
    AccountId,
    ZoneId,
    KvNamespaceId,
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct StoredCredentials {
    pub api_token: Option<String>,
    pub account_id: Option<String>,
    pub zone_id: Option<String>,
    pub kv_namespace_id: Option<String>,
}

impl StoredCredentials {
    /// The account-scoped pair the remote API needs, once both are captured.
    pub fn account(&self) -> Option<Credentials> {
        match (&self.account_id, &self.api_token) {
            (Some(account_id), Some(api_token)) => Some(Credentials::new(account_id, api_token)),
            _ => None,
        }
    }

    fn set(&mut self, field: CredentialField, value: Option<String>) {
        match field {
            CredentialField::ApiToken => self.api_token = value,
            CredentialField::AccountId => self.account_id = value,
            CredentialField::ZoneId => self.zone_id = value,
            CredentialField::KvNamespaceId => self.kv_namespace_id = value,
        }
    }
}

impl fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("api_token", &self.api_token.as_deref().map(mask_secret))
            .field("account_id", &self.account_id)
            .field("zone_id", &self.zone_id)
            .field("kv_namespace_id", &self.kv_namespace_id)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    pub action: String,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: UserId,
    pub step: Step,
    pub credentials: StoredCredentials,
    pub history: VecDeque<HistoryEntry>,
}

impl Session {
    fn new(user_id: UserId) -> Self {
        Self {
            user_id,
            step: Step::None,
            credentials: StoredCredentials::default(),
            history: VecDeque::new(),
        }
    }
}

pub struct SessionStore {
    sessions: Mutex<HashMap<UserId, Session>>,
    history_capacity: usize,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

impl SessionStore {
    pub fn new(history_capacity: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            history_capacity: history_capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn with_session<R>(&self, user_id: UserId, f: impl FnOnce(&mut Session) -> R) -> R {
        let mut sessions = self.lock();
        let session = sessions
            .entry(user_id)
            .or_insert_with(|| Session::new(user_id));
        f(session)
    }

    /// Snapshot of the user's session, created empty on first access.
    pub fn get(&self, user_id: UserId) -> Session {
        self.with_session(user_id, |session| session.clone())
    }

    pub fn step(&self, user_id: UserId) -> Step {
        self.with_session(user_id, |session| session.step.clone())
    }

    pub fn set_step(&self, user_id: UserId, step: Step) {
        self.with_session(user_id, |session| {
            tracing::debug!(user_id, from = session.step.name(), to = step.name(), "Step transition");
            session.step = step;
        });
    }

    /// Store a credential; `None` clears it.
    pub fn set_credential(&self, user_id: UserId, field: CredentialField, value: Option<String>) {
        self.with_session(user_id, |session| session.credentials.set(field, value));
    }

    pub fn clear_credentials(&self, user_id: UserId) {
        self.with_session(user_id, |session| {
            session.credentials = StoredCredentials::default()
        });
    }

    /// Drop the data a finished flow left in its step (pending worker name,
    /// cached selection lists) and settle back on the main menu.
    pub fn clear_transient(&self, user_id: UserId) {
        self.with_session(user_id, |session| {
            let step = std::mem::take(&mut session.step);
            session.step = step.settled();
        });
    }

    /// Append to the bounded history ring, dropping the oldest entry when full.
    pub fn append_history(&self, user_id: UserId, action: &str, detail: impl Into<String>) {
        let capacity = self.history_capacity;
        self.with_session(user_id, |session| {
            while session.history.len() >= capacity {
                session.history.pop_front();
            }
            session.history.push_back(HistoryEntry {
                at: Utc::now(),
                action: action.to_string(),
                detail: detail.into(),
            });
        });
    }

    /// Most recent entries first, at most `limit`.
    pub fn recent_history(&self, user_id: UserId, limit: usize) -> Vec<HistoryEntry> {
        self.with_session(user_id, |session| {
            session.history.iter().rev().take(limit).cloned().collect()
        })
    }

    /// Forget the session entirely (logout).
    pub fn remove(&self, user_id: UserId) -> Option<Session> {
        self.lock().remove(&user_id)
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.lock().contains_key(&user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_creates_empty_session() {
        let store = SessionStore::default();
        assert!(!store.contains(1));

        let session = store.get(1);
        assert_eq!(session.user_id, 1);
        assert_eq!(session.step, Step::None);
        assert!(session.credentials.account().is_none());
        assert!(store.contains(1));
    }

    #[test]
    fn test_credentials_need_account_and_token() {
        let store = SessionStore::default();
        store.set_credential(7, CredentialField::AccountId, Some("A1".to_string()));
        assert!(store.get(7).credentials.account().is_none());

        store.set_credential(7, CredentialField::ApiToken, Some("T1".to_string()));
        assert_eq!(store.get(7).credentials.account(), Some(Credentials::new("A1", "T1")));

        store.clear_credentials(7);
        assert_eq!(store.get(7).credentials, StoredCredentials::default());
    }

    #[test]
    fn test_clear_transient_settles_flow_steps() {
        let store = SessionStore::default();
        store.set_step(
            3,
            Step::BindingSelectKv {
                worker_name: "w1".to_string(),
                namespaces: vec![SelectionItem::new("kv1", "cache")],
            },
        );
        store.clear_transient(3);
        assert_eq!(store.step(3), Step::LoggedIn);

        store.set_step(
            3,
            Step::AwaitWorkerFile {
                worker_name: "w1".to_string(),
            },
        );
        store.clear_transient(3);
        assert_eq!(store.step(3), Step::LoggedIn);
    }

    #[test]
    fn test_clear_transient_keeps_pre_login_steps() {
        let store = SessionStore::default();
        store.set_step(4, Step::AwaitApiToken);
        store.clear_transient(4);
        assert_eq!(store.step(4), Step::AwaitApiToken);
    }

    #[test]
    fn test_history_ring_drops_oldest_when_full() {
        let store = SessionStore::new(3);
        for i in 0..5 {
            store.append_history(9, "action", format!("entry-{i}"));
        }

        let session = store.get(9);
        assert_eq!(session.history.len(), 3);
        assert_eq!(session.history.front().map(|e| e.detail.as_str()), Some("entry-2"));

        let recent = store.recent_history(9, 2);
        let details: Vec<&str> = recent.iter().map(|e| e.detail.as_str()).collect();
        assert_eq!(details, vec!["entry-4", "entry-3"]);
    }

    #[test]
    fn test_remove_discards_session() {
        let store = SessionStore::default();
        store.set_step(5, Step::LoggedIn);
        store.set_credential(5, CredentialField::ApiToken, Some("secret".to_string()));

        let removed = store.remove(5).expect("session existed");
        assert_eq!(removed.step, Step::LoggedIn);
        assert!(!store.contains(5));
        assert_eq!(store.get(5).step, Step::None);
    }

    #[test]
    fn test_stored_credentials_debug_masks_token() {
        let creds = StoredCredentials {
            api_token: Some("abcdefghijklmnop".to_string()),
            ..Default::default()
        };
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("abcdefghijklmnop"));
        assert!(debug.contains("abcd...mnop"));
    }

    #[test]
    fn test_step_names_are_snake_case() {
        assert_eq!(Step::None.to_string(), "none");
        assert_eq!(
            Step::BindingSelectWorker { workers: vec![] }.name(),
            "binding_select_worker"
        );
        assert!(Step::AwaitDeleteKv.is_logged_in());
        assert!(!Step::WaitingApproval.is_logged_in());
    }
}
