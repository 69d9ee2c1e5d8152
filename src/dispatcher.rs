//! Conversation dispatcher: routes each inbound message or button press by the
//! sender's current step, performs at most one Cloudflare call, updates the
//! session and replies.

use crate::cloudflare::{mask_secret, Binding, Credentials, WorkersApi};
use crate::menu::{self, CallbackAction, MenuAction, SelectionItem};
use crate::protocol::{
    escape_markdown, CallbackQuery, ChatId, Document, Message, OutgoingMessage, Update, UserId,
};
use crate::registry::{Registration, RegistryError, UserRecord, UserRegistry};
use crate::session::{CredentialField, SessionStore, Step};
use crate::telegram::ChatTransport;
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tokio::sync::mpsc;

/// Input that skips an optional credential.
pub const SKIP_INPUT: &str = "-";

const HISTORY_PREVIEW: usize = 10;

const WELCOME_TEXT: &str =
    "Selamat datang di Bot Cloudflare!\n\nMasukkan *Account ID* Cloudflare kamu:";
const REGISTER_TEXT: &str =
    "Selamat datang di Bot Cloudflare!\n\nUntuk mendaftar, masukkan *nama* kamu:";
const LOGIN_OK_TEXT: &str = "✅ *Login Cloudflare berhasil!*\n\nSilakan pilih menu:";
const LOGIN_FAILED_TEXT: &str =
    "❌ Login gagal. Pastikan Account ID & API Token benar!\n\nMasukkan Account ID lagi:";
const LOGIN_FIRST_TEXT: &str = "Silakan login dulu.";
const SESSION_LOST_TEXT: &str = "Sesi login tidak ditemukan. Ketik /start untuk login lagi.";
const LOGOUT_TEXT: &str = "Anda telah logout.\nKetik /start untuk login lagi.";
const SELECTION_EXPIRED_TEXT: &str = "Daftar pilihan sudah tidak berlaku.";
const SELECTION_INVALID_TEXT: &str = "Pilihan tidak valid.";
const UNKNOWN_ACTION_TEXT: &str = "Aksi tidak dikenali.";
const ADMIN_ONLY_TEXT: &str = "Hanya admin yang dapat menyetujui pendaftaran.";
const INVALID_WORKER_NAME_TEXT: &str = "❌ Nama Worker tidak valid. Gunakan huruf kecil, angka, \
     '-' atau '_' (maksimal 63 karakter), lalu kirim lagi:";
const HELP_TEXT: &str = "Perintah yang tersedia:\n\
     /start - login atau daftar\n\
     /menu - tampilkan menu utama\n\
     /cancel - batalkan langkah saat ini\n\
     /logout - keluar dan hapus kredensial\n\
     /help - bantuan\n\
     /approve <id> - setujui pendaftaran (khusus admin)";

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Variable name a bound KV namespace is exposed under.
    pub binding_name: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            binding_name: crate::config::DEFAULT_BINDING_NAME.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Start,
    Menu,
    Cancel,
    Help,
    Logout,
    Approve(Option<UserId>),
    Unknown(String),
}

impl Command {
    fn parse(text: &str) -> Option<Command> {
        let text = text.trim();
        let rest = text.strip_prefix('/')?;
        let mut parts = rest.split_whitespace();
        let name = parts.next().unwrap_or_default();
        // "/start@MyBot" addresses a specific bot in group chats
        let name = name.split('@').next().unwrap_or_default().to_lowercase();
        let command = match name.as_str() {
            "start" => Command::Start,
            "menu" => Command::Menu,
            "cancel" => Command::Cancel,
            "help" => Command::Help,
            "logout" => Command::Logout,
            "approve" => Command::Approve(parts.next().and_then(|id| id.parse().ok())),
            _ => Command::Unknown(name),
        };
        Some(command)
    }
}

/// Cloudflare script names: lowercase alphanumerics, '-' and '_', at most 63 chars.
pub fn is_valid_worker_name(name: &str) -> bool {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^[a-z0-9](?:[a-z0-9_-]{0,61}[a-z0-9])?$")
                .expect("worker name pattern is valid")
        })
        .is_match(name)
}

fn text_input(message: &Message) -> Option<&str> {
    message
        .text
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
}

fn optional_input(text: &str) -> Option<String> {
    if text == SKIP_INPUT {
        None
    } else {
        Some(text.to_string())
    }
}

fn with_menu(chat_id: ChatId, text: impl Into<String>) -> OutgoingMessage {
    OutgoingMessage::plain(chat_id, text).with_keyboard(menu::main_menu())
}

pub struct Dispatcher {
    api: Arc<dyn WorkersApi>,
    transport: Arc<dyn ChatTransport>,
    sessions: Arc<SessionStore>,
    registry: Arc<UserRegistry>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        api: Arc<dyn WorkersApi>,
        transport: Arc<dyn ChatTransport>,
        sessions: Arc<SessionStore>,
        registry: Arc<UserRegistry>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            api,
            transport,
            sessions,
            registry,
            settings,
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn registry(&self) -> &UserRegistry {
        &self.registry
    }

    /// Handle updates one at a time until every sender is dropped.
    pub async fn run(&self, mut updates: mpsc::Receiver<Update>) {
        tracing::info!("Dispatcher started");
        while let Some(update) = updates.recv().await {
            self.handle_update(update).await;
        }
        tracing::info!("Update channel closed, dispatcher stopped");
    }

    pub async fn handle_update(&self, update: Update) {
        if let Some(query) = update.callback_query {
            self.handle_callback(query).await;
        } else if let Some(message) = update.message {
            self.handle_message(message).await;
        } else {
            tracing::debug!(update_id = update.update_id, "Ignoring update without message");
        }
    }

    async fn send(&self, message: OutgoingMessage) {
        let chat_id = message.chat_id;
        if let Err(error) = self.transport.send_message(message).await {
            tracing::warn!(chat_id, error = %error, "Failed to send message");
        }
    }

    /// Move to `step` and ask for its input.
    async fn transition(&self, user_id: UserId, chat_id: ChatId, step: Step) {
        let prompt = menu::prompt(chat_id, &step);
        self.sessions.set_step(user_id, step);
        self.send(prompt).await;
    }

    /// Input that the current step cannot consume: log it and re-prompt.
    async fn unexpected_input(&self, user_id: UserId, chat_id: ChatId, step: &Step) {
        if *step == Step::None {
            tracing::debug!(user_id, "Input received with no active dialog");
        } else {
            tracing::warn!(user_id, step = step.name(), "Input does not match current step");
        }
        self.send(menu::prompt(chat_id, step)).await;
    }

    /// Credentials of a logged-in session. A session without them is reset.
    async fn require_credentials(&self, user_id: UserId, chat_id: ChatId) -> Option<Credentials> {
        let credentials = self.sessions.get(user_id).credentials.account();
        if credentials.is_none() {
            tracing::warn!(user_id, "Logged-in session has no credentials");
            self.sessions.set_step(user_id, Step::None);
            self.send(OutgoingMessage::plain(chat_id, SESSION_LOST_TEXT))
                .await;
        }
        credentials
    }

    async fn handle_message(&self, message: Message) {
        let Some(user) = message.from.as_ref() else {
            tracing::debug!(chat_id = message.chat.id, "Ignoring message without sender");
            return;
        };
        let user_id = user.id;
        let chat_id = message.chat.id;

        if let Some(command) = message.text.as_deref().and_then(Command::parse) {
            self.handle_command(command, user_id, chat_id).await;
            return;
        }

        let step = self.sessions.step(user_id);
        let text = text_input(&message);

        match (&step, text) {
            (Step::InputName, Some(name)) => self.register_user(user_id, chat_id, name).await,
            (Step::InputApiToken, Some(token)) => {
                self.sessions
                    .set_credential(user_id, CredentialField::ApiToken, Some(token.to_string()));
                self.transition(user_id, chat_id, Step::InputAccountId).await;
            }
            (Step::InputAccountId, Some(account_id)) => {
                self.sessions.set_credential(
                    user_id,
                    CredentialField::AccountId,
                    Some(account_id.to_string()),
                );
                self.transition(user_id, chat_id, Step::InputZoneId).await;
            }
            (Step::InputZoneId, Some(zone_id)) => {
                self.sessions
                    .set_credential(user_id, CredentialField::ZoneId, optional_input(zone_id));
                self.transition(user_id, chat_id, Step::InputKvNamespaceId)
                    .await;
            }
            (Step::InputKvNamespaceId, Some(kv_id)) => {
                self.sessions.set_credential(
                    user_id,
                    CredentialField::KvNamespaceId,
                    optional_input(kv_id),
                );
                self.verify_login(user_id, chat_id).await;
            }
            (Step::AwaitAccountId, Some(account_id)) => {
                self.sessions.set_credential(
                    user_id,
                    CredentialField::AccountId,
                    Some(account_id.to_string()),
                );
                self.transition(user_id, chat_id, Step::AwaitApiToken).await;
            }
            (Step::AwaitApiToken, Some(token)) => {
                self.sessions
                    .set_credential(user_id, CredentialField::ApiToken, Some(token.to_string()));
                self.verify_login(user_id, chat_id).await;
            }
            (Step::AwaitWorkerName, Some(name)) => {
                if is_valid_worker_name(name) {
                    let next = Step::AwaitWorkerFile {
                        worker_name: name.to_string(),
                    };
                    self.transition(user_id, chat_id, next).await;
                } else {
                    self.send(OutgoingMessage::plain(chat_id, INVALID_WORKER_NAME_TEXT))
                        .await;
                }
            }
            (Step::AwaitWorkerFile { worker_name }, _) => match &message.document {
                Some(document) => {
                    self.deploy_worker(user_id, chat_id, worker_name, document)
                        .await
                }
                None => self.unexpected_input(user_id, chat_id, &step).await,
            },
            (Step::AwaitKvName, Some(title)) => self.create_kv(user_id, chat_id, title).await,
            (Step::AwaitDeleteWorker, Some(name)) => {
                if is_valid_worker_name(name) {
                    self.delete_worker(user_id, chat_id, name).await;
                } else {
                    self.send(OutgoingMessage::plain(chat_id, INVALID_WORKER_NAME_TEXT))
                        .await;
                }
            }
            (Step::AwaitDeleteKv, Some(kv_id)) => self.delete_kv(user_id, chat_id, kv_id).await,
            _ => self.unexpected_input(user_id, chat_id, &step).await,
        }
    }

    async fn handle_command(&self, command: Command, user_id: UserId, chat_id: ChatId) {
        tracing::debug!(user_id, command = ?command, "Command received");
        match command {
            Command::Start => self.start(user_id, chat_id).await,
            Command::Menu => {
                if self.sessions.step(user_id).is_logged_in() {
                    self.sessions.clear_transient(user_id);
                    self.send(menu::prompt(chat_id, &Step::LoggedIn)).await;
                } else {
                    self.send(OutgoingMessage::plain(
                        chat_id,
                        format!("{} Ketik /start.", LOGIN_FIRST_TEXT),
                    ))
                    .await;
                }
            }
            Command::Cancel => self.cancel_flow(user_id, chat_id).await,
            Command::Logout => self.logout(user_id, chat_id).await,
            Command::Approve(Some(target)) => {
                if let Some(notice) = self.approve_user(target, user_id, chat_id).await {
                    self.send(OutgoingMessage::plain(chat_id, notice)).await;
                }
            }
            Command::Approve(None) => {
                self.send(OutgoingMessage::plain(chat_id, "Format: /approve <user_id>"))
                    .await;
            }
            Command::Help | Command::Unknown(_) => {
                self.send(OutgoingMessage::plain(chat_id, HELP_TEXT)).await;
            }
        }
    }

    async fn start(&self, user_id: UserId, chat_id: ChatId) {
        if self.registry.requires_approval() && !self.registry.is_approved(user_id) {
            if self.registry.get(user_id).is_some() {
                self.transition(user_id, chat_id, Step::WaitingApproval)
                    .await;
            } else {
                self.sessions.set_step(user_id, Step::InputName);
                self.send(OutgoingMessage::markdown(chat_id, REGISTER_TEXT))
                    .await;
            }
            return;
        }

        self.sessions.clear_credentials(user_id);
        self.sessions.set_step(user_id, Step::AwaitAccountId);
        self.send(OutgoingMessage::markdown(chat_id, WELCOME_TEXT))
            .await;
    }

    async fn register_user(&self, user_id: UserId, chat_id: ChatId, name: &str) {
        match self.registry.register(user_id, name) {
            Ok(Registration::Created(record)) => {
                self.sessions.set_step(user_id, Step::WaitingApproval);
                self.sessions
                    .append_history(user_id, "register", record.display_name.clone());
                self.send(OutgoingMessage::plain(
                    chat_id,
                    "✅ Pendaftaran terkirim. Tunggu persetujuan admin ya.",
                ))
                .await;
                self.notify_admin(&record).await;
            }
            Ok(Registration::Existing(record)) if record.approved => {
                self.transition(user_id, chat_id, Step::InputApiToken).await;
            }
            Ok(Registration::Existing(_)) => {
                self.transition(user_id, chat_id, Step::WaitingApproval)
                    .await;
            }
            Err(error) => {
                tracing::error!(user_id, error = %error, "Failed to register user");
                self.send(OutgoingMessage::plain(
                    chat_id,
                    "❌ Pendaftaran gagal disimpan. Coba lagi nanti.",
                ))
                .await;
            }
        }
    }

    async fn notify_admin(&self, record: &UserRecord) {
        let Some(admin_id) = self.registry.admin_id() else {
            return;
        };
        // A private chat shares the user's id.
        let text = format!(
            "🆕 *Permintaan akses baru*\nNama: {}\nID: `{}`",
            escape_markdown(&record.display_name),
            record.id
        );
        self.send(
            OutgoingMessage::markdown(admin_id, text).with_keyboard(menu::approval_keyboard(record.id)),
        )
        .await;
    }

    /// Returns a notice for the requester when the approval is refused.
    async fn approve_user(
        &self,
        target: UserId,
        requester: UserId,
        chat_id: ChatId,
    ) -> Option<&'static str> {
        match self.registry.approve(target, requester) {
            Ok(record) => {
                self.sessions.set_step(target, Step::InputApiToken);
                self.send(OutgoingMessage::plain(
                    chat_id,
                    format!("✅ {} ({}) telah disetujui.", record.display_name, record.id),
                ))
                .await;
                self.send(OutgoingMessage::markdown(
                    target,
                    "🎉 Pendaftaran kamu disetujui admin!\n\nMasukkan *API Token* Cloudflare kamu:",
                ))
                .await;
                None
            }
            Err(RegistryError::Unauthorized { requester }) => {
                tracing::warn!(requester, target, "Approval attempted by non-admin");
                Some(ADMIN_ONLY_TEXT)
            }
            Err(RegistryError::AlreadyApproved(id)) => {
                self.send(OutgoingMessage::plain(
                    chat_id,
                    format!("ℹ️ User {} sudah disetujui sebelumnya.", id),
                ))
                .await;
                None
            }
            Err(RegistryError::NotFound(id)) => {
                self.send(OutgoingMessage::plain(
                    chat_id,
                    format!("❌ User {} tidak ditemukan.", id),
                ))
                .await;
                None
            }
            Err(error) => {
                tracing::error!(target, error = %error, "Failed to store approval");
                self.send(OutgoingMessage::plain(
                    chat_id,
                    format!("❌ Gagal menyimpan persetujuan: {}", error),
                ))
                .await;
                None
            }
        }
    }

    /// Validate captured credentials with a script listing. Failure loops back
    /// to account id entry.
    async fn verify_login(&self, user_id: UserId, chat_id: ChatId) {
        let outcome = match self.sessions.get(user_id).credentials.account() {
            Some(credentials) => self
                .api
                .list_scripts(&credentials)
                .await
                .map(|scripts| (credentials, scripts.len()))
                .map_err(|error| {
                    let codes: Vec<i64> =
                        error.remote_errors().iter().filter_map(|e| e.code).collect();
                    tracing::debug!(user_id, ?codes, "Cloudflare rejected credential check");
                    error.to_string()
                }),
            None => Err("account id or API token missing".to_string()),
        };

        match outcome {
            Ok((credentials, script_count)) => {
                tracing::info!(user_id, account_id = %credentials.account_id, "Cloudflare login succeeded");
                self.sessions.set_step(user_id, Step::LoggedIn);
                self.sessions.append_history(
                    user_id,
                    "login",
                    format!("{} ({} worker)", credentials.account_id, script_count),
                );
                self.send(
                    OutgoingMessage::markdown(chat_id, LOGIN_OK_TEXT).with_keyboard(menu::main_menu()),
                )
                .await;
            }
            Err(error) => {
                tracing::warn!(user_id, error = %error, "Cloudflare credential check failed");
                self.sessions.set_step(user_id, Step::AwaitAccountId);
                self.sessions
                    .append_history(user_id, "login", format!("gagal: {}", error));
                self.send(OutgoingMessage::markdown(chat_id, LOGIN_FAILED_TEXT))
                    .await;
            }
        }
    }

    async fn cancel_flow(&self, user_id: UserId, chat_id: ChatId) {
        let step = self.sessions.step(user_id);
        if step.is_logged_in() {
            self.sessions.clear_transient(user_id);
            self.send(
                OutgoingMessage::markdown(chat_id, "Dibatalkan.\n\nSilakan pilih menu:")
                    .with_keyboard(menu::main_menu()),
            )
            .await;
        } else if step == Step::WaitingApproval {
            self.send(menu::prompt(chat_id, &step)).await;
        } else {
            self.sessions.set_step(user_id, Step::None);
            self.send(OutgoingMessage::plain(
                chat_id,
                "Dibatalkan. Ketik /start untuk memulai lagi.",
            ))
            .await;
        }
    }

    async fn logout(&self, user_id: UserId, chat_id: ChatId) {
        if self.sessions.remove(user_id).is_some() {
            tracing::info!(user_id, "User logged out");
        }
        self.send(OutgoingMessage::plain(chat_id, LOGOUT_TEXT)).await;
    }

    async fn handle_callback(&self, query: CallbackQuery) {
        let user_id = query.from.id;
        let chat_id = query.message.as_ref().map(|message| message.chat.id);
        let action = query.data.as_deref().and_then(CallbackAction::parse);

        let notice = match (chat_id, action) {
            (Some(chat_id), Some(action)) => self.handle_action(user_id, chat_id, action).await,
            (_, None) => {
                tracing::warn!(user_id, data = ?query.data, "Unrecognised callback payload");
                Some(UNKNOWN_ACTION_TEXT)
            }
            (None, Some(_)) => {
                tracing::debug!(user_id, "Callback without originating message");
                None
            }
        };

        if let Err(error) = self.transport.answer_callback(&query.id, notice).await {
            tracing::warn!(user_id, error = %error, "Failed to answer callback");
        }
    }

    async fn handle_action(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        action: CallbackAction,
    ) -> Option<&'static str> {
        match action {
            CallbackAction::Approve(target) => self.approve_user(target, user_id, chat_id).await,
            CallbackAction::Cancel => {
                self.cancel_flow(user_id, chat_id).await;
                None
            }
            CallbackAction::PickWorker(index) => self.pick_worker(user_id, chat_id, index).await,
            CallbackAction::PickKv(index) => self.pick_kv(user_id, chat_id, index).await,
            CallbackAction::Menu(action) => {
                if !self.sessions.step(user_id).is_logged_in() {
                    return Some(LOGIN_FIRST_TEXT);
                }
                self.menu_action(user_id, chat_id, action).await;
                None
            }
        }
    }

    async fn menu_action(&self, user_id: UserId, chat_id: ChatId, action: MenuAction) {
        tracing::info!(user_id, action = action.callback_data(), "Menu action");
        // Picking a menu entry abandons any flow in progress.
        self.sessions.clear_transient(user_id);

        match action {
            MenuAction::DeployWorker => {
                self.transition(user_id, chat_id, Step::AwaitWorkerName)
                    .await
            }
            MenuAction::CreateKv => self.transition(user_id, chat_id, Step::AwaitKvName).await,
            MenuAction::DeleteWorker => {
                self.transition(user_id, chat_id, Step::AwaitDeleteWorker)
                    .await
            }
            MenuAction::DeleteKv => {
                self.transition(user_id, chat_id, Step::AwaitDeleteKv)
                    .await
            }
            MenuAction::ListWorkers => self.list_workers(user_id, chat_id).await,
            MenuAction::ListKv => self.list_kv(user_id, chat_id).await,
            MenuAction::BindKv => self.start_binding(user_id, chat_id).await,
            MenuAction::History => self.show_history(user_id, chat_id).await,
            MenuAction::Account => self.show_account(user_id, chat_id).await,
            MenuAction::Logout => self.logout(user_id, chat_id).await,
        }
    }

    async fn list_workers(&self, user_id: UserId, chat_id: ChatId) {
        let Some(credentials) = self.require_credentials(user_id, chat_id).await else {
            return;
        };
        let text = match self.api.list_scripts(&credentials).await {
            Ok(scripts) if scripts.is_empty() => "Belum ada Worker.".to_string(),
            Ok(scripts) => {
                let lines: Vec<String> = scripts
                    .iter()
                    .map(|script| format!("• {}", script.id))
                    .collect();
                format!("Daftar Worker:\n{}", lines.join("\n"))
            }
            Err(error) => {
                tracing::warn!(user_id, error = %error, "Listing workers failed");
                format!("❌ Gagal mengambil daftar Worker. {}", error)
            }
        };
        self.send(with_menu(chat_id, text)).await;
    }

    async fn list_kv(&self, user_id: UserId, chat_id: ChatId) {
        let Some(credentials) = self.require_credentials(user_id, chat_id).await else {
            return;
        };
        let text = match self.api.list_kv_namespaces(&credentials).await {
            Ok(namespaces) if namespaces.is_empty() => "Belum ada KV Namespace.".to_string(),
            Ok(namespaces) => {
                let lines: Vec<String> = namespaces
                    .iter()
                    .map(|kv| format!("• {} ({})", kv.title, kv.id))
                    .collect();
                format!("Daftar KV Namespace:\n{}", lines.join("\n"))
            }
            Err(error) => {
                tracing::warn!(user_id, error = %error, "Listing KV namespaces failed");
                format!("❌ Gagal mengambil daftar KV Namespace. {}", error)
            }
        };
        self.send(with_menu(chat_id, text)).await;
    }

    async fn deploy_worker(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        worker_name: &str,
        document: &Document,
    ) {
        let Some(credentials) = self.require_credentials(user_id, chat_id).await else {
            return;
        };

        let source = match self.transport.download_document(&document.file_id).await {
            Ok(bytes) => String::from_utf8(bytes).map_err(|_| {
                "❌ File harus berupa teks JavaScript (UTF-8).".to_string()
            }),
            Err(error) => {
                tracing::warn!(user_id, error = %error, "Downloading worker source failed");
                Err("❌ Gagal mengambil file dari Telegram.".to_string())
            }
        };
        let source = match source {
            Ok(source) => source,
            Err(text) => {
                self.sessions.clear_transient(user_id);
                self.send(with_menu(chat_id, text)).await;
                return;
            }
        };

        let outcome = self
            .api
            .upload_script(&credentials, worker_name, &source)
            .await;
        self.sessions.clear_transient(user_id);

        let text = match outcome {
            Ok(_) => {
                tracing::info!(user_id, worker = worker_name, "Worker deployed");
                self.sessions
                    .append_history(user_id, "deploy_worker", format!("{} (ok)", worker_name));
                format!("✅ Worker \"{}\" berhasil di-deploy!", worker_name)
            }
            Err(error) => {
                tracing::warn!(user_id, worker = worker_name, error = %error, "Worker deploy failed");
                self.sessions
                    .append_history(user_id, "deploy_worker", format!("{} (gagal)", worker_name));
                format!("❌ Deploy Worker gagal. {}", error)
            }
        };
        self.send(with_menu(chat_id, text)).await;
    }

    async fn create_kv(&self, user_id: UserId, chat_id: ChatId, title: &str) {
        let Some(credentials) = self.require_credentials(user_id, chat_id).await else {
            return;
        };
        let outcome = self.api.create_kv_namespace(&credentials, title).await;
        self.sessions.set_step(user_id, Step::LoggedIn);

        let text = match outcome {
            Ok(namespace) => {
                self.sessions.append_history(
                    user_id,
                    "create_kv",
                    format!("{} ({})", namespace.title, namespace.id),
                );
                format!(
                    "✅ KV Namespace \"{}\" berhasil dibuat!\nID: {}",
                    namespace.title, namespace.id
                )
            }
            Err(error) => {
                tracing::warn!(user_id, error = %error, "Creating KV namespace failed");
                self.sessions
                    .append_history(user_id, "create_kv", format!("{} (gagal)", title));
                format!("❌ Gagal membuat KV Namespace. {}", error)
            }
        };
        self.send(with_menu(chat_id, text)).await;
    }

    async fn delete_worker(&self, user_id: UserId, chat_id: ChatId, name: &str) {
        let Some(credentials) = self.require_credentials(user_id, chat_id).await else {
            return;
        };
        let outcome = self.api.delete_script(&credentials, name).await;
        self.sessions.set_step(user_id, Step::LoggedIn);

        let text = match outcome {
            Ok(()) => {
                self.sessions
                    .append_history(user_id, "delete_worker", format!("{} (ok)", name));
                format!("✅ Worker \"{}\" berhasil dihapus!", name)
            }
            Err(error) => {
                tracing::warn!(user_id, worker = name, error = %error, "Deleting worker failed");
                self.sessions
                    .append_history(user_id, "delete_worker", format!("{} (gagal)", name));
                format!("❌ Gagal menghapus Worker. {}", error)
            }
        };
        self.send(with_menu(chat_id, text)).await;
    }

    async fn delete_kv(&self, user_id: UserId, chat_id: ChatId, kv_id: &str) {
        let Some(credentials) = self.require_credentials(user_id, chat_id).await else {
            return;
        };
        let outcome = self.api.delete_kv_namespace(&credentials, kv_id).await;
        self.sessions.set_step(user_id, Step::LoggedIn);

        let text = match outcome {
            Ok(()) => {
                self.sessions
                    .append_history(user_id, "delete_kv", format!("{} (ok)", kv_id));
                format!("✅ KV Namespace \"{}\" berhasil dihapus!", kv_id)
            }
            Err(error) => {
                tracing::warn!(user_id, kv_id, error = %error, "Deleting KV namespace failed");
                self.sessions
                    .append_history(user_id, "delete_kv", format!("{} (gagal)", kv_id));
                format!("❌ Gagal menghapus KV Namespace. {}", error)
            }
        };
        self.send(with_menu(chat_id, text)).await;
    }

    async fn start_binding(&self, user_id: UserId, chat_id: ChatId) {
        let Some(credentials) = self.require_credentials(user_id, chat_id).await else {
            return;
        };
        match self.api.list_scripts(&credentials).await {
            Ok(scripts) if scripts.is_empty() => {
                self.send(with_menu(chat_id, "Belum ada Worker.")).await;
            }
            Ok(scripts) => {
                let workers = scripts
                    .into_iter()
                    .map(|script| SelectionItem::new(script.id.clone(), script.id))
                    .collect();
                self.transition(user_id, chat_id, Step::BindingSelectWorker { workers })
                    .await;
            }
            Err(error) => {
                tracing::warn!(user_id, error = %error, "Listing workers for binding failed");
                self.send(with_menu(
                    chat_id,
                    format!("❌ Gagal mengambil daftar Worker. {}", error),
                ))
                .await;
            }
        }
    }

    async fn pick_worker(
        &self,
        user_id: UserId,
        chat_id: ChatId,
        index: usize,
    ) -> Option<&'static str> {
        let Step::BindingSelectWorker { workers } = self.sessions.step(user_id) else {
            return Some(SELECTION_EXPIRED_TEXT);
        };
        let Some(worker) = workers.get(index).cloned() else {
            return Some(SELECTION_INVALID_TEXT);
        };
        let credentials = self.require_credentials(user_id, chat_id).await?;

        match self.api.list_kv_namespaces(&credentials).await {
            Ok(namespaces) if namespaces.is_empty() => {
                self.sessions.clear_transient(user_id);
                self.send(with_menu(chat_id, "Belum ada KV Namespace.")).await;
            }
            Ok(namespaces) => {
                let namespaces = namespaces
                    .into_iter()
                    .map(|kv| SelectionItem::new(kv.id, kv.title))
                    .collect();
                let next = Step::BindingSelectKv {
                    worker_name: worker.id,
                    namespaces,
                };
                self.transition(user_id, chat_id, next).await;
            }
            Err(error) => {
                tracing::warn!(user_id, error = %error, "Listing KV namespaces for binding failed");
                self.sessions.clear_transient(user_id);
                self.send(with_menu(
                    chat_id,
                    format!("❌ Gagal mengambil daftar KV Namespace. {}", error),
                ))
                .await;
            }
        }
        None
    }

    async fn pick_kv(&self, user_id: UserId, chat_id: ChatId, index: usize) -> Option<&'static str> {
        let Step::BindingSelectKv {
            worker_name,
            namespaces,
        } = self.sessions.step(user_id)
        else {
            return Some(SELECTION_EXPIRED_TEXT);
        };
        let Some(namespace) = namespaces.get(index).cloned() else {
            return Some(SELECTION_INVALID_TEXT);
        };
        let credentials = self.require_credentials(user_id, chat_id).await?;

        let binding = Binding::kv_namespace(self.settings.binding_name.as_str(), namespace.id.as_str());
        let outcome = self
            .api
            .patch_script_bindings(&credentials, &worker_name, &[binding])
            .await;
        self.sessions.clear_transient(user_id);

        let detail = format!("{} -> {}", worker_name, namespace.id);
        let text = match outcome {
            Ok(()) => {
                tracing::info!(user_id, worker = %worker_name, kv_id = %namespace.id, "KV namespace bound");
                self.sessions
                    .append_history(user_id, "bind_kv", format!("{} (ok)", detail));
                format!(
                    "✅ KV Namespace \"{}\" berhasil di-binding ke Worker \"{}\" sebagai {}.",
                    namespace.label, worker_name, self.settings.binding_name
                )
            }
            Err(error) => {
                tracing::warn!(user_id, worker = %worker_name, error = %error, "Binding KV namespace failed");
                self.sessions
                    .append_history(user_id, "bind_kv", format!("{} (gagal)", detail));
                format!("❌ Binding KV gagal. {}", error)
            }
        };
        self.send(with_menu(chat_id, text)).await;
        None
    }

    async fn show_history(&self, user_id: UserId, chat_id: ChatId) {
        let entries = self.sessions.recent_history(user_id, HISTORY_PREVIEW);
        let text = if entries.is_empty() {
            "Belum ada riwayat.".to_string()
        } else {
            let lines: Vec<String> = entries
                .iter()
                .map(|entry| {
                    format!(
                        "• {} {}: {}",
                        entry.at.format("%Y-%m-%d %H:%M UTC"),
                        entry.action,
                        entry.detail
                    )
                })
                .collect();
            format!("🕘 Riwayat terakhir:\n{}", lines.join("\n"))
        };
        self.send(with_menu(chat_id, text)).await;
    }

    async fn show_account(&self, user_id: UserId, chat_id: ChatId) {
        let credentials = self.sessions.get(user_id).credentials;
        let or_dash = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());
        let text = format!(
            "👤 Akun Cloudflare\nAccount ID: {}\nAPI Token: {}\nZone ID: {}\nKV Namespace default: {}",
            or_dash(&credentials.account_id),
            credentials
                .api_token
                .as_deref()
                .map(mask_secret)
                .unwrap_or_else(|| "-".to_string()),
            or_dash(&credentials.zone_id),
            or_dash(&credentials.kv_namespace_id),
        );
        self.send(with_menu(chat_id, text)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parse() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("  /START@CfBot  "), Some(Command::Start));
        assert_eq!(Command::parse("/approve 42"), Some(Command::Approve(Some(42))));
        assert_eq!(Command::parse("/approve abc"), Some(Command::Approve(None)));
        assert_eq!(
            Command::parse("/deploy now"),
            Some(Command::Unknown("deploy".to_string()))
        );
        assert_eq!(Command::parse("demo"), None);
    }

    #[test]
    fn test_worker_name_validation() {
        for name in ["demo", "w1", "my-worker_2", "a"] {
            assert!(is_valid_worker_name(name), "{name} should be valid");
        }
        let too_long = "x".repeat(64);
        for name in ["", "Demo", "-lead", "trail-", "has space", "a/b", too_long.as_str()] {
            assert!(!is_valid_worker_name(name), "{name} should be invalid");
        }
    }

    #[test]
    fn test_optional_input_skip_marker() {
        assert_eq!(optional_input("-"), None);
        assert_eq!(optional_input("zone1"), Some("zone1".to_string()));
    }
}
