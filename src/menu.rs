//! Inline keyboards, the callback payloads they carry, and the prompt shown
//! for each conversation step.

use crate::protocol::{
    escape_markdown, ChatId, InlineKeyboardButton, InlineKeyboardMarkup, OutgoingMessage, UserId,
};
use crate::session::Step;

const PICK_WORKER_PREFIX: &str = "pick_worker:";
const PICK_KV_PREFIX: &str = "pick_kv:";
const APPROVE_PREFIX: &str = "approve:";
const CANCEL_DATA: &str = "cancel";

/// One entry of a selection submenu: the remote id and the label shown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectionItem {
    pub id: String,
    pub label: String,
}

impl SelectionItem {
    pub fn new(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuAction {
    DeployWorker,
    ListWorkers,
    CreateKv,
    ListKv,
    BindKv,
    DeleteWorker,
    DeleteKv,
    History,
    Account,
    Logout,
}

impl MenuAction {
    /// Main menu order.
    pub const ALL: [MenuAction; 10] = [
        MenuAction::DeployWorker,
        MenuAction::ListWorkers,
        MenuAction::CreateKv,
        MenuAction::ListKv,
        MenuAction::BindKv,
        MenuAction::DeleteWorker,
        MenuAction::DeleteKv,
        MenuAction::History,
        MenuAction::Account,
        MenuAction::Logout,
    ];

    pub fn callback_data(self) -> &'static str {
        match self {
            MenuAction::DeployWorker => "deploy_worker",
            MenuAction::ListWorkers => "list_workers",
            MenuAction::CreateKv => "create_kv",
            MenuAction::ListKv => "list_kv",
            MenuAction::BindKv => "bind_kv",
            MenuAction::DeleteWorker => "delete_worker",
            MenuAction::DeleteKv => "delete_kv",
            MenuAction::History => "history",
            MenuAction::Account => "account",
            MenuAction::Logout => "logout",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MenuAction::DeployWorker => "🚀 Deploy Worker",
            MenuAction::ListWorkers => "📜 Daftar Worker",
            MenuAction::CreateKv => "➕ Buat KV Namespace",
            MenuAction::ListKv => "🗂️ Daftar KV Namespace",
            MenuAction::BindKv => "🔗 Binding KV ke Worker",
            MenuAction::DeleteWorker => "❌ Hapus Worker",
            MenuAction::DeleteKv => "❌ Hapus KV Namespace",
            MenuAction::History => "🕘 Riwayat",
            MenuAction::Account => "👤 Akun",
            MenuAction::Logout => "🔒 Logout",
        }
    }

    fn from_callback(data: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|action| action.callback_data() == data)
    }
}

/// Decoded payload of an inline button press.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    Menu(MenuAction),
    PickWorker(usize),
    PickKv(usize),
    Approve(UserId),
    Cancel,
}

impl CallbackAction {
    pub fn parse(data: &str) -> Option<Self> {
        let data = data.trim();
        if data == CANCEL_DATA {
            return Some(CallbackAction::Cancel);
        }
        if let Some(index) = data.strip_prefix(PICK_WORKER_PREFIX) {
            return index.parse().ok().map(CallbackAction::PickWorker);
        }
        if let Some(index) = data.strip_prefix(PICK_KV_PREFIX) {
            return index.parse().ok().map(CallbackAction::PickKv);
        }
        if let Some(user_id) = data.strip_prefix(APPROVE_PREFIX) {
            return user_id.parse().ok().map(CallbackAction::Approve);
        }
        MenuAction::from_callback(data).map(CallbackAction::Menu)
    }

    pub fn to_data(self) -> String {
        match self {
            CallbackAction::Menu(action) => action.callback_data().to_string(),
            CallbackAction::PickWorker(index) => format!("{}{}", PICK_WORKER_PREFIX, index),
            CallbackAction::PickKv(index) => format!("{}{}", PICK_KV_PREFIX, index),
            CallbackAction::Approve(user_id) => format!("{}{}", APPROVE_PREFIX, user_id),
            CallbackAction::Cancel => CANCEL_DATA.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionKind {
    Worker,
    KvNamespace,
}

pub fn main_menu() -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::single_column(MenuAction::ALL.into_iter().map(|action| {
        InlineKeyboardButton::new(action.label(), action.callback_data())
    }))
}

/// A pick list over `items`; buttons carry the item's index, not its id,
/// to stay within Telegram's 64-byte callback limit.
pub fn selection_menu(items: &[SelectionItem], kind: SelectionKind) -> InlineKeyboardMarkup {
    let buttons = items.iter().enumerate().map(|(index, item)| {
        let action = match kind {
            SelectionKind::Worker => CallbackAction::PickWorker(index),
            SelectionKind::KvNamespace => CallbackAction::PickKv(index),
        };
        InlineKeyboardButton::new(item.label.clone(), action.to_data())
    });
    let cancel = InlineKeyboardButton::new("✖️ Batal", CallbackAction::Cancel.to_data());
    InlineKeyboardMarkup::single_column(buttons.chain(std::iter::once(cancel)))
}

pub fn approval_keyboard(user_id: UserId) -> InlineKeyboardMarkup {
    InlineKeyboardMarkup::single_column([InlineKeyboardButton::new(
        "✅ Setujui",
        CallbackAction::Approve(user_id).to_data(),
    )])
}

/// The message that asks for the input `step` expects. Selection steps
/// re-render their pick list.
pub fn prompt(chat_id: ChatId, step: &Step) -> OutgoingMessage {
    match step {
        Step::None => OutgoingMessage::plain(chat_id, "Ketik /start untuk memulai."),
        Step::AwaitAccountId | Step::InputAccountId => {
            OutgoingMessage::markdown(chat_id, "Masukkan *Account ID* Cloudflare kamu:")
        }
        Step::AwaitApiToken | Step::InputApiToken => {
            OutgoingMessage::markdown(chat_id, "Masukkan *API Token* Cloudflare kamu:")
        }
        Step::InputZoneId => OutgoingMessage::markdown(
            chat_id,
            "Masukkan *Zone ID* Cloudflare kamu (kirim - untuk lewati):",
        ),
        Step::InputKvNamespaceId => OutgoingMessage::markdown(
            chat_id,
            "Masukkan *KV Namespace ID* default (kirim - untuk lewati):",
        ),
        Step::InputName => {
            OutgoingMessage::markdown(chat_id, "Masukkan *nama* kamu untuk pendaftaran:")
        }
        Step::WaitingApproval => OutgoingMessage::plain(
            chat_id,
            "⏳ Pendaftaran kamu masih menunggu persetujuan admin.",
        ),
        Step::LoggedIn => {
            OutgoingMessage::markdown(chat_id, "Silakan pilih menu:").with_keyboard(main_menu())
        }
        Step::AwaitWorkerName => {
            OutgoingMessage::markdown(chat_id, "Masukkan *nama Worker* yang ingin dibuat:")
        }
        Step::AwaitWorkerFile { worker_name } => OutgoingMessage::markdown(
            chat_id,
            format!(
                "Kirim *file kode JS* untuk Worker \"{}\":",
                escape_markdown(worker_name)
            ),
        ),
        Step::AwaitKvName => OutgoingMessage::markdown(
            chat_id,
            "Masukkan *nama KV Namespace* yang ingin dibuat:",
        ),
        Step::AwaitDeleteWorker => {
            OutgoingMessage::markdown(chat_id, "Masukkan *nama Worker* yang ingin dihapus:")
        }
        Step::AwaitDeleteKv => OutgoingMessage::markdown(
            chat_id,
            "Masukkan *ID KV Namespace* yang ingin dihapus:",
        ),
        Step::BindingSelectWorker { workers } => {
            OutgoingMessage::markdown(chat_id, "🔗 Pilih *Worker* yang akan di-binding:")
                .with_keyboard(selection_menu(workers, SelectionKind::Worker))
        }
        Step::BindingSelectKv {
            worker_name,
            namespaces,
        } => OutgoingMessage::markdown(
            chat_id,
            format!(
                "Pilih *KV Namespace* untuk Worker \"{}\":",
                escape_markdown(worker_name)
            ),
        )
        .with_keyboard(selection_menu(namespaces, SelectionKind::KvNamespace)),
    }
}
