use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cfbot::cloudflare::CloudflareClient;
use cfbot::config::BotConfig;
use cfbot::dispatcher::{DispatchSettings, Dispatcher};
use cfbot::polling;
use cfbot::protocol::UserId;
use cfbot::registry::UserRegistry;
use cfbot::session::SessionStore;
use cfbot::telegram::TelegramClient;
use cfbot::webhook;
use tokio::sync::mpsc;

const UPDATE_QUEUE_DEPTH: usize = 256;

/// Values given on the command line or through the environment.
pub(crate) struct Overrides {
    pub bot_token: Option<String>,
    pub admin_id: Option<UserId>,
    pub registry: Option<PathBuf>,
}

fn open_registry(
    cfg: &BotConfig,
    overrides: &Overrides,
) -> Result<UserRegistry, Box<dyn std::error::Error>> {
    let admin_id = cfg.admin_id(overrides.admin_id);
    let registry = match cfg.registry_path(overrides.registry.clone()) {
        Some(path) => UserRegistry::open(path, admin_id)?,
        None => UserRegistry::in_memory(admin_id),
    };
    Ok(registry)
}

struct Bot {
    telegram: Arc<TelegramClient>,
    dispatcher: Arc<Dispatcher>,
}

async fn build_bot(
    cfg: &BotConfig,
    overrides: &Overrides,
) -> Result<Bot, Box<dyn std::error::Error>> {
    let token = cfg.bot_token(overrides.bot_token.as_deref())?;
    let registry = open_registry(cfg, overrides)?;
    if registry.requires_approval() {
        tracing::info!(admin_id = ?registry.admin_id(), "Registration requires admin approval");
    } else {
        tracing::warn!("No admin configured, any Telegram user can log in");
    }

    let telegram = Arc::new(TelegramClient::new(token)?);
    let me = telegram.get_me().await?;
    tracing::info!(bot = %me.display_name(), bot_id = me.id, "Connected to Telegram");

    let cloudflare = CloudflareClient::new(
        &cfg.cloudflare_api_base(),
        Duration::from_secs(cfg.cloudflare_timeout_secs()),
    )?;
    let dispatcher = Dispatcher::new(
        Arc::new(cloudflare),
        telegram.clone(),
        Arc::new(SessionStore::new(cfg.history_capacity())),
        Arc::new(registry),
        DispatchSettings {
            binding_name: cfg.binding_name(),
        },
    );

    Ok(Bot {
        telegram,
        dispatcher: Arc::new(dispatcher),
    })
}

pub(crate) async fn run_bot(
    cfg: &BotConfig,
    overrides: Overrides,
) -> Result<(), Box<dyn std::error::Error>> {
    let bot = build_bot(cfg, &overrides).await?;
    let (tx, rx) = mpsc::channel(UPDATE_QUEUE_DEPTH);

    let dispatcher = bot.dispatcher.clone();
    let worker = tokio::spawn(async move { dispatcher.run(rx).await });

    polling::run_polling(
        &bot.telegram,
        tx,
        cfg.poll_timeout_secs(),
        wait_for_shutdown_signal(),
    )
    .await;

    worker.await?;
    Ok(())
}

pub(crate) async fn run_serve(
    cfg: &BotConfig,
    overrides: Overrides,
    listen: Option<String>,
    public_url: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let token = cfg.bot_token(overrides.bot_token.as_deref())?;
    let bot = build_bot(cfg, &overrides).await?;
    let (tx, rx) = mpsc::channel(UPDATE_QUEUE_DEPTH);

    let dispatcher = bot.dispatcher.clone();
    let worker = tokio::spawn(async move { dispatcher.run(rx).await });

    match cfg.webhook_public_url(public_url) {
        Some(public_url) => {
            bot.telegram
                .set_webhook(&webhook::webhook_url(&public_url, &token))
                .await?;
            tracing::info!(public_url = %public_url, "Registered webhook with Telegram");
        }
        None => tracing::warn!("No public URL configured, assuming the webhook is already registered"),
    }

    let app = webhook::router(&token, tx);
    webhook::serve(&cfg.webhook_listen(listen), app, wait_for_shutdown_signal()).await?;

    // The router owned the last sender; the dispatcher drains what is queued.
    worker.await?;
    Ok(())
}

pub(crate) fn run_users_list(
    cfg: &BotConfig,
    overrides: Overrides,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = open_registry(cfg, &overrides)?;
    let users = registry.list();
    if users.is_empty() {
        println!("No registered users");
        return Ok(());
    }

    println!("{:<14} {:<9} {:<20} NAME", "ID", "STATUS", "REGISTERED");
    for user in users {
        let status = if user.approved { "approved" } else { "pending" };
        println!(
            "{:<14} {:<9} {:<20} {}",
            user.id,
            status,
            user.registered_at.format("%Y-%m-%d %H:%M"),
            user.display_name
        );
    }
    Ok(())
}

pub(crate) fn run_users_approve(
    cfg: &BotConfig,
    overrides: Overrides,
    user_id: UserId,
) -> Result<(), Box<dyn std::error::Error>> {
    let registry = open_registry(cfg, &overrides)?;
    let Some(admin_id) = registry.admin_id() else {
        return Err("No admin configured (set ADMIN_ID, --admin-id or telegram.admin_id)".into());
    };
    if cfg.registry_path(overrides.registry.clone()).is_none() {
        return Err("No registry file configured, approvals would not be saved".into());
    }

    let record = registry.approve(user_id, admin_id)?;
    println!("Approved {} ({})", record.display_name, record.id);
    println!("The user can continue with /start in the bot.");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> &'static str {
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("Failed to subscribe to SIGTERM");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> &'static str {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to subscribe to Ctrl+C");
    "SIGINT"
}
