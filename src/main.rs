use cfbot::config::{self, BotConfig};
use cfbot::protocol::UserId;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
mod commands;

#[derive(Parser)]
#[command(
    name = "cfbot",
    version,
    about = "Telegram bot for managing Cloudflare Workers and KV namespaces"
)]
struct Cli {
    /// Config file (default: ~/.config/cfbot/config.toml)
    #[arg(short, long, env = "CFBOT_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Telegram bot token (overrides config file)
    #[arg(short = 't', long, env = "TELEGRAM_BOT_TOKEN", global = true, hide_env_values = true)]
    bot_token: Option<String>,

    /// Telegram user id allowed to approve registrations (overrides config file)
    #[arg(long, env = "ADMIN_ID", global = true)]
    admin_id: Option<UserId>,

    /// User registry JSON file (overrides config file)
    #[arg(long, env = "CFBOT_REGISTRY", global = true)]
    registry: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize config file (~/.config/cfbot/config.toml)
    Init {
        /// Overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Run the bot with long polling
    Run,

    /// Run the bot behind a webhook server
    Serve {
        /// Address to listen on (default: config, else 0.0.0.0:8080)
        #[arg(long, env = "CFBOT_LISTEN")]
        listen: Option<String>,

        /// Public base URL to register with Telegram (skip registration if unset)
        #[arg(long, env = "CFBOT_PUBLIC_URL")]
        public_url: Option<String>,
    },

    /// Inspect and approve registered users
    Users {
        #[command(subcommand)]
        action: UsersAction,
    },
}

#[derive(Subcommand)]
enum UsersAction {
    /// List registered users
    List,

    /// Approve a pending registration as the configured admin
    Approve {
        /// Telegram user id
        user_id: UserId,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install rustls crypto provider BEFORE tokio runtime starts
    // (required for rustls 0.23+ - must happen before any TLS operations)
    #[cfg(feature = "rustls")]
    {
        rustls_crate::crypto::ring::default_provider()
            .install_default()
            .expect("Failed to install rustls crypto provider");
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cfbot=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        return run_init(cli.config, force);
    }

    let cfg = BotConfig::load(cli.config.as_deref())?;
    let overrides = commands::Overrides {
        bot_token: cli.bot_token,
        admin_id: cli.admin_id,
        registry: cli.registry,
    };

    match cli.command {
        Commands::Init { .. } => Ok(()),
        Commands::Run => commands::run_bot(&cfg, overrides).await,
        Commands::Serve { listen, public_url } => {
            commands::run_serve(&cfg, overrides, listen, public_url).await
        }
        Commands::Users { action } => match action {
            UsersAction::List => commands::run_users_list(&cfg, overrides),
            UsersAction::Approve { user_id } => {
                commands::run_users_approve(&cfg, overrides, user_id)
            }
        },
    }
}

fn run_init(path: Option<PathBuf>, force: bool) -> Result<(), Box<dyn std::error::Error>> {
    let Some(path) = path.or_else(BotConfig::config_path) else {
        return Err("Could not determine config directory".into());
    };

    if path.exists() && !force {
        println!("Config file already exists at: {}", path.display());
        println!("\nUse --force to overwrite, or edit directly:");
        println!("  $EDITOR {}", path.display());
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    std::fs::write(&path, config::sample_config())?;

    println!("Created config file: {}", path.display());
    println!("\nEdit it to set your bot token and admin id:");
    println!("  $EDITOR {}", path.display());
    println!("\nThen start the bot:");
    println!("  cfbot run");

    Ok(())
}
