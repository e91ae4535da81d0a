use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use log::{info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dcp_bot::auth::callback::{
    CALLBACK_PATH_PREFIX, PendingCodes, spawn_console_reader, start_redirect_intake,
};
use dcp_bot::auth::oauth::GoogleOAuth;
use dcp_bot::auth::token_manager::{PromptOptions, TokenManager};
use dcp_bot::auth::token_store::TokenStore;
use dcp_bot::chat::commands::CommandHandler;
use dcp_bot::chat::discord::run_bot;
use dcp_bot::config::{AccountSettings, ChatEnv, Settings, default_config_path, load_settings};
use dcp_bot::daemon::notifier::Notifier;
use dcp_bot::daemon::schedule::run_daily;
use dcp_bot::daemon::{AccountPipeline, ScanReason, spawn_workers};
use dcp_bot::mail::imap_client::{ImapClient, Mailbox};
use dcp_bot::store::cache::ProblemCache;

#[derive(Parser)]
#[command(name = "dcp_bot")]
#[command(about = "Daily Coding Problem mail poller + Discord bot", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/dcp_bot/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the bot: scan at startup, once a day, and on `update` (default)
    Run,

    /// Authorize one mail account and store its token
    Authorize {
        account: String,

        /// Ignore the stored token and always ask for a new authorization
        #[arg(long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    // .env may carry RUST_LOG
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let path = match cli.config {
        Some(p) => p,
        None => default_config_path()?,
    };
    let settings = load_settings(&path).map_err(|e| anyhow!("Configuration error: {e}"))?;

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(async {
        match cli.cmd.unwrap_or(Command::Run) {
            Command::Run => run(settings).await,
            Command::Authorize { account, force } => authorize(settings, account, force).await,
        }
    });
    // an abandoned authorization may still be waiting for its code
    rt.shutdown_timeout(Duration::from_secs(1));
    result
}

fn token_manager(
    settings: &Settings,
    account: &AccountSettings,
    pending: PendingCodes,
) -> Result<TokenManager> {
    let expected_path = format!("{CALLBACK_PATH_PREFIX}{}", account.name);
    match url::Url::parse(&account.redirect_uri) {
        Ok(u) if u.path() == expected_path => {}
        _ => warn!(
            "[{}] redirect_uri {} does not point at {expected_path}; redirects will not reach this account",
            account.name, account.redirect_uri
        ),
    }

    let endpoint = GoogleOAuth::new(
        &settings.client.client_id,
        settings.client.client_secret.as_deref(),
        &account.redirect_uri,
    )?;

    Ok(TokenManager::new(
        account.name.clone(),
        TokenStore::new(&account.token_path),
        Arc::new(endpoint),
        pending,
        PromptOptions {
            open_browser: settings.open_browser,
            code_timeout: settings.auth_timeout,
        },
    ))
}

/// With `listener_required` false, a busy callback address (the bot is
/// already running) leaves the console as the only way in.
fn start_code_intake(settings: &Settings, listener_required: bool) -> Result<PendingCodes> {
    let pending = PendingCodes::default();
    start_redirect_intake(settings.callback_bind, pending.clone(), listener_required)?;
    spawn_console_reader(pending.clone())?;
    Ok(pending)
}

async fn run(settings: Settings) -> Result<()> {
    let chat = ChatEnv::from_env().map_err(|e| anyhow!("Configuration error: {e}"))?;
    let pending = start_code_intake(&settings, true)?;

    let imap: Arc<dyn Mailbox> = Arc::new(ImapClient::new(
        settings.imap_server.clone(),
        settings.mailbox.clone(),
    ));
    let accounts = settings
        .accounts
        .iter()
        .map(|a| {
            Ok(AccountPipeline {
                name: a.name.clone(),
                email: a.email.clone(),
                tokens: token_manager(&settings, a, pending.clone())?,
                mailbox: Arc::clone(&imap),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let cache = Arc::new(ProblemCache::new());
    let (notifier, announcements) = match chat.announce_channel {
        Some(channel) => {
            let (n, rx) = Notifier::channel();
            (Some(n), Some((channel, rx)))
        }
        None => (None, None),
    };

    let trigger = spawn_workers(accounts, Arc::clone(&cache), notifier);
    trigger.fire(ScanReason::Startup);
    tokio::spawn(run_daily(trigger.clone(), settings.daily_update));

    let commands = Arc::new(CommandHandler::new(
        cache,
        Arc::new(trigger),
        settings.command_prefix.clone(),
        settings.daily_update,
    ));

    tokio::select! {
        res = run_bot(&chat.bot_token, commands, announcements) => res,
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted; shutting down");
            Ok(())
        }
    }
}

async fn authorize(settings: Settings, account: String, force: bool) -> Result<()> {
    let acc = settings
        .accounts
        .iter()
        .find(|a| a.name == account)
        .ok_or_else(|| anyhow!("no account named {account:?} in the config"))?;
    let pending = start_code_intake(&settings, false)?;
    let mgr = token_manager(&settings, acc, pending)?;

    let cred = tokio::task::spawn_blocking(move || mgr.credential(force)).await??;
    println!(
        "Account {account} is authorized; access token valid until {}",
        cred.expiry
    );
    Ok(())
}
