use anyhow::{Result, anyhow, bail};
use chrono::NaiveTime;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Config {
    /// Path of the provider's OAuth client JSON (client id/secret/redirect URIs).
    pub client_secrets: String,
    #[serde(default = "default_imap_server")]
    pub imap_server: String,
    #[serde(default = "default_mailbox")]
    pub mailbox: String,
    #[serde(default = "default_callback_bind")]
    pub callback_bind: String,
    /// Local time of the daily re-scan, `HH:MM`.
    #[serde(default = "default_daily_update")]
    pub daily_update: String,
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,
    #[serde(default)]
    pub open_browser: bool,
    #[serde(default = "default_auth_timeout_secs")]
    pub auth_timeout_secs: u64,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AccountConfig {
    pub name: String,
    pub email: String,
    pub token_file: String,
    /// Defaults to the client file's `redirect_uris[i]` for the i-th account.
    pub redirect_uri: Option<String>,
}

fn default_imap_server() -> String {
    "imap.gmail.com".to_string()
}

fn default_mailbox() -> String {
    "INBOX".to_string()
}

fn default_callback_bind() -> String {
    "127.0.0.1:3000".to_string()
}

fn default_daily_update() -> String {
    "08:35".to_string()
}

fn default_command_prefix() -> String {
    "?".to_string()
}

fn default_auth_timeout_secs() -> u64 {
    600
}

/// OAuth client descriptor as downloaded from the provider console.
#[derive(Debug, Deserialize, Clone)]
pub struct ClientDescriptor {
    pub client_id: String,
    pub client_secret: Option<String>,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

#[derive(Deserialize)]
struct ClientSecretsFile {
    web: Option<ClientDescriptor>,
    installed: Option<ClientDescriptor>,
}

pub fn parse_client_secrets(json: &str) -> Result<ClientDescriptor> {
    let file: ClientSecretsFile = serde_json::from_str(json)?;
    file.web
        .or(file.installed)
        .ok_or_else(|| anyhow!("client secrets file has neither a `web` nor an `installed` section"))
}

/// One mail account with every path and URI resolved.
#[derive(Debug, Clone)]
pub struct AccountSettings {
    pub name: String,
    pub email: String,
    pub token_path: PathBuf,
    pub redirect_uri: String,
}

/// Validated runtime settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub client: ClientDescriptor,
    pub imap_server: String,
    pub mailbox: String,
    pub callback_bind: SocketAddr,
    pub daily_update: NaiveTime,
    pub command_prefix: String,
    pub open_browser: bool,
    pub auth_timeout: Duration,
    pub accounts: Vec<AccountSettings>,
}

fn config_dir() -> Result<PathBuf> {
    Ok(dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("no config dir available"))?
        .join("dcp_bot"))
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut p = config_dir()?;
    fs::create_dir_all(&p)?;
    p.push("config.toml");
    Ok(p)
}

fn sample_config() -> Config {
    Config {
        client_secrets: "credentials.json".to_string(),
        imap_server: default_imap_server(),
        mailbox: default_mailbox(),
        callback_bind: default_callback_bind(),
        daily_update: default_daily_update(),
        command_prefix: default_command_prefix(),
        open_browser: false,
        auth_timeout_secs: default_auth_timeout_secs(),
        accounts: vec![
            AccountConfig {
                name: "primary".to_string(),
                email: "you@gmail.com".to_string(),
                token_file: "token1.json".to_string(),
                redirect_uri: Some("http://localhost:3000/oauth/callback/primary".to_string()),
            },
            AccountConfig {
                name: "secondary".to_string(),
                email: "you.too@gmail.com".to_string(),
                token_file: "token2.json".to_string(),
                redirect_uri: Some("http://localhost:3000/oauth/callback/secondary".to_string()),
            },
        ],
    }
}

/// Load and validate the config at `path`; writes a template and fails when
/// it does not exist yet.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        // create a template config for users to edit
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tom = toml::to_string_pretty(&sample_config())?;
        fs::write(path, tom)?;
        bail!(
            "Created template config at {}; edit it and run again",
            path.display()
        );
    }
    let s = fs::read_to_string(path)?;
    let cfg: Config = toml::from_str(&s)?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let secrets_path = resolve_path(base, &cfg.client_secrets);
    let secrets = fs::read_to_string(&secrets_path)
        .map_err(|e| anyhow!("reading {}: {e}", secrets_path.display()))?;
    let client = parse_client_secrets(&secrets)?;

    resolve(cfg, client, base)
}

pub fn resolve(cfg: Config, client: ClientDescriptor, base: &Path) -> Result<Settings> {
    if cfg.accounts.is_empty() {
        bail!("no [[accounts]] configured");
    }
    if cfg.command_prefix.is_empty() {
        bail!("command_prefix must not be empty");
    }

    let mut seen = HashSet::new();
    let mut accounts = Vec::with_capacity(cfg.accounts.len());
    for (i, acc) in cfg.accounts.iter().enumerate() {
        if acc.name.is_empty() || acc.name.contains(char::is_whitespace) || acc.name.contains('/')
        {
            bail!("account name {:?} must be a single path-safe word", acc.name);
        }
        if !seen.insert(acc.name.clone()) {
            bail!("account name {:?} is configured twice", acc.name);
        }
        let redirect_uri = acc
            .redirect_uri
            .clone()
            .or_else(|| client.redirect_uris.get(i).cloned())
            .ok_or_else(|| {
                anyhow!(
                    "account {} has no redirect_uri and the client file lists no redirect_uris[{i}]",
                    acc.name
                )
            })?;
        accounts.push(AccountSettings {
            name: acc.name.clone(),
            email: acc.email.clone(),
            token_path: resolve_path(base, &acc.token_file),
            redirect_uri,
        });
    }

    let callback_bind = cfg
        .callback_bind
        .parse::<SocketAddr>()
        .map_err(|e| anyhow!("callback_bind {:?}: {e}", cfg.callback_bind))?;
    let daily_update = NaiveTime::parse_from_str(&cfg.daily_update, "%H:%M")
        .map_err(|e| anyhow!("daily_update {:?} (expected HH:MM): {e}", cfg.daily_update))?;

    Ok(Settings {
        client,
        imap_server: cfg.imap_server,
        mailbox: cfg.mailbox,
        callback_bind,
        daily_update,
        command_prefix: cfg.command_prefix,
        open_browser: cfg.open_browser,
        auth_timeout: Duration::from_secs(cfg.auth_timeout_secs),
        accounts,
    })
}

fn resolve_path(base: &Path, p: &str) -> PathBuf {
    let p = Path::new(p);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}

/// Chat settings taken from the environment.
#[derive(Debug, Clone)]
pub struct ChatEnv {
    pub bot_token: String,
    pub announce_channel: Option<u64>,
}

impl ChatEnv {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let bot_token = get("DISCORD_BOT_TOKEN")
            .filter(|t| !t.trim().is_empty())
            .ok_or_else(|| anyhow!("DISCORD_BOT_TOKEN is not set"))?;
        let announce_channel = match get("DISCORD_CHANNEL_ID").filter(|v| !v.trim().is_empty()) {
            Some(v) => Some(
                v.trim()
                    .parse::<u64>()
                    .ok()
                    .filter(|id| *id != 0)
                    .ok_or_else(|| anyhow!("DISCORD_CHANNEL_ID {v:?} is not a channel id"))?,
            ),
            None => None,
        };
        Ok(Self {
            bot_token,
            announce_channel,
        })
    }
}
