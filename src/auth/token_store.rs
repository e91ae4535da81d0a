use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::auth::oauth::Tokens;
use crate::error::{DcpError, Result};

/// Lifetime assumed when the provider does not report `expires_in`.
const DEFAULT_LIFETIME_SECS: i64 = 3500;

/// Access/refresh token pair for one mail account, as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expiry: DateTime<Utc>,
}

impl Credential {
    /// Build a credential from a fresh token response. A response without a
    /// refresh token keeps `previous_refresh`.
    pub fn from_tokens(
        tokens: Tokens,
        previous_refresh: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        let lifetime = tokens
            .expires_in
            .and_then(|s| i64::try_from(s).ok())
            .unwrap_or(DEFAULT_LIFETIME_SECS);
        Self {
            access_token: tokens.access_token,
            refresh_token: tokens.refresh_token.or(previous_refresh),
            expiry: now + Duration::seconds(lifetime),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry <= now
    }
}

/// JSON credential file for a single account.
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored credential; `Ok(None)` when no file exists yet.
    pub fn load(&self) -> Result<Option<Credential>> {
        let s = match fs::read_to_string(&self.path) {
            Ok(s) => s,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DcpError::io(&self.path, e)),
        };
        let cred = serde_json::from_str(&s).map_err(|source| DcpError::CredentialFormat {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(cred))
    }

    /// Write the credential via a temp file + rename so a crash never leaves
    /// a partial file behind.
    pub fn save(&self, cred: &Credential) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| DcpError::io(dir, e))?;
        }

        let json = serde_json::to_string_pretty(cred).map_err(|source| {
            DcpError::CredentialFormat {
                path: self.path.clone(),
                source,
            }
        })?;

        let tmp = self.tmp_path();
        let mut f = fs::File::create(&tmp).map_err(|e| DcpError::io(&tmp, e))?;
        f.write_all(json.as_bytes())
            .and_then(|_| f.sync_all())
            .map_err(|e| DcpError::io(&tmp, e))?;
        drop(f);

        fs::rename(&tmp, &self.path).map_err(|e| DcpError::io(&self.path, e))?;
        Ok(())
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "token".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}
