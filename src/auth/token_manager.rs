use chrono::{DateTime, Utc};
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;

use crate::auth::callback::PendingCodes;
use crate::auth::oauth::TokenEndpoint;
use crate::auth::token_store::{Credential, TokenStore};
use crate::error::{DcpError, Result};

/// What the authorizer has to do with whatever the store handed back.
#[derive(Debug, PartialEq, Eq)]
pub enum AuthStep {
    /// No usable credential: run the interactive code exchange.
    Interactive,
    /// Credential expired: trade the refresh token for a new access token.
    Refresh(Credential),
    /// Credential valid: hand it out as is.
    Ready(Credential),
}

/// Decide the next step from a stored credential.
pub fn next_step(stored: Option<Credential>, force: bool, now: DateTime<Utc>) -> AuthStep {
    match stored {
        _ if force => AuthStep::Interactive,
        None => AuthStep::Interactive,
        Some(c) if c.refresh_token.is_none() => AuthStep::Interactive,
        Some(c) if c.is_expired(now) => AuthStep::Refresh(c),
        Some(c) => AuthStep::Ready(c),
    }
}

#[derive(Debug, Clone)]
pub struct PromptOptions {
    pub open_browser: bool,
    pub code_timeout: Duration,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            open_browser: false,
            code_timeout: Duration::from_secs(600),
        }
    }
}

/// Keeps one account's credential valid: loads it, refreshes it when it
/// has expired, or walks the operator through a new authorization.
pub struct TokenManager {
    account: String,
    store: TokenStore,
    endpoint: Arc<dyn TokenEndpoint>,
    pending: PendingCodes,
    prompt: PromptOptions,
}

impl TokenManager {
    pub fn new(
        account: impl Into<String>,
        store: TokenStore,
        endpoint: Arc<dyn TokenEndpoint>,
        pending: PendingCodes,
        prompt: PromptOptions,
    ) -> Self {
        Self {
            account: account.into(),
            store,
            endpoint,
            pending,
            prompt,
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    /// Returns a non-expired credential; refreshes or re-authorizes if needed.
    /// With `force` the stored credential is ignored.
    pub fn credential(&self, force: bool) -> Result<Credential> {
        let stored = if force {
            None
        } else {
            match self.store.load() {
                Ok(c) => c,
                Err(e) => {
                    warn!(
                        "[{}] stored credential unusable, re-authorizing: {e}",
                        self.account
                    );
                    None
                }
            }
        };

        match next_step(stored, force, Utc::now()) {
            AuthStep::Ready(c) => Ok(c),
            AuthStep::Refresh(c) => self.refresh(c),
            AuthStep::Interactive => self.authorize_interactively(),
        }
    }

    fn refresh(&self, current: Credential) -> Result<Credential> {
        let Some(refresh_token) = current.refresh_token.clone() else {
            return self.authorize_interactively();
        };
        info!("[{}] access token expired; refreshing", self.account);

        let tokens = self.endpoint.refresh(&refresh_token).map_err(|e| {
            error!("[{}] error refreshing access token: {e}", self.account);
            DcpError::TokenRefreshFailed {
                account: self.account.clone(),
                message: e.to_string(),
            }
        })?;

        let cred = Credential::from_tokens(tokens, Some(refresh_token), Utc::now());
        self.persist(&cred, "refreshed token");
        Ok(cred)
    }

    fn authorize_interactively(&self) -> Result<Credential> {
        let waiting = self
            .pending
            .register(&self.account)
            .map_err(|e| DcpError::NoCredentialAvailable {
                account: self.account.clone(),
                reason: e.to_string(),
            })?;

        let request = self.endpoint.authorization_request();
        info!(
            "[{}] authorize this app by visiting this url:\n{}\nthen approve in the browser or type `{} <code>` here",
            self.account, request.url, self.account
        );
        if self.prompt.open_browser {
            // best-effort: don't fail if browser can't be opened
            if let Err(e) = open::that(request.url.as_str()) {
                warn!("could not open browser automatically: {e}");
            }
        }

        let received = waiting.wait(self.prompt.code_timeout).ok_or_else(|| {
            error!(
                "[{}] no authorization code received within {:?}",
                self.account, self.prompt.code_timeout
            );
            DcpError::AuthExchangeFailed {
                account: self.account.clone(),
                message: "no authorization code received".to_string(),
            }
        })?;
        drop(waiting);

        let tokens = match self
            .endpoint
            .exchange_code(&received.code, &request.pkce_verifier)
        {
            Ok(tokens) => tokens,
            Err(e) => {
                error!("[{}] error retrieving access token: {e}", self.account);
                received.report(Err(e.to_string()));
                return Err(DcpError::AuthExchangeFailed {
                    account: self.account.clone(),
                    message: e.to_string(),
                });
            }
        };

        if tokens.refresh_token.is_none() {
            warn!(
                "[{}] provider returned no refresh token; the next expiry will need a new authorization",
                self.account
            );
        }
        let cred = Credential::from_tokens(tokens, None, Utc::now());
        self.persist(&cred, "token");
        received.report(Ok(()));
        Ok(cred)
    }

    /// Best-effort: the in-memory credential stays usable if the write fails.
    fn persist(&self, cred: &Credential, what: &str) {
        match self.store.save(cred) {
            Ok(()) => info!(
                "[{}] {what} stored to {}",
                self.account,
                self.store.path().display()
            ),
            Err(e) => error!("[{}] error writing {what}: {e}", self.account),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::callback::handle_callback;
    use crate::auth::oauth::{AuthRequest, Tokens};
    use anyhow::anyhow;
    use chrono::Duration as ChronoDuration;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use tempfile::TempDir;

    #[derive(Default)]
    struct FakeEndpoint {
        refresh_calls: AtomicUsize,
        exchange_calls: AtomicUsize,
        fail: bool,
        seen_codes: Mutex<Vec<(String, String)>>,
    }

    impl TokenEndpoint for FakeEndpoint {
        fn authorization_request(&self) -> AuthRequest {
            AuthRequest {
                url: url::Url::parse("https://auth.example/authorize?x=1").expect("url"),
                pkce_verifier: "verifier".to_string(),
            }
        }

        fn exchange_code(&self, code: &str, pkce_verifier: &str) -> anyhow::Result<Tokens> {
            self.exchange_calls.fetch_add(1, Ordering::SeqCst);
            self.seen_codes
                .lock()
                .expect("lock")
                .push((code.to_string(), pkce_verifier.to_string()));
            if self.fail {
                return Err(anyhow!("invalid_grant"));
            }
            Ok(Tokens {
                access_token: "exchanged".to_string(),
                refresh_token: Some("fresh-refresh".to_string()),
                expires_in: Some(3600),
            })
        }

        fn refresh(&self, _refresh_token: &str) -> anyhow::Result<Tokens> {
            self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(anyhow!("invalid_grant"));
            }
            Ok(Tokens {
                access_token: "refreshed".to_string(),
                refresh_token: None,
                expires_in: Some(3600),
            })
        }
    }

    fn manager(
        temp: &TempDir,
        endpoint: Arc<FakeEndpoint>,
        pending: PendingCodes,
    ) -> TokenManager {
        TokenManager::new(
            "primary",
            TokenStore::new(temp.path().join("token1.json")),
            endpoint,
            pending,
            PromptOptions {
                open_browser: false,
                code_timeout: Duration::from_secs(5),
            },
        )
    }

    fn stored(expiry: DateTime<Utc>, refresh: Option<&str>) -> Credential {
        Credential {
            access_token: "stored".to_string(),
            refresh_token: refresh.map(str::to_string),
            expiry,
        }
    }

    /// Deliver `code` as soon as the manager registers its wait.
    fn deliver_when_pending(pending: PendingCodes, code: &'static str) -> thread::JoinHandle<()> {
        thread::spawn(move || {
            for _ in 0..500 {
                if pending.deliver("primary", code.to_string()).is_ok() {
                    return;
                }
                thread::sleep(Duration::from_millis(10));
            }
            panic!("manager never asked for a code");
        })
    }

    #[test]
    fn next_step_follows_the_state_machine() {
        let now = Utc::now();
        let valid = stored(now + ChronoDuration::minutes(5), Some("r"));
        let expired = stored(now, Some("r"));
        let no_refresh = stored(now + ChronoDuration::minutes(5), None);

        assert_eq!(next_step(None, false, now), AuthStep::Interactive);
        assert_eq!(next_step(Some(no_refresh), false, now), AuthStep::Interactive);
        assert_eq!(
            next_step(Some(expired.clone()), false, now),
            AuthStep::Refresh(expired)
        );
        assert_eq!(
            next_step(Some(valid.clone()), false, now),
            AuthStep::Ready(valid.clone())
        );
        assert_eq!(next_step(Some(valid), true, now), AuthStep::Interactive);
    }

    #[test]
    fn valid_credential_is_returned_without_network_calls() {
        let temp = TempDir::new().expect("tempdir");
        let endpoint = Arc::new(FakeEndpoint::default());
        let mgr = manager(&temp, endpoint.clone(), PendingCodes::default());
        let cred = stored(Utc::now() + ChronoDuration::hours(1), Some("r"));
        TokenStore::new(temp.path().join("token1.json"))
            .save(&cred)
            .expect("seed");

        assert_eq!(mgr.credential(false).expect("credential"), cred);
        assert_eq!(endpoint.refresh_calls.load(Ordering::SeqCst), 0);
        assert_eq!(endpoint.exchange_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn expired_credential_triggers_exactly_one_refresh_and_persists() {
        let temp = TempDir::new().expect("tempdir");
        let endpoint = Arc::new(FakeEndpoint::default());
        let mgr = manager(&temp, endpoint.clone(), PendingCodes::default());
        let store = TokenStore::new(temp.path().join("token1.json"));
        let old_expiry = Utc::now() - ChronoDuration::minutes(1);
        store.save(&stored(old_expiry, Some("keep-me"))).expect("seed");

        let cred = mgr.credential(false).expect("credential");

        assert_eq!(endpoint.refresh_calls.load(Ordering::SeqCst), 1);
        assert_eq!(cred.access_token, "refreshed");
        assert_eq!(cred.refresh_token.as_deref(), Some("keep-me"));
        assert!(cred.expiry > Utc::now());

        let on_disk = store.load().expect("load").expect("some");
        assert_eq!(on_disk, cred);
        assert!(on_disk.expiry > old_expiry);
    }

    #[test]
    fn failed_refresh_leaves_account_unauthorized() {
        let temp = TempDir::new().expect("tempdir");
        let endpoint = Arc::new(FakeEndpoint {
            fail: true,
            ..Default::default()
        });
        let mgr = manager(&temp, endpoint.clone(), PendingCodes::default());
        let store = TokenStore::new(temp.path().join("token1.json"));
        let seeded = stored(Utc::now() - ChronoDuration::minutes(1), Some("r"));
        store.save(&seeded).expect("seed");

        let err = mgr.credential(false).unwrap_err();
        assert!(matches!(err, DcpError::TokenRefreshFailed { .. }));
        assert_eq!(store.load().expect("load"), Some(seeded));
    }

    #[test]
    fn missing_credential_runs_interactive_exchange() {
        let temp = TempDir::new().expect("tempdir");
        let endpoint = Arc::new(FakeEndpoint::default());
        let pending = PendingCodes::default();
        let mgr = manager(&temp, endpoint.clone(), pending.clone());

        let feeder = deliver_when_pending(pending.clone(), "4/0code");
        let cred = mgr.credential(false).expect("credential");
        feeder.join().expect("feeder");

        assert_eq!(cred.access_token, "exchanged");
        assert_eq!(
            endpoint.seen_codes.lock().expect("lock").as_slice(),
            &[("4/0code".to_string(), "verifier".to_string())]
        );
        let on_disk = TokenStore::new(temp.path().join("token1.json"))
            .load()
            .expect("load");
        assert_eq!(on_disk, Some(cred));
        assert!(pending.pending_accounts().is_empty());
    }

    #[test]
    fn force_ignores_a_valid_stored_credential() {
        let temp = TempDir::new().expect("tempdir");
        let endpoint = Arc::new(FakeEndpoint::default());
        let pending = PendingCodes::default();
        let mgr = manager(&temp, endpoint.clone(), pending.clone());
        TokenStore::new(temp.path().join("token1.json"))
            .save(&stored(Utc::now() + ChronoDuration::hours(1), Some("r")))
            .expect("seed");

        let feeder = deliver_when_pending(pending, "forced");
        let cred = mgr.credential(true).expect("credential");
        feeder.join().expect("feeder");

        assert_eq!(cred.access_token, "exchanged");
        assert_eq!(endpoint.exchange_calls.load(Ordering::SeqCst), 1);
        assert_eq!(endpoint.refresh_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_exchange_does_not_write_a_credential() {
        let temp = TempDir::new().expect("tempdir");
        let endpoint = Arc::new(FakeEndpoint {
            fail: true,
            ..Default::default()
        });
        let pending = PendingCodes::default();
        let mgr = manager(&temp, endpoint, pending.clone());

        let feeder = deliver_when_pending(pending, "bad");
        let err = mgr.credential(false).unwrap_err();
        feeder.join().expect("feeder");

        assert!(matches!(err, DcpError::AuthExchangeFailed { .. }));
        assert!(!temp.path().join("token1.json").exists());
    }

    /// Answer the redirect as soon as the manager registers its wait.
    fn redirect_when_pending(
        pending: PendingCodes,
        url: &'static str,
    ) -> thread::JoinHandle<(u16, String)> {
        thread::spawn(move || {
            for _ in 0..500 {
                if !pending.pending_accounts().is_empty() {
                    return handle_callback(url, &pending);
                }
                thread::sleep(Duration::from_millis(10));
            }
            panic!("manager never asked for a code");
        })
    }

    #[test]
    fn redirect_page_reports_failed_exchange() {
        let temp = TempDir::new().expect("tempdir");
        let endpoint = Arc::new(FakeEndpoint {
            fail: true,
            ..Default::default()
        });
        let pending = PendingCodes::default();
        let mgr = manager(&temp, endpoint, pending.clone());

        let page = redirect_when_pending(pending, "/oauth/callback/primary?code=bad");
        assert!(mgr.credential(false).is_err());
        let (status, body) = page.join().expect("redirect thread");

        assert_eq!(status, 500);
        assert!(body.starts_with("Error retrieving access token"));
    }

    #[test]
    fn redirect_page_reports_stored_credential() {
        let temp = TempDir::new().expect("tempdir");
        let pending = PendingCodes::default();
        let mgr = manager(&temp, Arc::new(FakeEndpoint::default()), pending.clone());

        let page = redirect_when_pending(pending, "/oauth/callback/primary?code=good");
        let cred = mgr.credential(false).expect("credential");
        let (status, _) = page.join().expect("redirect thread");

        assert_eq!(status, 200);
        let on_disk = TokenStore::new(temp.path().join("token1.json"))
            .load()
            .expect("load");
        assert_eq!(on_disk, Some(cred));
    }

    #[test]
    fn concurrent_interactive_request_is_refused() {
        let temp = TempDir::new().expect("tempdir");
        let pending = PendingCodes::default();
        let mgr = manager(&temp, Arc::new(FakeEndpoint::default()), pending.clone());

        let _already = pending.register("primary").expect("register");
        let err = mgr.credential(false).unwrap_err();
        assert!(matches!(err, DcpError::NoCredentialAvailable { .. }));
    }
}
