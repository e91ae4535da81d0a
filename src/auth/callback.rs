//! Delivery of one-time authorization codes to the account waiting for them.
//!
//! Codes arrive either through the OAuth redirect (`GET
//! /oauth/callback/<account>?code=...`) or typed on the console by the
//! operator. Both paths end up in [`PendingCodes::deliver`].

use anyhow::{Result, anyhow};
use log::{info, warn};
use std::collections::HashMap;
use std::io::BufRead;
use std::net::SocketAddr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tiny_http::{Response, Server};
use url::Url;

pub const CALLBACK_PATH_PREFIX: &str = "/oauth/callback/";

/// How long a delivered code waits for the exchange result before the
/// sender gives up on it.
pub const EXCHANGE_REPORT_TIMEOUT: Duration = Duration::from_secs(120);

type ExchangeOutcome = std::result::Result<(), String>;

/// Registry of accounts currently waiting for an authorization code.
#[derive(Clone, Default)]
pub struct PendingCodes {
    inner: Arc<Mutex<Waiting>>,
}

#[derive(Default)]
struct Waiting {
    next_id: u64,
    by_account: HashMap<String, (u64, Sender<ReceivedCode>)>,
}

/// A registered wait for one account's code. Dropping it withdraws the
/// registration.
pub struct PendingCode {
    account: String,
    id: u64,
    rx: Receiver<ReceivedCode>,
    registry: PendingCodes,
}

/// A code handed to the waiting account. The exchange result goes back to
/// whoever delivered it through [`ReceivedCode::report`].
pub struct ReceivedCode {
    pub code: String,
    outcome: Sender<ExchangeOutcome>,
}

impl ReceivedCode {
    pub fn report(self, outcome: ExchangeOutcome) {
        // the sender may have stopped listening
        let _ = self.outcome.send(outcome);
    }
}

/// Held by the deliverer of a code until the exchange finishes.
pub struct ExchangeReceipt {
    rx: Receiver<ExchangeOutcome>,
}

impl ExchangeReceipt {
    /// The exchange result, or `None` if it did not arrive within `timeout`.
    pub fn outcome(&self, timeout: Duration) -> Option<ExchangeOutcome> {
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => Some(outcome),
            Err(RecvTimeoutError::Disconnected) => {
                Some(Err("the authorization was abandoned".to_string()))
            }
            Err(RecvTimeoutError::Timeout) => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum DeliveryError {
    NotPending(String),
    NothingPending,
    Ambiguous(Vec<String>),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::NotPending(account) => {
                write!(f, "no authorization is pending for account {account}")
            }
            DeliveryError::NothingPending => write!(f, "no authorization is pending"),
            DeliveryError::Ambiguous(accounts) => write!(
                f,
                "several authorizations are pending ({}); prefix the code with the account name",
                accounts.join(", ")
            ),
        }
    }
}

impl PendingCodes {
    /// Start waiting for a code for `account`. Fails when a wait is already
    /// registered for it.
    pub fn register(&self, account: &str) -> Result<PendingCode> {
        let mut waiting = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if waiting.by_account.contains_key(account) {
            return Err(anyhow!("an authorization is already pending"));
        }
        let id = waiting.next_id;
        waiting.next_id += 1;
        let (tx, rx) = mpsc::channel();
        waiting.by_account.insert(account.to_string(), (id, tx));
        Ok(PendingCode {
            account: account.to_string(),
            id,
            rx,
            registry: self.clone(),
        })
    }

    pub fn deliver(&self, account: &str, code: String) -> Result<ExchangeReceipt, DeliveryError> {
        let waiting = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let Some((_, tx)) = waiting.by_account.get(account) else {
            return Err(DeliveryError::NotPending(account.to_string()));
        };
        let (outcome, rx) = mpsc::channel();
        tx.send(ReceivedCode { code, outcome })
            .map_err(|_| DeliveryError::NotPending(account.to_string()))?;
        Ok(ExchangeReceipt { rx })
    }

    /// Deliver to the single pending account; returns its name.
    pub fn deliver_to_sole(
        &self,
        code: String,
    ) -> Result<(String, ExchangeReceipt), DeliveryError> {
        let account = {
            let mut names = self.pending_accounts();
            match names.len() {
                0 => return Err(DeliveryError::NothingPending),
                1 => names.remove(0),
                _ => return Err(DeliveryError::Ambiguous(names)),
            }
        };
        let receipt = self.deliver(&account, code)?;
        Ok((account, receipt))
    }

    pub fn pending_accounts(&self) -> Vec<String> {
        let waiting = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<String> = waiting.by_account.keys().cloned().collect();
        names.sort();
        names
    }

    /// Remove the registration `id`; a newer one for the account stays.
    fn withdraw(&self, account: &str, id: u64) {
        let mut waiting = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if waiting
            .by_account
            .get(account)
            .is_some_and(|(current, _)| *current == id)
        {
            waiting.by_account.remove(account);
        }
    }
}

impl PendingCode {
    /// Block until a code arrives or `timeout` elapses. Once it has timed
    /// out, further deliveries are refused.
    pub fn wait(&self, timeout: Duration) -> Option<ReceivedCode> {
        match self.rx.recv_timeout(timeout) {
            Ok(code) => Some(code),
            Err(RecvTimeoutError::Timeout) => {
                self.registry.withdraw(&self.account, self.id);
                // delivered between the timeout and the withdrawal
                self.rx.try_recv().ok()
            }
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

impl Drop for PendingCode {
    fn drop(&mut self) {
        self.registry.withdraw(&self.account, self.id);
    }
}

/// Route one redirect request. Returns the HTTP status and page text once
/// the waiting account has finished (or given up on) the code exchange.
pub fn handle_callback(request_url: &str, pending: &PendingCodes) -> (u16, String) {
    // request_url is a path+query like "/oauth/callback/primary?code=..."
    let Ok(parsed) = Url::parse(&format!("http://localhost{request_url}")) else {
        return (400, "Bad redirect.".to_string());
    };

    let Some(account) = parsed
        .path()
        .strip_prefix(CALLBACK_PATH_PREFIX)
        .filter(|a| !a.is_empty() && !a.contains('/'))
    else {
        return (404, "Not found.".to_string());
    };

    let code = parsed
        .query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.into_owned())
        .filter(|c| !c.is_empty());

    let Some(code) = code else {
        warn!("OAuth callback for {account} carried no code");
        return (400, "No code found in the request.".to_string());
    };

    let receipt = match pending.deliver(account, code) {
        Ok(receipt) => receipt,
        Err(e) => {
            warn!("Rejected OAuth callback: {e}");
            return (409, format!("Error: {e}."));
        }
    };
    info!("Authorization code received for account {account} via redirect");

    match receipt.outcome(EXCHANGE_REPORT_TIMEOUT) {
        Some(Ok(())) => (
            200,
            "Authentication successful! You can close this tab.".to_string(),
        ),
        Some(Err(e)) => (500, format!("Error retrieving access token: {e}")),
        None => (
            504,
            "The token exchange is taking too long; check the bot's log.".to_string(),
        ),
    }
}

/// Bind the redirect listener and serve it on a background thread.
pub fn spawn_callback_listener(bind: SocketAddr, pending: PendingCodes) -> Result<JoinHandle<()>> {
    let server = Server::http(bind)
        .map_err(|e| anyhow!("Failed to bind OAuth callback server on {bind}: {e:?}"))?;
    info!("OAuth callback listener on http://{bind}{CALLBACK_PATH_PREFIX}<account>");

    let handle = thread::Builder::new()
        .name("oauth-callback".to_string())
        .spawn(move || {
            for request in server.incoming_requests() {
                let (status, body) = handle_callback(request.url(), &pending);
                if let Err(e) = request.respond(Response::from_string(body).with_status_code(status))
                {
                    warn!("Failed to answer OAuth callback: {e}");
                }
            }
        })?;
    Ok(handle)
}

/// Like [`spawn_callback_listener`], but when `required` is false a bind
/// failure (e.g. the running bot already holds the address) only leaves
/// console intake.
pub fn start_redirect_intake(
    bind: SocketAddr,
    pending: PendingCodes,
    required: bool,
) -> Result<Option<JoinHandle<()>>> {
    match spawn_callback_listener(bind, pending) {
        Ok(handle) => Ok(Some(handle)),
        Err(e) if !required => {
            warn!("{e}; enter the code on the console instead");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Split an operator line into `(account, code)`; a bare code has no account.
pub fn parse_console_line(line: &str) -> Option<(Option<&str>, &str)> {
    let mut words = line.split_whitespace();
    let first = words.next()?;
    match (words.next(), words.next()) {
        (None, _) => Some((None, first)),
        (Some(code), None) => Some((Some(first), code)),
        (Some(_), Some(_)) => None,
    }
}

/// Read authorization codes typed by the operator on stdin.
pub fn spawn_console_reader(pending: PendingCodes) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name("oauth-console".to_string())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let result = match parse_console_line(&line) {
                    Some((Some(account), code)) => pending
                        .deliver(account, code.to_string())
                        .map(|receipt| (account.to_string(), receipt)),
                    Some((None, code)) => pending.deliver_to_sole(code.to_string()),
                    None => {
                        warn!("Expected `<account> <code>` or `<code>`");
                        continue;
                    }
                };
                let (account, receipt) = match result {
                    Ok(delivered) => delivered,
                    Err(e) => {
                        warn!("Could not use the entered code: {e}");
                        continue;
                    }
                };
                info!("Authorization code received for account {account}");
                match receipt.outcome(EXCHANGE_REPORT_TIMEOUT) {
                    Some(Ok(())) => info!("Account {account} is authorized"),
                    Some(Err(e)) => warn!("Authorization of {account} failed: {e}"),
                    None => warn!("Authorization of {account} is still running"),
                }
            }
        })?;
    Ok(handle)
}
