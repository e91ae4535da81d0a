use base64::{Engine as _, engine::general_purpose};
use log::{debug, info, warn};
use mailparse::MailHeaderMap;
use native_tls::TlsConnector;

use crate::domain::problem::RawEmail;
use crate::error::{DcpError, Result};
use crate::mail::decoders::decode_subject;
use crate::mail::extract::SUBJECT_PHRASE;

type TlsSession = imap::Session<native_tls::TlsStream<std::net::TcpStream>>;

/// Source of candidate problem emails for one account.
pub trait Mailbox: Send + Sync {
    /// Every message whose subject contains the problem phrase. Individual
    /// fetch failures are logged and skipped.
    fn scan(&self, user: &str, access_token: &str) -> Result<Vec<RawEmail>>;
}

/// Build canonical auth string as bytes.
fn build_xoauth2_bytes(user: &str, access_token: &str) -> Vec<u8> {
    let user_field = format!("user={}", user);
    let auth_field = format!("auth=Bearer {}", access_token);
    let auth_string = format!("{}{}{}{}{}", user_field, "\x01", auth_field, "\x01", "\x01");
    auth_string.into_bytes()
}

struct OAuth2Authenticator {
    response: Vec<u8>,
}

impl imap::Authenticator for OAuth2Authenticator {
    type Response = Vec<u8>;
    fn process(&self, _challenge: &[u8]) -> Self::Response {
        self.response.clone()
    }
}

pub struct ImapClient {
    pub server: String,
    pub mailbox: String,
}

impl ImapClient {
    pub fn new(server: impl Into<String>, mailbox: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            mailbox: mailbox.into(),
        }
    }

    fn query_err(&self, e: impl std::fmt::Display) -> DcpError {
        DcpError::MailQueryFailed(format!("{}: {e}", self.server))
    }

    fn connect_and_auth(&self, user: &str, access_token: &str) -> Result<TlsSession> {
        let tls = TlsConnector::builder()
            .build()
            .map_err(|e| self.query_err(e))?;
        let mut client = imap::connect((self.server.as_str(), 993), self.server.as_str(), &tls)
            .map_err(|e| self.query_err(e))?;

        let raw_payload = build_xoauth2_bytes(user, access_token);

        // Try RAW first
        let auth_raw = OAuth2Authenticator {
            response: raw_payload.clone(),
        };
        match client.authenticate("XOAUTH2", &auth_raw) {
            Ok(session) => return Ok(session),
            Err((e, returned_client)) => {
                debug!("XOAUTH2 with raw payload failed for {user}: {e}");
                client = returned_client;
            }
        }

        // Fallback BASE64
        let b64_bytes = general_purpose::STANDARD.encode(&raw_payload).into_bytes();
        let auth_b64 = OAuth2Authenticator {
            response: b64_bytes,
        };
        client
            .authenticate("XOAUTH2", &auth_b64)
            .map_err(|(e, _)| self.query_err(format!("XOAUTH2 failed (raw+base64): {e}")))
    }

    /// Fetch one message by UID.
    fn fetch_one(&self, session: &mut TlsSession, uid: u32) -> Result<RawEmail> {
        let fetch_err = |message: String| DcpError::MailFetchFailed {
            id: uid.to_string(),
            message,
        };

        let fetches = session
            .uid_fetch(uid.to_string(), "(UID ENVELOPE BODY.PEEK[])")
            .map_err(|e| fetch_err(e.to_string()))?;
        let f = fetches
            .iter()
            .next()
            .ok_or_else(|| fetch_err("message not returned by server".to_string()))?;

        let raw = f
            .body()
            .map(|b| b.to_vec())
            .ok_or_else(|| fetch_err("message has no body".to_string()))?;

        // Subject from ENVELOPE, header fallback
        let subject = f
            .envelope()
            .and_then(|env| env.subject)
            .map(decode_subject)
            .or_else(|| {
                mailparse::parse_mail(&raw)
                    .ok()
                    .and_then(|pm| pm.headers.get_first_value("Subject"))
            })
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        Ok(RawEmail {
            id: uid.to_string(),
            subject,
            raw,
        })
    }
}

fn logout(session: &mut TlsSession, user: &str) {
    if let Err(e) = session.logout() {
        debug!("IMAP logout for {user} failed: {e}");
    }
}

impl Mailbox for ImapClient {
    fn scan(&self, user: &str, access_token: &str) -> Result<Vec<RawEmail>> {
        let mut session = self.connect_and_auth(user, access_token)?;
        session
            .select(&self.mailbox)
            .map_err(|e| DcpError::MailQueryFailed(format!("select {}: {e}", self.mailbox)))?;

        let uids = session
            .uid_search(format!("SUBJECT \"{SUBJECT_PHRASE}\""))
            .map_err(|e| DcpError::MailQueryFailed(format!("search: {e}")))?;

        if uids.is_empty() {
            info!("No matching emails found for {user}.");
            logout(&mut session, user);
            return Ok(vec![]);
        }

        let mut out = Vec::with_capacity(uids.len());
        for uid in uids {
            match self.fetch_one(&mut session, uid) {
                Ok(email) => out.push(email),
                Err(e) => warn!("{user}: {e}"),
            }
        }

        logout(&mut session, user);
        Ok(out)
    }
}
