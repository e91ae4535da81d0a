use anyhow::{Result, anyhow};
use oauth2::TokenResponse;
use oauth2::basic::BasicClient;
use oauth2::reqwest::http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenUrl,
};
use url::Url;

const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
/// Full mailbox scope; IMAP XOAUTH2 does not accept the narrower Gmail API scopes.
pub const MAIL_SCOPE: &str = "https://mail.google.com/";

/// Tokens returned by the oauth flow (in-memory)
#[derive(Debug, Clone)]
pub struct Tokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// An authorization URL plus the PKCE verifier that must accompany the code
/// exchange for it.
pub struct AuthRequest {
    pub url: Url,
    pub pkce_verifier: String,
}

/// The provider side of the authorization dance.
pub trait TokenEndpoint: Send + Sync {
    fn authorization_request(&self) -> AuthRequest;
    fn exchange_code(&self, code: &str, pkce_verifier: &str) -> Result<Tokens>;
    fn refresh(&self, refresh_token: &str) -> Result<Tokens>;
}

/// Google OAuth client bound to one redirect URI.
pub struct GoogleOAuth {
    client: BasicClient,
    redirect_uri: String,
}

impl GoogleOAuth {
    pub fn new(client_id: &str, client_secret: Option<&str>, redirect_uri: &str) -> Result<Self> {
        let client_id = ClientId::new(client_id.to_string());
        let client_secret = client_secret.map(|s| ClientSecret::new(s.to_string()));

        let auth_url = AuthUrl::new(GOOGLE_AUTH_URL.to_string())?;
        let token_url = TokenUrl::new(GOOGLE_TOKEN_URL.to_string())?;
        let redirect = RedirectUrl::new(redirect_uri.to_string())
            .map_err(|e| anyhow!("Invalid redirect_uri '{redirect_uri}': {e}"))?;

        let client = BasicClient::new(client_id, client_secret, auth_url, Some(token_url))
            .set_redirect_uri(redirect);

        Ok(Self {
            client,
            redirect_uri: redirect_uri.to_string(),
        })
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }
}

impl TokenEndpoint for GoogleOAuth {
    fn authorization_request(&self) -> AuthRequest {
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        // offline + consent so Google hands out a refresh token every time
        let (url, _csrf_token) = self
            .client
            .authorize_url(CsrfToken::new_random)
            .add_scope(Scope::new(MAIL_SCOPE.to_string()))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .set_pkce_challenge(pkce_challenge)
            .url();

        AuthRequest {
            url,
            pkce_verifier: pkce_verifier.secret().to_string(),
        }
    }

    fn exchange_code(&self, code: &str, pkce_verifier: &str) -> Result<Tokens> {
        let token = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(pkce_verifier.to_string()))
            .request(http_client)
            .map_err(|err| anyhow!("{err:?}"))?;

        Ok(Tokens {
            access_token: token.access_token().secret().to_string(),
            refresh_token: token.refresh_token().map(|r| r.secret().to_string()),
            expires_in: token.expires_in().map(|d| d.as_secs()),
        })
    }

    fn refresh(&self, refresh_token: &str) -> Result<Tokens> {
        let rt = RefreshToken::new(refresh_token.to_string());
        let token = self
            .client
            .exchange_refresh_token(&rt)
            .request(http_client)
            .map_err(|err| anyhow!("{err:?}"))?;

        Ok(Tokens {
            access_token: token.access_token().secret().to_string(),
            refresh_token: token.refresh_token().map(|r| r.secret().to_string()),
            expires_in: token.expires_in().map(|d| d.as_secs()),
        })
    }
}
