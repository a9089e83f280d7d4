//! OAuth login over an ephemeral loopback redirect.
//!
//! One login attempt at a time: starting a new attempt stops the previous
//! one. The local server only serves `/callback` and only honors the state
//! value minted for the current attempt.

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration as ChronoDuration, Utc};
use oauth2::basic::BasicClient;
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, CsrfToken, PkceCodeChallenge, PkceCodeVerifier,
    RedirectUrl, Scope, TokenResponse, TokenUrl,
};
use rand::RngCore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::endpoints::Endpoints;

pub mod account;

pub use account::{Account, Auth, Patchline, Profile, Token};

pub const CLIENT_ID: &str = "hytale-launcher";
pub const SCOPES: &str = "openid offline auth:launcher";

const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

const SUCCESS_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head><title>Login Successful</title></head>
<body style="background:#1b2636;color:#d2d9e2;font-family:sans-serif;display:flex;justify-content:center;align-items:center;height:100vh;margin:0;">
<div style="text-align:center;">
<h1>Login Successful</h1>
<p>You can close this window and return to the Hytale Launcher.</p>
</div>
</body>
</html>"#;

/// State and PKCE verifier minted for one attempt.
struct AttemptState {
    state: String,
    verifier: String,
}

struct CallbackCtx {
    attempt: Mutex<Option<AttemptState>>,
    config: BasicClient,
    results: mpsc::Sender<Result<Token>>,
}

/// A single OAuth login attempt backed by a localhost callback server.
pub struct Loopback {
    pub port: u16,
    pub redirect_url: String,
    ctx: Arc<CallbackCtx>,
    results: tokio::sync::Mutex<mpsc::Receiver<Result<Token>>>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    server: tokio::task::JoinHandle<()>,
}

fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

impl Loopback {
    /// Bind the callback server and return the attempt plus the URL to
    /// open in the user's browser.
    pub async fn start(endpoints: &Endpoints) -> Result<(Loopback, String)> {
        let state = random_urlsafe(32);
        let verifier = random_urlsafe(64);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .context("failed to start loopback server")?;
        let port = listener.local_addr()?.port();
        let redirect_url = format!("http://127.0.0.1:{}/callback", port);

        log::info!("loopback server starting: port={}", port);

        let config = BasicClient::new(
            ClientId::new(CLIENT_ID.to_string()),
            None,
            AuthUrl::new(endpoints.oauth_auth())?,
            Some(TokenUrl::new(endpoints.oauth_token())?),
        )
        .set_redirect_uri(RedirectUrl::new(redirect_url.clone())?);

        let challenge =
            PkceCodeChallenge::from_code_verifier_sha256(&PkceCodeVerifier::new(verifier.clone()));

        let csrf = state.clone();
        let (auth_url, _csrf) = config
            .authorize_url(move || CsrfToken::new(csrf))
            .add_scope(Scope::new(SCOPES.to_string()))
            .set_pkce_challenge(challenge)
            .url();

        let (result_tx, result_rx) = mpsc::channel(1);
        let ctx = Arc::new(CallbackCtx {
            attempt: Mutex::new(Some(AttemptState { state, verifier })),
            config,
            results: result_tx,
        });

        let router = Router::new()
            .route("/callback", get(handle_callback))
            .with_state(ctx.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                log::error!("loopback server error: {}", err);
            }
        });

        log::debug!("generated OAuth URL: {}", auth_url);

        Ok((
            Loopback {
                port,
                redirect_url,
                ctx,
                results: tokio::sync::Mutex::new(result_rx),
                shutdown: Mutex::new(Some(shutdown_tx)),
                server,
            },
            auth_url.to_string(),
        ))
    }

    /// Block until the flow completes or `timeout` expires.
    pub async fn wait(&self, timeout: Duration) -> Result<Token> {
        let mut rx = self.results.lock().await;
        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(result)) => result,
            Ok(None) => anyhow::bail!("login attempt was stopped"),
            Err(_) => anyhow::bail!("login timeout"),
        }
    }

    /// Shut the callback server down and invalidate the attempt.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().unwrap().take() {
            let _ = tx.send(());
        }
        self.server.abort();
        *self.ctx.attempt.lock().unwrap() = None;
        log::debug!("loopback server stopped: port={}", self.port);
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn handle_callback(
    State(ctx): State<Arc<CallbackCtx>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let expected_state = {
        let attempt = ctx.attempt.lock().unwrap();
        match attempt.as_ref() {
            Some(a) => a.state.clone(),
            None => {
                return (StatusCode::BAD_REQUEST, "No login in progress").into_response();
            }
        }
    };

    // A stale or forged state never resolves the attempt; the legitimate
    // callback can still arrive.
    if params.get("state").map(String::as_str) != Some(expected_state.as_str()) {
        return (StatusCode::BAD_REQUEST, "Invalid state parameter").into_response();
    }

    if let Some(error) = params.get("error") {
        let description = params
            .get("error_description")
            .cloned()
            .unwrap_or_default();
        let _ = ctx
            .results
            .try_send(Err(anyhow::anyhow!(
                "authorization error: {} - {}",
                error,
                description
            )));
        return (
            StatusCode::BAD_REQUEST,
            format!("Authorization error: {}", description),
        )
            .into_response();
    }

    let code = match params.get("code") {
        Some(code) if !code.is_empty() => code.clone(),
        _ => {
            let _ = ctx
                .results
                .try_send(Err(anyhow::anyhow!("no authorization code received")));
            return (StatusCode::BAD_REQUEST, "No authorization code received").into_response();
        }
    };

    // Answer the browser immediately; the token exchange continues in the
    // background.
    let exchange_ctx = ctx.clone();
    tokio::spawn(async move {
        let result = exchange_code(&exchange_ctx, code).await;
        if let Err(err) = &result {
            log::error!("failed to exchange code for tokens: {:#}", err);
        } else {
            log::info!("login successful, received tokens");
        }
        let _ = exchange_ctx.results.try_send(result);
    });

    Html(SUCCESS_PAGE).into_response()
}

async fn exchange_code(ctx: &CallbackCtx, code: String) -> Result<Token> {
    let verifier = {
        let attempt = ctx.attempt.lock().unwrap();
        attempt
            .as_ref()
            .map(|a| a.verifier.clone())
            .context("no login state available")?
    };

    let exchange = ctx
        .config
        .exchange_code(AuthorizationCode::new(code))
        .set_pkce_verifier(PkceCodeVerifier::new(verifier))
        .request_async(async_http_client);

    let response = tokio::time::timeout(EXCHANGE_TIMEOUT, exchange)
        .await
        .map_err(|_| anyhow::anyhow!("token exchange timed out"))?
        .map_err(|e| anyhow::anyhow!("token exchange failed: {:?}", e))?;

    Ok(Token {
        access_token: response.access_token().secret().clone(),
        refresh_token: response
            .refresh_token()
            .map(|t| t.secret().clone())
            .unwrap_or_default(),
        expiry: response
            .expires_in()
            .map(|d| Utc::now() + ChronoDuration::seconds(d.as_secs() as i64)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn test_endpoints(base: &str) -> Endpoints {
        Endpoints {
            launcher_base: base.to_string(),
            account_base: base.to_string(),
            oauth_base: base.to_string(),
        }
    }

    fn query_params(url: &str) -> HashMap<String, String> {
        let parsed = url::Url::parse(url).unwrap();
        parsed
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect()
    }

    #[tokio::test]
    async fn start_produces_a_pkce_s256_authorization_url() {
        let (loopback, auth_url) =
            Loopback::start(&test_endpoints("https://oauth.example.invalid"))
                .await
                .unwrap();

        let params = query_params(&auth_url);
        assert_eq!(params.get("response_type").unwrap(), "code");
        assert_eq!(params.get("client_id").unwrap(), CLIENT_ID);
        assert_eq!(params.get("code_challenge_method").unwrap(), "S256");
        assert_eq!(params.get("scope").unwrap(), SCOPES);
        assert_eq!(
            params.get("redirect_uri").unwrap(),
            &format!("http://127.0.0.1:{}/callback", loopback.port)
        );

        // The challenge is base64url(SHA-256(verifier)), no padding.
        let verifier = {
            let attempt = loopback.ctx.attempt.lock().unwrap();
            attempt.as_ref().unwrap().verifier.clone()
        };
        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        assert_eq!(params.get("code_challenge").unwrap(), &expected);

        loopback.stop();
    }

    #[tokio::test]
    async fn callback_rejects_wrong_state_without_resolving_wait() {
        let (loopback, auth_url) =
            Loopback::start(&test_endpoints("https://oauth.example.invalid"))
                .await
                .unwrap();
        let state = query_params(&auth_url).remove("state").unwrap();

        let client = reqwest::Client::new();
        let resp = client
            .get(format!(
                "http://127.0.0.1:{}/callback?code=X&state=forged",
                loopback.port
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);

        // The attempt is still pending: wait times out instead of failing.
        let err = loopback.wait(Duration::from_millis(200)).await.unwrap_err();
        assert!(err.to_string().contains("login timeout"));

        // The real state is still honored afterwards (error branch resolves
        // the attempt, proving the slot survived the forged callback).
        let resp = client
            .get(format!(
                "http://127.0.0.1:{}/callback?error=access_denied&error_description=nope&state={}",
                loopback.port, state
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 400);

        let err = loopback.wait(Duration::from_secs(2)).await.unwrap_err();
        assert!(err.to_string().contains("access_denied"));

        loopback.stop();
    }

    #[tokio::test]
    async fn happy_path_exchanges_the_code() {
        // Local token endpoint standing in for the OAuth server.
        let token_router = Router::new().route(
            "/oauth2/token",
            axum::routing::post(|| async {
                axum::Json(serde_json::json!({
                    "access_token": "at-123",
                    "refresh_token": "rt-456",
                    "token_type": "bearer",
                    "expires_in": 3600
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, token_router).await.unwrap();
        });

        let (loopback, auth_url) = Loopback::start(&test_endpoints(&format!("http://{}", addr)))
            .await
            .unwrap();
        let state = query_params(&auth_url).remove("state").unwrap();

        let resp = reqwest::Client::new()
            .get(format!(
                "http://127.0.0.1:{}/callback?code=auth-code&state={}",
                loopback.port, state
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        assert!(resp.text().await.unwrap().contains("Login Successful"));

        let token = loopback.wait(Duration::from_secs(5)).await.unwrap();
        assert_eq!(token.access_token, "at-123");
        assert_eq!(token.refresh_token, "rt-456");
        assert!(token.expiry.is_some());

        loopback.stop();
    }

    #[tokio::test]
    async fn stopped_attempt_is_unreachable() {
        let (loopback, _auth_url) =
            Loopback::start(&test_endpoints("https://oauth.example.invalid"))
                .await
                .unwrap();
        let port = loopback.port;
        loopback.stop();

        // Server is down; the callback no longer answers.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let result = reqwest::Client::new()
            .get(format!("http://127.0.0.1:{}/callback?code=X&state=Y", port))
            .timeout(Duration::from_millis(500))
            .send()
            .await;
        assert!(result.is_err() || result.unwrap().status().as_u16() == 400);
    }
}
