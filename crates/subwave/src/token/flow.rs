// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OAuth endpoint calls: authorization URL, code exchange, refresh, validation.

use rand::Rng;
use serde::Deserialize;

use crate::error::{BotError, Result};

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Sometimes omitted on refresh; the previous value is then kept verbatim.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
    #[serde(default)]
    pub scope: Option<Vec<String>>,
}

/// `/oauth2/validate` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidateResponse {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub expires_in: u64,
}

/// Generate the OAuth `state` parameter: 14 random bytes, hex-encoded.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 14];
    rand::rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Build the full authorization URL for the code flow.
pub fn build_auth_url(
    authorize_url: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &[String],
    state: &str,
) -> String {
    let params = urlencoded(&[
        ("client_id", client_id),
        ("redirect_uri", redirect_uri),
        ("response_type", "code"),
        ("scope", &scopes.join(" ")),
        ("state", state),
    ]);
    format!("{authorize_url}?{params}")
}

/// Exchange an authorization code for a token.
pub async fn exchange_code(
    client: &reqwest::Client,
    token_url: &str,
    client_id: &str,
    client_secret: &str,
    code: &str,
    redirect_uri: &str,
) -> Result<TokenResponse> {
    token_request(
        client,
        token_url,
        &[
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("code", code),
            ("grant_type", "authorization_code"),
            ("redirect_uri", redirect_uri),
        ],
    )
    .await
}

/// Refresh an existing token.
pub async fn refresh_token(
    client: &reqwest::Client,
    token_url: &str,
    client_id: &str,
    client_secret: &str,
    refresh_token: &str,
) -> Result<TokenResponse> {
    token_request(
        client,
        token_url,
        &[
            ("client_id", client_id),
            ("client_secret", client_secret),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ],
    )
    .await
}

/// Shared token endpoint POST for new and refreshed tokens.
async fn token_request(
    client: &reqwest::Client,
    token_url: &str,
    form: &[(&str, &str)],
) -> Result<TokenResponse> {
    let resp = client
        .post(token_url)
        .header("Accept", "application/json")
        .form(form)
        .send()
        .await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(BotError::TokenExchange { status: status.as_u16(), body });
    }
    Ok(resp.json().await?)
}

/// Validate an access token. Non-200 surfaces as [`BotError::Http`].
pub async fn validate(
    client: &reqwest::Client,
    validate_url: &str,
    access_token: &str,
) -> Result<ValidateResponse> {
    let resp = client
        .get(validate_url)
        .header("Authorization", format!("OAuth {access_token}"))
        .send()
        .await?;
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(BotError::Http { status: status.as_u16(), body });
    }
    Ok(resp.json().await?)
}

/// Build a URL-encoded query string.
fn urlencoded(params: &[(&str, &str)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding(k), urlencoding(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn urlencoding(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => c.to_string(),
            _ => format!("%{:02X}", c as u8),
        })
        .collect()
}

#[cfg(test)]
#[path = "flow_tests.rs"]
mod tests;
