//! GitHub Actions OIDC id tokens
//!
//! The stored value is the audience. Inside a workflow job with
//! `id-token: write`, the runner exposes a request url and bearer token; the
//! id token it returns is the credential, and its `exp` claim is the expiry.

use crate::error::{KeyrackError, Result};
use crate::mech::{MechContext, MechOutput};
use crate::secret::SecretValue;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, TimeZone, Utc};
use serde::Deserialize;
use tracing::debug;

const MECH: &str = "EPHEMERAL_VIA_GITHUB_OIDC";

pub const REQUEST_URL_ENV: &str = "ACTIONS_ID_TOKEN_REQUEST_URL";
pub const REQUEST_TOKEN_ENV: &str = "ACTIONS_ID_TOKEN_REQUEST_TOKEN";

#[derive(Deserialize)]
struct IdTokenResponse {
    value: SecretValue,
}

#[derive(Deserialize)]
struct ExpiryClaim {
    exp: Option<i64>,
}

/// Read `exp` from an unverified JWT payload
///
/// The token came straight from the runner; only its expiry is needed here,
/// verification is the relying party's job.
pub fn token_expiry(jwt: &str) -> Option<DateTime<Utc>> {
    let payload = jwt.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claim: ExpiryClaim = serde_json::from_slice(&bytes).ok()?;
    Utc.timestamp_opt(claim.exp?, 0).single()
}

pub async fn exchange(audience: &SecretValue, ctx: &MechContext) -> Result<MechOutput> {
    let (url, token) = ctx
        .oidc_request
        .as_ref()
        .ok_or_else(|| KeyrackError::MechNotAuthorized {
            mech: MECH.to_string(),
            fix: format!(
                "run inside a GitHub Actions job with `permissions: id-token: write` ({} unset)",
                REQUEST_URL_ENV
            ),
        })?;

    let mut request = ctx.http.get(url).bearer_auth(token.expose());
    let audience = audience.expose().trim();
    if !audience.is_empty() {
        request = request.query(&[("audience", audience)]);
    }

    let response = request
        .send()
        .await
        .map_err(|e| KeyrackError::mech(MECH, format!("request failed: {}", e.without_url())))?;

    if !response.status().is_success() {
        return Err(KeyrackError::mech(
            MECH,
            format!("actions runtime returned status {}", response.status().as_u16()),
        ));
    }

    let body: IdTokenResponse = response
        .json()
        .await
        .map_err(|_| KeyrackError::mech(MECH, "unexpected id token response"))?;

    let expires_at = token_expiry(body.value.expose());
    debug!(audience = audience, expires_at = ?expires_at, "issued oidc id token");

    Ok(MechOutput {
        value: body.value,
        expires_at,
    })
}
