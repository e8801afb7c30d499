//! Deep-link auth callback parsing.
//!
//! The identity provider redirects to `bizdesk://auth-callback#access_token=…`
//! after the browser sign-in. Tokens normally arrive in the fragment; some
//! providers put them in the query string instead, so both are accepted.

use crate::licensing::types::LicensingError;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Bearer session obtained from the identity provider
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
pub struct AuthSession {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    /// Epoch seconds
    pub expires_at: Option<i64>,
}

impl AuthSession {
    pub fn is_expired(&self, now_secs: i64) -> bool {
        self.expires_at.map(|exp| exp <= now_secs).unwrap_or(false)
    }
}

/// Claims we read from the access token payload
#[derive(Deserialize, Debug, Default)]
struct TokenClaims {
    exp: Option<i64>,
}

/// Extract the bearer session from a callback URL
pub fn parse_callback_url(url: &str, now_secs: i64) -> Result<AuthSession, LicensingError> {
    let params = callback_params(url)?;

    if let Some(error) = params.get("error_description").or_else(|| params.get("error")) {
        return Err(LicensingError::MalformedCallback(error.clone()));
    }

    let access_token = params
        .get("access_token")
        .filter(|t| !t.is_empty())
        .ok_or_else(|| LicensingError::MalformedCallback("missing access_token".to_string()))?;

    let claims = decode_claims(access_token)?;
    let expires_at = claims.exp.or_else(|| {
        params
            .get("expires_in")
            .and_then(|s| s.parse::<i64>().ok())
            .map(|secs| now_secs + secs)
    });

    Ok(AuthSession {
        access_token: access_token.clone(),
        refresh_token: params.get("refresh_token").cloned(),
        token_type: params
            .get("token_type")
            .cloned()
            .unwrap_or_else(|| "bearer".to_string()),
        expires_at,
    })
}

fn callback_params(url: &str) -> Result<HashMap<String, String>, LicensingError> {
    let raw = match url.split_once('#') {
        Some((_, fragment)) if !fragment.is_empty() => fragment,
        _ => url
            .split_once('?')
            .map(|(_, query)| query.split('#').next().unwrap_or(query))
            .ok_or_else(|| LicensingError::MalformedCallback("no parameters in URL".to_string()))?,
    };

    let mut params = HashMap::new();
    for pair in raw.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = urlencoding::decode(&value.replace('+', " "))
            .map_err(|e| LicensingError::MalformedCallback(format!("bad encoding: {}", e)))?
            .into_owned();
        params.insert(key.to_string(), value);
    }

    Ok(params)
}

fn decode_claims(token: &str) -> Result<TokenClaims, LicensingError> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(LicensingError::MalformedCallback(
            "access_token is not a JWT".to_string(),
        ));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(segments[1].trim_end_matches('='))
        .map_err(|e| LicensingError::MalformedCallback(format!("bad token payload: {}", e)))?;

    serde_json::from_slice(&payload)
        .map_err(|e| LicensingError::MalformedCallback(format!("bad token claims: {}", e)))
}

#[cfg(test)]
pub(crate) fn test_token(exp: i64) -> String {
    let payload = URL_SAFE_NO_PAD.encode(format!(r#"{{"sub":"u-1","exp":{}}}"#, exp));
    format!("eyJhbGciOiJIUzI1NiJ9.{}.c2lnbmF0dXJl", payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_tokens() {
        let url = format!(
            "bizdesk://auth-callback#access_token={}&refresh_token=r-1&expires_in=3600&token_type=bearer",
            test_token(2_000)
        );

        let session = parse_callback_url(&url, 1_000).unwrap();
        assert_eq!(session.refresh_token.as_deref(), Some("r-1"));
        assert_eq!(session.expires_at, Some(2_000));
        assert!(!session.is_expired(1_999));
        assert!(session.is_expired(2_000));
    }

    #[test]
    fn test_query_tokens_fall_back_to_expires_in() {
        let payload = URL_SAFE_NO_PAD.encode(r#"{"sub":"u-1"}"#);
        let token = format!("h.{}.s", payload);
        let url = format!("bizdesk://auth-callback?access_token={}&expires_in=60", token);

        let session = parse_callback_url(&url, 100).unwrap();
        assert_eq!(session.expires_at, Some(160));
        assert_eq!(session.token_type, "bearer");
    }

    #[test]
    fn test_provider_error_is_reported() {
        let url = "bizdesk://auth-callback#error=access_denied&error_description=User%20cancelled";
        let err = parse_callback_url(url, 0).unwrap_err();
        assert_eq!(err.to_string(), "Malformed auth callback: User cancelled");
    }

    #[test]
    fn test_malformed_tokens_rejected() {
        assert!(parse_callback_url("bizdesk://auth-callback", 0).is_err());
        assert!(parse_callback_url("bizdesk://auth-callback#refresh_token=x", 0).is_err());
        assert!(parse_callback_url("bizdesk://auth-callback#access_token=not-a-jwt", 0).is_err());
        assert!(parse_callback_url("bizdesk://auth-callback#access_token=a.%%%.c", 0).is_err());
    }
}
