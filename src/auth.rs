//! Authentication guards (§6 Auth): a bearer API key hashed and looked up against issued
//! keys, with optional binding to a single target agent and single-use consumption; a
//! separate guard for the master key that gates `/api/keys/*` key management.

use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::State;

use crate::config::HubConfig;
use crate::crypto;
use crate::models::IssuedKey;
use crate::storage::Storage;

/// An authenticated caller, resolved from a bearer token against the issued-keys store.
/// Present on every guarded route; `bound_agent_id` narrows which agent the key may act as.
pub struct ApiKey {
    pub key_id: String,
    pub bound_agent_id: Option<String>,
}

#[derive(Debug)]
pub enum ApiKeyError {
    Missing,
    Invalid,
    Revoked,
    Expired,
    AlreadyUsed,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ApiKey {
    type Error = ApiKeyError;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let config = match req.guard::<&State<HubConfig>>().await {
            Outcome::Success(c) => c,
            _ => return Outcome::Error((Status::InternalServerError, ApiKeyError::Invalid)),
        };

        if !config.api_key_required {
            return Outcome::Success(ApiKey {
                key_id: "anonymous".into(),
                bound_agent_id: None,
            });
        }

        let Some(token) = bearer_token(req) else {
            return Outcome::Error((Status::Unauthorized, ApiKeyError::Missing));
        };

        let storage = match req.guard::<&State<std::sync::Arc<dyn Storage>>>().await {
            Outcome::Success(s) => s,
            _ => return Outcome::Error((Status::InternalServerError, ApiKeyError::Invalid)),
        };

        let key_hash = crypto::sha256_hex(&token);
        let issued: IssuedKey = match storage.get_issued_key_by_hash(&key_hash).await {
            Ok(k) => k,
            Err(_) => return Outcome::Error((Status::Unauthorized, ApiKeyError::Invalid)),
        };

        if issued.revoked {
            return Outcome::Error((Status::Unauthorized, ApiKeyError::Revoked));
        }
        if let Some(expires_at) = &issued.expires_at
            && let Ok(deadline) = chrono::DateTime::parse_from_rfc3339(expires_at)
            && deadline.with_timezone(&chrono::Utc) < chrono::Utc::now()
        {
            return Outcome::Error((Status::Unauthorized, ApiKeyError::Expired));
        }
        if issued.single_use && issued.used_at.is_some() {
            return Outcome::Error((Status::Unauthorized, ApiKeyError::AlreadyUsed));
        }
        if issued.single_use {
            let _ = storage.mark_issued_key_used(&issued.key_id).await;
        }

        Outcome::Success(ApiKey {
            key_id: issued.key_id,
            bound_agent_id: issued.target_agent_id,
        })
    }
}

impl ApiKey {
    /// Confirms this key is either unbound or bound to exactly `agent_id`, per §6 "a key
    /// bound to a target agent may only be used to act as that agent".
    pub fn authorize_as(&self, agent_id: &str) -> Result<(), crate::error::HubError> {
        match &self.bound_agent_id {
            Some(bound) if bound != agent_id => Err(crate::error::HubError::Forbidden(format!(
                "this API key is bound to {bound}, not {agent_id}"
            ))),
            _ => Ok(()),
        }
    }
}

/// Gates the key-management endpoints. Always requires the configured master key regardless
/// of `api_key_required`, since issuing/revoking keys is itself a sensitive action.
pub struct MasterKey;

#[rocket::async_trait]
impl<'r> FromRequest<'r> for MasterKey {
    type Error = ApiKeyError;

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let config = match req.guard::<&State<HubConfig>>().await {
            Outcome::Success(c) => c,
            _ => return Outcome::Error((Status::InternalServerError, ApiKeyError::Invalid)),
        };

        let Some(master) = &config.master_api_key else {
            return Outcome::Error((Status::Unauthorized, ApiKeyError::Missing));
        };
        match bearer_token(req) {
            Some(token) if &token == master => Outcome::Success(MasterKey),
            _ => Outcome::Error((Status::Unauthorized, ApiKeyError::Invalid)),
        }
    }
}

fn bearer_token(req: &Request<'_>) -> Option<String> {
    req.headers()
        .get_one("Authorization")
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}
