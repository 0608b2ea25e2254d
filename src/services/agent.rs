//! Agent service (§4.3): registration (legacy/seed/import), heartbeat, trust lists, webhook
//! configuration, key rotation with overlap window, approval workflow.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use chrono::{Duration, Utc};
use ed25519_dalek::SigningKey;
use rand::RngCore;

use crate::config::{HubConfig, RegistrationPolicy};
use crate::crypto;
use crate::error::{HubError, HubResult};
use crate::models::{
    Agent, Heartbeat, HeartbeatStatus, KeyRecord, RegistrationMode, RegistrationStatus,
    WebhookConfig,
};
use crate::storage::{AgentFilter, Storage};

/// Key rotation overlap window: a prior key remains acceptable for verification for this
/// long after a new one becomes active (§3, §4.3, §9).
pub const KEY_ROTATION_OVERLAP: Duration = Duration::hours(24);

pub enum RegisterInput {
    Legacy,
    Seed { seed: Vec<u8>, tenant_id: String },
    Import { public_key_b64: String },
}

pub struct RegisterRequest {
    pub agent_id: Option<String>,
    pub agent_type: String,
    pub metadata: serde_json::Value,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub mode: RegisterInput,
}

/// Returned once on registration; the private key (when one was generated) is never
/// persisted or retrievable again.
pub struct RegisterOutcome {
    pub agent: Agent,
    pub private_key_b64: Option<String>,
    pub webhook_secret: Option<String>,
}

pub struct AgentService {
    storage: Arc<dyn Storage>,
    config: HubConfig,
}

impl AgentService {
    pub fn new(storage: Arc<dyn Storage>, config: HubConfig) -> Self {
        Self { storage, config }
    }

    pub async fn register(&self, req: RegisterRequest) -> HubResult<RegisterOutcome> {
        let agent_id = req
            .agent_id
            .unwrap_or_else(|| format!("agent://{}", uuid::Uuid::new_v4()));

        if self.storage.get_agent(&agent_id).await.is_ok() {
            return Err(HubError::Conflict("agent_exists".into()));
        }

        let (signing_key, registration_mode, derivation_context, private_key_b64) = match &req.mode
        {
            RegisterInput::Legacy => {
                let key = crypto::generate_keypair();
                let priv_b64 = B64.encode(key.to_bytes());
                (Some(key), RegistrationMode::Legacy, None, Some(priv_b64))
            }
            RegisterInput::Seed { seed, tenant_id } => {
                if tenant_id.trim().is_empty() {
                    return Err(HubError::Validation("missing_tenant".into()));
                }
                let ctx = crypto::seed_derivation_context(tenant_id, &agent_id, 1);
                let key = crypto::derive_seed_key(seed, &ctx)
                    .map_err(HubError::Validation)?;
                let priv_b64 = B64.encode(key.to_bytes());
                (
                    Some(key),
                    RegistrationMode::Seed,
                    Some(ctx),
                    Some(priv_b64),
                )
            }
            RegisterInput::Import { public_key_b64 } => {
                B64.decode(public_key_b64)
                    .map_err(|e| HubError::Validation(format!("invalid public key: {e}")))?;
                (None, RegistrationMode::Import, None, None)
            }
        };

        let (public_key_b64, did) = match &signing_key {
            Some(key) => {
                let vk = key.verifying_key();
                (B64.encode(vk.to_bytes()), Some(crypto::did_from_public_key(&vk)))
            }
            None => (
                req_public_key(&req.mode).expect("import mode carries a public key"),
                None,
            ),
        };

        let tenant_id = match &req.mode {
            RegisterInput::Seed { tenant_id, .. } => Some(tenant_id.clone()),
            _ => None,
        };

        let registration_status = self.initial_status(tenant_id.as_deref()).await;

        let now = Utc::now().to_rfc3339();
        let webhook_secret = req.webhook_url.as_ref().map(|_| {
            req.webhook_secret.clone().unwrap_or_else(generate_secret)
        });

        let agent = Agent {
            agent_id: agent_id.clone(),
            agent_type: req.agent_type,
            public_key: public_key_b64.clone(),
            did,
            tenant_id,
            registration_mode,
            key_version: 1,
            keys: vec![KeyRecord {
                version: 1,
                public_key: public_key_b64,
                active: true,
                created_at: now.clone(),
                deactivate_at: None,
            }],
            created_at: now.clone(),
            active: true,
            deactivate_at: None,
            verification_tier: "standard".to_string(),
            derivation_context,
            metadata: req.metadata,
            webhook: req.webhook_url.map(|url| WebhookConfig {
                url,
                secret: webhook_secret.clone().unwrap(),
            }),
            heartbeat: Heartbeat {
                last_heartbeat: now,
                status: HeartbeatStatus::Offline,
                interval_ms: self.config.heartbeat_interval_ms,
                timeout_ms: self.config.heartbeat_timeout_ms,
            },
            trusted_agents: Vec::new(),
            blocked_agents: Vec::new(),
            registration_status,
        };

        let created = self
            .storage
            .create_agent(agent)
            .await
            .map_err(|e| match e {
                crate::storage::StorageError::Conflict(_) => {
                    HubError::Conflict("agent_exists".into())
                }
                other => HubError::Storage(other.to_string()),
            })?;

        Ok(RegisterOutcome {
            agent: created,
            private_key_b64,
            webhook_secret,
        })
    }

    async fn initial_status(&self, tenant_id: Option<&str>) -> RegistrationStatus {
        let policy = match tenant_id {
            Some(id) => match self.storage.get_tenant(id).await {
                Ok(tenant) => match tenant.registration_policy {
                    crate::models::TenantRegistrationPolicy::Open => RegistrationPolicy::Open,
                    crate::models::TenantRegistrationPolicy::ApprovalRequired => {
                        RegistrationPolicy::ApprovalRequired
                    }
                },
                Err(_) => self.config.registration_policy.clone(),
            },
            None => self.config.registration_policy.clone(),
        };
        match policy {
            RegistrationPolicy::Open => RegistrationStatus::Approved,
            RegistrationPolicy::ApprovalRequired => RegistrationStatus::Pending,
        }
    }

    pub async fn approve(&self, agent_id: &str) -> HubResult<Agent> {
        self.storage
            .update_agent(
                agent_id,
                Box::new(|a| a.registration_status = RegistrationStatus::Approved),
            )
            .await
            .map_err(not_found)
    }

    pub async fn reject(&self, agent_id: &str, _reason: &str) -> HubResult<Agent> {
        self.storage
            .update_agent(
                agent_id,
                Box::new(|a| a.registration_status = RegistrationStatus::Rejected),
            )
            .await
            .map_err(not_found)
    }

    pub async fn heartbeat(
        &self,
        agent_id: &str,
        metadata: Option<serde_json::Value>,
    ) -> HubResult<Agent> {
        let now = Utc::now().to_rfc3339();
        self.storage
            .update_agent(
                agent_id,
                Box::new(move |a| {
                    a.heartbeat.last_heartbeat = now;
                    a.heartbeat.status = HeartbeatStatus::Online;
                    if let Some(meta) = metadata
                        && let (Some(existing), Some(incoming)) =
                            (a.metadata.as_object_mut(), meta.as_object())
                    {
                        for (k, v) in incoming {
                            existing.insert(k.clone(), v.clone());
                        }
                    }
                }),
            )
            .await
            .map_err(not_found)
    }

    /// Scans online agents; any whose last heartbeat is stale beyond `timeout_ms` is marked
    /// offline. Returns the count transitioned.
    pub async fn mark_offline_agents(&self) -> HubResult<usize> {
        let agents = self
            .storage
            .list_agents(AgentFilter::default())
            .await
            .map_err(|e| HubError::Storage(e.to_string()))?;
        let now = Utc::now();
        let mut count = 0;
        for agent in agents {
            if agent.heartbeat.status != HeartbeatStatus::Online {
                continue;
            }
            let Ok(last) = chrono::DateTime::parse_from_rfc3339(&agent.heartbeat.last_heartbeat)
            else {
                continue;
            };
            let elapsed = now - last.with_timezone(&Utc);
            if elapsed > Duration::milliseconds(agent.heartbeat.timeout_ms as i64) {
                let _ = self
                    .storage
                    .update_agent(
                        &agent.agent_id,
                        Box::new(|a| a.heartbeat.status = HeartbeatStatus::Offline),
                    )
                    .await;
                count += 1;
            }
        }
        Ok(count)
    }

    pub async fn add_trusted_agent(&self, agent_id: &str, trusted: &str) -> HubResult<Agent> {
        let trusted = trusted.to_string();
        self.storage
            .update_agent(
                agent_id,
                Box::new(move |a| {
                    if !a.trusted_agents.contains(&trusted) {
                        a.trusted_agents.push(trusted);
                    }
                }),
            )
            .await
            .map_err(not_found)
    }

    pub async fn remove_trusted_agent(&self, agent_id: &str, trusted: &str) -> HubResult<Agent> {
        let trusted = trusted.to_string();
        self.storage
            .update_agent(
                agent_id,
                Box::new(move |a| a.trusted_agents.retain(|t| t != &trusted)),
            )
            .await
            .map_err(not_found)
    }

    pub async fn is_trusted(&self, agent_id: &str, other: &str) -> HubResult<bool> {
        let agent = self.get(agent_id).await?;
        Ok(agent.trusted_agents.iter().any(|t| t == other))
    }

    pub async fn configure_webhook(
        &self,
        agent_id: &str,
        url: String,
        secret: Option<String>,
    ) -> HubResult<String> {
        let secret = secret.unwrap_or_else(generate_secret);
        let secret_for_storage = secret.clone();
        self.storage
            .update_agent(
                agent_id,
                Box::new(move |a| {
                    a.webhook = Some(WebhookConfig {
                        url,
                        secret: secret_for_storage,
                    })
                }),
            )
            .await
            .map_err(not_found)?;
        Ok(secret)
    }

    pub async fn remove_webhook(&self, agent_id: &str) -> HubResult<()> {
        self.storage
            .update_agent(agent_id, Box::new(|a| a.webhook = None))
            .await
            .map_err(not_found)?;
        Ok(())
    }

    pub async fn get_webhook_config(&self, agent_id: &str) -> HubResult<Option<WebhookConfig>> {
        let agent = self.get(agent_id).await?;
        Ok(agent.webhook)
    }

    /// Seed-mode only: increments `key_version`, derives the new keypair, marks prior keys
    /// inactive with a 24h deactivation deadline so verification still accepts them during
    /// the overlap window (§4.3, §9).
    pub async fn rotate_key(
        &self,
        agent_id: &str,
        seed: &[u8],
        tenant_id: &str,
    ) -> HubResult<(Agent, String)> {
        let agent = self.get(agent_id).await?;
        if agent.registration_mode != RegistrationMode::Seed {
            return Err(HubError::Validation(
                "key rotation is only supported for seed-mode agents".into(),
            ));
        }
        let new_version = agent.key_version + 1;
        let ctx = crypto::seed_derivation_context(tenant_id, agent_id, new_version);
        let new_key = crypto::derive_seed_key(seed, &ctx).map_err(HubError::Validation)?;
        let vk = new_key.verifying_key();
        let public_key_b64 = B64.encode(vk.to_bytes());
        let private_key_b64 = B64.encode(new_key.to_bytes());

        let now = Utc::now();
        let deactivate_at = (now + KEY_ROTATION_OVERLAP).to_rfc3339();
        let now_str = now.to_rfc3339();
        let new_key_record = KeyRecord {
            version: new_version,
            public_key: public_key_b64.clone(),
            active: true,
            created_at: now_str,
            deactivate_at: None,
        };

        let updated = self
            .storage
            .update_agent(
                agent_id,
                Box::new(move |a| {
                    for key in a.keys.iter_mut() {
                        if key.active {
                            key.active = false;
                            key.deactivate_at = Some(deactivate_at.clone());
                        }
                    }
                    a.keys.push(new_key_record);
                    a.key_version = new_version;
                    a.public_key = public_key_b64;
                }),
            )
            .await
            .map_err(not_found)?;

        Ok((updated, private_key_b64))
    }

    pub async fn get(&self, agent_id: &str) -> HubResult<Agent> {
        self.storage.get_agent(agent_id).await.map_err(not_found)
    }

    pub async fn delete(&self, agent_id: &str) -> HubResult<()> {
        self.storage.delete_agent(agent_id).await.map_err(not_found)
    }

    /// Returns every public key currently acceptable for signature verification: the active
    /// key, plus any key still inside its overlap window (§4.3 "accept either the old or new
    /// key").
    pub async fn acceptable_verification_keys(&self, agent_id: &str) -> HubResult<Vec<String>> {
        let agent = self.get(agent_id).await?;
        let now = Utc::now();
        let keys = agent
            .keys
            .into_iter()
            .filter(|k| {
                if k.active {
                    return true;
                }
                match &k.deactivate_at {
                    Some(deadline) => chrono::DateTime::parse_from_rfc3339(deadline)
                        .map(|d| d.with_timezone(&Utc) > now)
                        .unwrap_or(false),
                    None => false,
                }
            })
            .map(|k| k.public_key)
            .collect();
        Ok(keys)
    }
}

fn not_found(e: crate::storage::StorageError) -> HubError {
    match e {
        crate::storage::StorageError::NotFound => HubError::not_found("agent"),
        other => HubError::Storage(other.to_string()),
    }
}

fn req_public_key(mode: &RegisterInput) -> Option<String> {
    match mode {
        RegisterInput::Import { public_key_b64 } => Some(public_key_b64.clone()),
        _ => None,
    }
}

fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn service() -> AgentService {
        AgentService::new(Arc::new(MemoryStorage::new()), HubConfig::default())
    }

    #[tokio::test]
    async fn registration_is_idempotent_on_agent_id() {
        let svc = service();
        let req = RegisterRequest {
            agent_id: Some("agent://alice".into()),
            agent_type: "worker".into(),
            metadata: serde_json::json!({}),
            webhook_url: None,
            webhook_secret: None,
            mode: RegisterInput::Legacy,
        };
        svc.register(req).await.unwrap();
        let req2 = RegisterRequest {
            agent_id: Some("agent://alice".into()),
            agent_type: "worker".into(),
            metadata: serde_json::json!({}),
            webhook_url: None,
            webhook_secret: None,
            mode: RegisterInput::Legacy,
        };
        let err = svc.register(req2).await.unwrap_err();
        assert!(matches!(err, HubError::Conflict(_)));
    }

    #[tokio::test]
    async fn seed_mode_registration_is_deterministic() {
        let svc = service();
        let seed = vec![9u8; 32];
        let req = RegisterRequest {
            agent_id: Some("agent://bob".into()),
            agent_type: "worker".into(),
            metadata: serde_json::json!({}),
            webhook_url: None,
            webhook_secret: None,
            mode: RegisterInput::Seed {
                seed: seed.clone(),
                tenant_id: "tenant-a".into(),
            },
        };
        let outcome = svc.register(req).await.unwrap();

        let svc2 = service();
        let req2 = RegisterRequest {
            agent_id: Some("agent://bob".into()),
            agent_type: "worker".into(),
            metadata: serde_json::json!({}),
            webhook_url: None,
            webhook_secret: None,
            mode: RegisterInput::Seed {
                seed,
                tenant_id: "tenant-a".into(),
            },
        };
        let outcome2 = svc2.register(req2).await.unwrap();

        assert_eq!(outcome.agent.public_key, outcome2.agent.public_key);
    }

    #[tokio::test]
    async fn key_rotation_keeps_old_key_valid_during_overlap() {
        let svc = service();
        let seed = vec![3u8; 32];
        let req = RegisterRequest {
            agent_id: Some("agent://carol".into()),
            agent_type: "worker".into(),
            metadata: serde_json::json!({}),
            webhook_url: None,
            webhook_secret: None,
            mode: RegisterInput::Seed {
                seed: seed.clone(),
                tenant_id: "tenant-a".into(),
            },
        };
        let outcome = svc.register(req).await.unwrap();
        let old_key = outcome.agent.public_key.clone();

        svc.rotate_key("agent://carol", &seed, "tenant-a").await.unwrap();
        let acceptable = svc
            .acceptable_verification_keys("agent://carol")
            .await
            .unwrap();
        assert!(acceptable.contains(&old_key));
        assert_eq!(acceptable.len(), 2);
    }
}
