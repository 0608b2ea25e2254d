//! Inbox service (§4.4): the centerpiece. Envelope validation and signature verification,
//! idempotent send, lease-based pull with visibility timeout, ack/nack/reply, status lookup,
//! lease reclaim and TTL expiry sweeps.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::config::HubConfig;
use crate::crypto;
use crate::error::{HubError, HubResult};
use crate::models::{Envelope, MessageRecord, MessageStatus};
use crate::services::agent::AgentService;
use crate::storage::{MessageFilter, Storage};

pub struct InboxService {
    storage: Arc<dyn Storage>,
    agents: Arc<AgentService>,
    config: HubConfig,
}

#[derive(Debug, Clone, Serialize)]
pub struct PullOptions {
    pub visibility_timeout_sec: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InboxStats {
    pub queued: usize,
    pub leased: usize,
    pub acked: usize,
    pub nacked: usize,
    pub failed: usize,
    pub expired: usize,
}

impl InboxService {
    pub fn new(storage: Arc<dyn Storage>, agents: Arc<AgentService>, config: HubConfig) -> Self {
        Self {
            storage,
            agents,
            config,
        }
    }

    /// §4.4 send: validate shape, verify signature against the sender's acceptable keys
    /// (active + rotation overlap), check timestamp skew, confirm the recipient exists and
    /// isn't blocking the sender, idempotently insert keyed on envelope id, and hand off to
    /// the webhook dispatcher if the recipient has push configured.
    pub async fn send(&self, mut envelope: Envelope) -> HubResult<MessageRecord> {
        if envelope.id.trim().is_empty() {
            return Err(HubError::Validation("envelope id is required".into()));
        }
        if envelope.from.trim().is_empty() || envelope.to.trim().is_empty() {
            return Err(HubError::Validation("from/to are required".into()));
        }

        if let Ok(existing) = self.storage.get_message(&envelope.id).await {
            return Ok(existing);
        }

        crypto::validate_timestamp_skew(&envelope.timestamp, Utc::now())
            .map_err(HubError::InvalidTimestamp)?;

        let sender = self.agents.get(&envelope.from).await?;
        let recipient = self.agents.get(&envelope.to).await?;

        if recipient.blocked_agents.iter().any(|b| b == &envelope.from) {
            return Err(HubError::PolicyDenied(
                "recipient is not accepting messages from this sender".into(),
            ));
        }
        if !recipient.trusted_agents.is_empty()
            && !self.agents.is_trusted(&recipient.agent_id, &envelope.from).await?
        {
            return Err(HubError::PolicyDenied(
                "recipient only accepts messages from its trusted agents".into(),
            ));
        }

        let acceptable_keys = self.agents.acceptable_verification_keys(&envelope.from).await?;
        let verified = acceptable_keys
            .iter()
            .any(|key| crypto::verify_envelope_signature(&envelope, key).unwrap_or(false));
        if !verified {
            return Err(HubError::InvalidSignature(
                "envelope signature does not verify against any acceptable sender key".into(),
            ));
        }
        let _ = &sender;

        let ttl_sec = envelope
            .ttl_sec
            .filter(|t| *t > 0)
            .unwrap_or(self.config.message_ttl_sec);
        envelope.ttl_sec = Some(ttl_sec);

        let now = Utc::now().to_rfc3339();
        let record = MessageRecord {
            id: envelope.id.clone(),
            recipient: envelope.to.clone(),
            correlation_id: envelope.correlation_id.clone(),
            envelope,
            status: MessageStatus::Queued,
            attempts: 0,
            lease_until: None,
            created_at: now.clone(),
            updated_at: now,
            acked_at: None,
            group_message_id: None,
            result: None,
            ttl_sec,
        };

        let created = self
            .storage
            .create_message(record)
            .await
            .map_err(|e| HubError::Storage(e.to_string()))?;

        if let Some(webhook) = recipient.webhook.clone() {
            crate::services::webhook::dispatch(webhook, created.clone());
        }

        Ok(created)
    }

    /// §4.4 pull: atomically leases the oldest queued message for `recipient`.
    pub async fn pull(&self, recipient: &str, opts: PullOptions) -> HubResult<Option<MessageRecord>> {
        let visibility_timeout_sec = opts
            .visibility_timeout_sec
            .filter(|t| *t > 0)
            .unwrap_or(self.config.default_visibility_timeout_sec);

        match self
            .storage
            .lease_next(recipient, visibility_timeout_sec)
            .await
        {
            Ok(msg) => Ok(Some(msg)),
            Err(crate::storage::StorageError::NotFound) => Ok(None),
            Err(e) => Err(HubError::Storage(e.to_string())),
        }
    }

    /// §4.4 ack: terminal success. Rejects acks on messages not currently leased or not
    /// addressed to the calling agent.
    pub async fn ack(
        &self,
        agent_id: &str,
        message_id: &str,
        result: Option<serde_json::Value>,
    ) -> HubResult<MessageRecord> {
        let msg = self.get_status(message_id).await?;
        if msg.recipient != agent_id {
            return Err(HubError::Forbidden(format!(
                "message {message_id} is not addressed to {agent_id}"
            )));
        }
        if msg.status != MessageStatus::Leased {
            return Err(HubError::Conflict(format!(
                "message {message_id} is not currently leased"
            )));
        }
        let now = Utc::now().to_rfc3339();
        self.storage
            .update_message(
                message_id,
                Box::new(move |m| {
                    m.status = MessageStatus::Acked;
                    m.acked_at = Some(now);
                    m.lease_until = None;
                    m.result = result;
                }),
            )
            .await
            .map_err(|e| HubError::Storage(e.to_string()))
    }

    /// §4.4 nack / §9(a): when both `requeue` and `extend_sec` are given, `extend_sec` wins —
    /// the message stays leased with its visibility window pushed out rather than being
    /// returned to `queued` immediately, since an explicit extension is the more specific
    /// instruction of the two.
    pub async fn nack(
        &self,
        agent_id: &str,
        message_id: &str,
        requeue: bool,
        extend_sec: Option<i64>,
        reason: Option<String>,
    ) -> HubResult<MessageRecord> {
        let msg = self.get_status(message_id).await?;
        if msg.recipient != agent_id {
            return Err(HubError::Forbidden(format!(
                "message {message_id} is not addressed to {agent_id}"
            )));
        }
        if msg.status != MessageStatus::Leased {
            return Err(HubError::Conflict(format!(
                "message {message_id} is not currently leased"
            )));
        }

        if msg.attempts >= self.config.max_delivery_attempts {
            return self
                .storage
                .update_message(
                    message_id,
                    Box::new(|m| {
                        m.status = MessageStatus::Failed;
                        m.lease_until = None;
                    }),
                )
                .await
                .map_err(|e| HubError::Storage(e.to_string()));
        }

        let now = Utc::now();
        self.storage
            .update_message(
                message_id,
                Box::new(move |m| {
                    m.result = reason.map(|r| serde_json::json!({"nack_reason": r}));
                    if let Some(extend) = extend_sec.filter(|e| *e > 0) {
                        m.status = MessageStatus::Leased;
                        m.lease_until = Some((now + chrono::Duration::seconds(extend)).to_rfc3339());
                    } else if requeue {
                        m.status = MessageStatus::Queued;
                        m.lease_until = None;
                    } else {
                        m.status = MessageStatus::Nacked;
                        m.lease_until = None;
                    }
                }),
            )
            .await
            .map_err(|e| HubError::Storage(e.to_string()))
    }

    /// §4.4 reply: sends a new envelope back to the original sender, threading
    /// `correlation_id` to the source message's id when the caller didn't supply one.
    pub async fn reply(
        &self,
        agent_id: &str,
        source_message_id: &str,
        mut envelope: Envelope,
    ) -> HubResult<MessageRecord> {
        let source = self.get_status(source_message_id).await?;
        if source.recipient != agent_id {
            return Err(HubError::Forbidden(format!(
                "message {source_message_id} is not addressed to {agent_id}"
            )));
        }
        if envelope.correlation_id.is_none() {
            envelope.correlation_id = Some(source.envelope.id.clone());
        }
        if envelope.to.trim().is_empty() {
            envelope.to = source.envelope.from.clone();
        }
        self.send(envelope).await
    }

    pub async fn get_status(&self, message_id: &str) -> HubResult<MessageRecord> {
        self.storage
            .get_message(message_id)
            .await
            .map_err(|e| match e {
                crate::storage::StorageError::NotFound => HubError::not_found("message"),
                other => HubError::Storage(other.to_string()),
            })
    }

    pub async fn stats(&self, recipient: &str) -> HubResult<InboxStats> {
        let all = self
            .storage
            .list_messages(recipient, MessageFilter::default())
            .await
            .map_err(|e| HubError::Storage(e.to_string()))?;
        let mut stats = InboxStats {
            queued: 0,
            leased: 0,
            acked: 0,
            nacked: 0,
            failed: 0,
            expired: 0,
        };
        for m in all {
            match m.status {
                MessageStatus::Queued => stats.queued += 1,
                MessageStatus::Leased => stats.leased += 1,
                MessageStatus::Acked => stats.acked += 1,
                MessageStatus::Nacked => stats.nacked += 1,
                MessageStatus::Failed => stats.failed += 1,
                MessageStatus::Expired => stats.expired += 1,
            }
        }
        Ok(stats)
    }

    /// Background sweep (§4.4, §5): returns leased messages whose visibility window lapsed
    /// back to `queued`.
    pub async fn reclaim_expired_leases(&self) -> HubResult<usize> {
        let reclaimed = self
            .storage
            .reclaim_expired_leases()
            .await
            .map_err(|e| HubError::Storage(e.to_string()))?;
        Ok(reclaimed.len())
    }

    /// Background sweep (§4.4, §5): transitions `queued` messages past their TTL to
    /// `expired`.
    pub async fn expire_old_messages(&self) -> HubResult<usize> {
        let expired = self
            .storage
            .expire_old_messages()
            .await
            .map_err(|e| HubError::Storage(e.to_string()))?;
        Ok(expired.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::agent::{AgentService, RegisterInput, RegisterRequest};
    use crate::storage::memory::MemoryStorage;
    use base64::engine::general_purpose::STANDARD as B64;
    use base64::Engine;
    use ed25519_dalek::SigningKey;

    async fn setup() -> (Arc<dyn Storage>, Arc<AgentService>, InboxService, SigningKey, String, String) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let agents = Arc::new(AgentService::new(storage.clone(), HubConfig::default()));
        let inbox = InboxService::new(storage.clone(), agents.clone(), HubConfig::default());

        let key = crypto::generate_keypair();
        let priv_b64 = B64.encode(key.to_bytes());
        let _ = priv_b64;

        let sender = agents
            .register(RegisterRequest {
                agent_id: Some("agent://sender".into()),
                agent_type: "worker".into(),
                metadata: serde_json::json!({}),
                webhook_url: None,
                webhook_secret: None,
                mode: RegisterInput::Import {
                    public_key_b64: B64.encode(key.verifying_key().to_bytes()),
                },
            })
            .await
            .unwrap();

        agents
            .register(RegisterRequest {
                agent_id: Some("agent://recipient".into()),
                agent_type: "worker".into(),
                metadata: serde_json::json!({}),
                webhook_url: None,
                webhook_secret: None,
                mode: RegisterInput::Legacy,
            })
            .await
            .unwrap();

        (
            storage,
            agents,
            inbox,
            key,
            sender.agent.agent_id.clone(),
            "agent://recipient".to_string(),
        )
    }

    fn signed_envelope(key: &SigningKey, from: &str, to: &str, id: &str) -> Envelope {
        let body = serde_json::json!({"hello": "world"});
        let ts = Utc::now().to_rfc3339();
        let sig = crypto::sign_envelope(key, &ts, &body, from, to, None).unwrap();
        Envelope {
            version: "1.0".into(),
            id: id.into(),
            kind: "task".into(),
            from: from.into(),
            to: to.into(),
            subject: "test".into(),
            body,
            timestamp: ts,
            correlation_id: None,
            reply_to: None,
            ttl_sec: None,
            signature: Some(crate::models::EnvelopeSignature {
                alg: "ed25519".into(),
                kid: "v1".into(),
                sig,
            }),
        }
    }

    #[tokio::test]
    async fn send_is_idempotent_on_envelope_id() {
        let (_storage, _agents, inbox, key, from, to) = setup().await;
        let env = signed_envelope(&key, &from, &to, "msg-1");
        let first = inbox.send(env.clone()).await.unwrap();
        let second = inbox.send(env).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn send_rejects_bad_signature() {
        let (_storage, _agents, inbox, key, from, to) = setup().await;
        let mut env = signed_envelope(&key, &from, &to, "msg-2");
        env.body = serde_json::json!({"tampered": true});
        let err = inbox.send(env).await.unwrap_err();
        assert!(matches!(err, HubError::InvalidSignature(_)));
    }

    #[tokio::test]
    async fn pull_is_mutually_exclusive() {
        let (_storage, _agents, inbox, key, from, to) = setup().await;
        let env = signed_envelope(&key, &from, &to, "msg-3");
        inbox.send(env).await.unwrap();

        let leased = inbox
            .pull(&to, PullOptions { visibility_timeout_sec: Some(60) })
            .await
            .unwrap()
            .expect("message available");
        assert_eq!(leased.status, MessageStatus::Leased);

        let none = inbox
            .pull(&to, PullOptions { visibility_timeout_sec: None })
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_to_queued() {
        let (storage, _agents, inbox, key, from, to) = setup().await;
        let env = signed_envelope(&key, &from, &to, "msg-5");
        inbox.send(env).await.unwrap();
        storage.lease_next(&to, -1).await.unwrap();

        let reclaimed = inbox.reclaim_expired_leases().await.unwrap();
        assert_eq!(reclaimed, 1);
        let msg = inbox.get_status("msg-5").await.unwrap();
        assert_eq!(msg.status, MessageStatus::Queued);
    }

    #[tokio::test]
    async fn nack_extend_wins_over_requeue() {
        let (_storage, _agents, inbox, key, from, to) = setup().await;
        let env = signed_envelope(&key, &from, &to, "msg-4");
        inbox.send(env).await.unwrap();
        let leased = inbox
            .pull(&to, PullOptions { visibility_timeout_sec: Some(60) })
            .await
            .unwrap()
            .unwrap();

        let nacked = inbox
            .nack(&to, &leased.id, true, Some(30), Some("retry later".into()))
            .await
            .unwrap();
        assert_eq!(nacked.status, MessageStatus::Leased);
        assert!(nacked.lease_until.is_some());
    }
}
