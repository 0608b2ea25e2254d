//! Group service (§4.5): group lifecycle, membership and roles, join/leave, and post-message
//! fanout into individual inbox sends plus a deduplicated group history.

use std::sync::Arc;

use chrono::Utc;

use crate::crypto;
use crate::error::{HubError, HubResult};
use crate::models::{
    Envelope, Group, GroupAccess, GroupAccessType, GroupHistoryEntry, GroupMember, GroupRole,
    GroupSettings, MessageRecord,
};
use crate::services::inbox::InboxService;
use crate::storage::Storage;

pub struct GroupService {
    storage: Arc<dyn Storage>,
    pub(crate) inbox: Arc<InboxService>,
}

pub struct CreateGroupRequest {
    pub id: Option<String>,
    pub name: String,
    pub creator: String,
    pub access: GroupAccessType,
    pub join_key: Option<String>,
    pub max_members: usize,
    pub message_ttl_sec: i64,
    pub history_retention_sec: Option<i64>,
}

pub struct PostMessageRequest {
    pub sender: String,
    pub subject: String,
    pub body: serde_json::Value,
    pub correlation_id: Option<String>,
}

impl GroupService {
    pub fn new(storage: Arc<dyn Storage>, inbox: Arc<InboxService>) -> Self {
        Self { storage, inbox }
    }

    pub async fn create(&self, req: CreateGroupRequest) -> HubResult<Group> {
        let id = req.id.unwrap_or_else(|| format!("group://{}", uuid::Uuid::new_v4()));
        let now = Utc::now().to_rfc3339();

        let join_key_hash = req.join_key.as_deref().map(crypto::sha256_hex);
        if req.access == GroupAccessType::KeyProtected && join_key_hash.is_none() {
            return Err(HubError::Validation(
                "key_protected groups require a join_key".into(),
            ));
        }

        let group = Group {
            id: id.clone(),
            name: req.name,
            creator: req.creator.clone(),
            access: GroupAccess {
                kind: req.access,
                join_key_hash,
            },
            settings: GroupSettings {
                max_members: req.max_members,
                message_ttl_sec: req.message_ttl_sec,
                history_retention_sec: req.history_retention_sec,
            },
            members: vec![GroupMember {
                agent_id: req.creator,
                role: GroupRole::Owner,
                joined_at: now.clone(),
            }],
            created_at: now,
            deleted: false,
        };

        self.storage
            .create_group(group)
            .await
            .map_err(|e| match e {
                crate::storage::StorageError::Conflict(_) => HubError::Conflict("group_exists".into()),
                other => HubError::Storage(other.to_string()),
            })
    }

    pub async fn get(&self, group_id: &str) -> HubResult<Group> {
        self.storage.get_group(group_id).await.map_err(not_found)
    }

    pub async fn list(&self) -> HubResult<Vec<Group>> {
        self.storage
            .list_groups()
            .await
            .map_err(|e| HubError::Storage(e.to_string()))
    }

    pub async fn delete(&self, group_id: &str, requester: &str) -> HubResult<()> {
        let group = self.get(group_id).await?;
        self.require_role(&group, requester, GroupRole::Owner)?;
        self.storage.delete_group(group_id).await.map_err(not_found)
    }

    /// §4.5 join: open groups admit anyone, invite-only groups require a prior invite (an
    /// owner/admin adding the member directly via `add_member`), key-protected groups require
    /// the caller to present the plaintext join key.
    pub async fn join(&self, group_id: &str, agent_id: &str, join_key: Option<&str>) -> HubResult<Group> {
        let group = self.get(group_id).await?;
        if group.is_member(agent_id) {
            return Ok(group);
        }
        if group.members.len() >= group.settings.max_members {
            return Err(HubError::PolicyDenied("group is at capacity".into()));
        }
        match group.access.kind {
            GroupAccessType::Open => {}
            GroupAccessType::InviteOnly => {
                return Err(HubError::Forbidden(
                    "this group requires an invite from an owner or admin".into(),
                ));
            }
            GroupAccessType::KeyProtected => {
                let expected = group.access.join_key_hash.as_deref().unwrap_or("");
                let supplied = join_key.map(crypto::sha256_hex).unwrap_or_default();
                if supplied != expected {
                    return Err(HubError::Forbidden("invalid join key".into()));
                }
            }
        }

        let agent_id = agent_id.to_string();
        self.storage
            .update_group(
                group_id,
                Box::new(move |g| {
                    g.members.push(GroupMember {
                        agent_id,
                        role: GroupRole::Member,
                        joined_at: Utc::now().to_rfc3339(),
                    })
                }),
            )
            .await
            .map_err(not_found)
    }

    /// An owner or admin adds a member directly, which is how invite-only groups admit people.
    pub async fn add_member(&self, group_id: &str, requester: &str, agent_id: &str) -> HubResult<Group> {
        let group = self.get(group_id).await?;
        self.require_role(&group, requester, GroupRole::Admin)?;
        if group.is_member(agent_id) {
            return Ok(group);
        }
        if group.members.len() >= group.settings.max_members {
            return Err(HubError::PolicyDenied("group is at capacity".into()));
        }
        let agent_id = agent_id.to_string();
        self.storage
            .update_group(
                group_id,
                Box::new(move |g| {
                    g.members.push(GroupMember {
                        agent_id,
                        role: GroupRole::Member,
                        joined_at: Utc::now().to_rfc3339(),
                    })
                }),
            )
            .await
            .map_err(not_found)
    }

    /// §4.5 leave: an owner may not leave while other members remain — ownership must be
    /// transferred first, otherwise the group is orphaned.
    pub async fn leave(&self, group_id: &str, agent_id: &str) -> HubResult<()> {
        let group = self.get(group_id).await?;
        let Some(member) = group.member(agent_id) else {
            return Err(HubError::not_found("membership"));
        };
        if member.role == GroupRole::Owner && group.members.len() > 1 {
            return Err(HubError::PolicyDenied(
                "transfer ownership before leaving a group with other members".into(),
            ));
        }
        let agent_id = agent_id.to_string();
        self.storage
            .update_group(
                group_id,
                Box::new(move |g| g.members.retain(|m| m.agent_id != agent_id)),
            )
            .await
            .map_err(not_found)?;
        Ok(())
    }

    pub async fn transfer_ownership(&self, group_id: &str, requester: &str, new_owner: &str) -> HubResult<Group> {
        let group = self.get(group_id).await?;
        self.require_role(&group, requester, GroupRole::Owner)?;
        if !group.is_member(new_owner) {
            return Err(HubError::Validation(
                "new owner must already be a group member".into(),
            ));
        }
        let requester = requester.to_string();
        let new_owner = new_owner.to_string();
        self.storage
            .update_group(
                group_id,
                Box::new(move |g| {
                    for m in g.members.iter_mut() {
                        if m.agent_id == requester {
                            m.role = GroupRole::Admin;
                        } else if m.agent_id == new_owner {
                            m.role = GroupRole::Owner;
                        }
                    }
                }),
            )
            .await
            .map_err(not_found)
    }

    /// §4.5 post: loads membership once, stamps a stable `group_message_id`, fans out a
    /// distinct envelope per recipient (excluding the sender), and appends one deduplicated
    /// history entry. Per-recipient delivery failures are logged, not fatal to the post —
    /// group-message signatures are not individually verified since the fanout envelopes are
    /// synthesized by the hub itself, not re-signed by the original sender.
    pub async fn post_message(&self, group_id: &str, req: PostMessageRequest) -> HubResult<GroupHistoryEntry> {
        let group = self.get(group_id).await?;
        if !group.is_member(&req.sender) {
            return Err(HubError::Forbidden("sender is not a member of this group".into()));
        }

        let group_message_id = format!("gmsg://{}", uuid::Uuid::new_v4());
        let now = Utc::now().to_rfc3339();

        let entry = GroupHistoryEntry {
            group_id: group_id.to_string(),
            group_message_id: group_message_id.clone(),
            sender: req.sender.clone(),
            subject: req.subject.clone(),
            body: req.body.clone(),
            timestamp: now.clone(),
            correlation_id: req.correlation_id.clone(),
        };
        let inserted = self
            .storage
            .append_group_history(entry.clone())
            .await
            .map_err(|e| HubError::Storage(e.to_string()))?;
        if !inserted {
            return Ok(entry);
        }

        for member in &group.members {
            if member.agent_id == req.sender {
                continue;
            }
            let envelope = Envelope {
                version: "1.0".into(),
                id: format!("{group_message_id}:{}", member.agent_id),
                kind: "group_message".into(),
                from: req.sender.clone(),
                to: member.agent_id.clone(),
                subject: req.subject.clone(),
                body: req.body.clone(),
                timestamp: now.clone(),
                correlation_id: req.correlation_id.clone(),
                reply_to: None,
                ttl_sec: Some(group.settings.message_ttl_sec),
                signature: None,
            };
            if let Err(e) = self.deliver_unsigned(envelope).await {
                eprintln!(
                    "group fanout to {} for group message {group_message_id} failed: {e}",
                    member.agent_id
                );
            }
        }

        Ok(entry)
    }

    /// Group fanout bypasses §4.4's signature check: the hub itself is the immediate sender
    /// of record for these synthesized per-recipient envelopes, so it inserts them straight
    /// into the recipient's inbox rather than round-tripping through `InboxService::send`.
    /// Also used by the round-table service for `work_order`/`notification` envelopes, which
    /// are synthesized the same way and carry signature verification disabled per §4.6.
    pub(crate) async fn deliver_unsigned(&self, envelope: Envelope) -> HubResult<MessageRecord> {
        let now = Utc::now().to_rfc3339();
        let ttl_sec = envelope.ttl_sec.unwrap_or(86_400);
        let record = MessageRecord {
            id: envelope.id.clone(),
            recipient: envelope.to.clone(),
            correlation_id: envelope.correlation_id.clone(),
            envelope,
            status: crate::models::MessageStatus::Queued,
            attempts: 0,
            lease_until: None,
            created_at: now.clone(),
            updated_at: now,
            acked_at: None,
            group_message_id: None,
            result: None,
            ttl_sec,
        };
        self.storage
            .create_message(record)
            .await
            .map_err(|e| HubError::Storage(e.to_string()))
    }

    pub async fn history(&self, group_id: &str, limit: usize, since: Option<&str>) -> HubResult<Vec<GroupHistoryEntry>> {
        self.storage
            .list_group_history(group_id, limit, since)
            .await
            .map_err(|e| HubError::Storage(e.to_string()))
    }

    pub async fn purge_history_before(&self, cutoff: &str) -> HubResult<usize> {
        self.storage
            .purge_group_history_before(cutoff)
            .await
            .map_err(|e| HubError::Storage(e.to_string()))
    }

    fn require_role(&self, group: &Group, agent_id: &str, min: GroupRole) -> HubResult<()> {
        let member = group
            .member(agent_id)
            .ok_or_else(|| HubError::Forbidden("not a member of this group".into()))?;
        let rank = |r: GroupRole| match r {
            GroupRole::Owner => 2,
            GroupRole::Admin => 1,
            GroupRole::Member => 0,
        };
        if rank(member.role) < rank(min) {
            return Err(HubError::Forbidden("insufficient group role".into()));
        }
        Ok(())
    }
}

fn not_found(e: crate::storage::StorageError) -> HubError {
    match e {
        crate::storage::StorageError::NotFound => HubError::not_found("group"),
        other => HubError::Storage(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::services::agent::AgentService;
    use crate::storage::memory::MemoryStorage;

    async fn setup() -> GroupService {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let agents = Arc::new(AgentService::new(storage.clone(), HubConfig::default()));
        let inbox = Arc::new(InboxService::new(storage.clone(), agents, HubConfig::default()));
        GroupService::new(storage, inbox)
    }

    #[tokio::test]
    async fn post_message_dedupes_history_and_fans_out() {
        let svc = setup().await;
        let group = svc
            .create(CreateGroupRequest {
                id: Some("group://team".into()),
                name: "team".into(),
                creator: "agent://owner".into(),
                access: GroupAccessType::Open,
                join_key: None,
                max_members: 10,
                message_ttl_sec: 3600,
                history_retention_sec: None,
            })
            .await
            .unwrap();
        svc.join(&group.id, "agent://bob", None).await.unwrap();

        let entry = svc
            .post_message(
                &group.id,
                PostMessageRequest {
                    sender: "agent://owner".into(),
                    subject: "hi".into(),
                    body: serde_json::json!({"text": "hello"}),
                    correlation_id: None,
                },
            )
            .await
            .unwrap();

        let history = svc.history(&group.id, 10, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].group_message_id, entry.group_message_id);

        let delivered = svc
            .storage
            .get_message(&format!("{}:agent://bob", entry.group_message_id))
            .await
            .unwrap();
        assert_eq!(delivered.recipient, "agent://bob");
    }

    #[tokio::test]
    async fn owner_cannot_leave_with_other_members_present() {
        let svc = setup().await;
        let group = svc
            .create(CreateGroupRequest {
                id: Some("group://team2".into()),
                name: "team2".into(),
                creator: "agent://owner".into(),
                access: GroupAccessType::Open,
                join_key: None,
                max_members: 10,
                message_ttl_sec: 3600,
                history_retention_sec: None,
            })
            .await
            .unwrap();
        svc.join(&group.id, "agent://bob", None).await.unwrap();

        let err = svc.leave(&group.id, "agent://owner").await.unwrap_err();
        assert!(matches!(err, HubError::PolicyDenied(_)));
    }
}
