//! Round-table service (§4.6): facilitated multi-agent deliberations backed by an
//! invite-only group. Enrollment is atomic against the backing group to avoid split-brain
//! between the round table's participant list and the group's membership list.

use std::sync::Arc;

use chrono::Utc;

use crate::config::HubConfig;
use crate::error::{HubError, HubResult};
use crate::models::{Envelope, RoundTable, RoundTableStatus, ThreadEntry};
use crate::services::group::{CreateGroupRequest, GroupService};
use crate::storage::{RoundTableFilter, Storage};

const MAX_MESSAGE_LEN: usize = 10_000;
const MAX_THREAD_LEN: usize = 200;

pub struct RoundTableService {
    storage: Arc<dyn Storage>,
    groups: Arc<GroupService>,
    config: HubConfig,
}

pub struct CreateRoundTableRequest {
    pub topic: String,
    pub goal: String,
    pub facilitator: String,
    pub invitees: Vec<String>,
    pub timeout_minutes: Option<i64>,
}

impl RoundTableService {
    pub fn new(storage: Arc<dyn Storage>, groups: Arc<GroupService>, config: HubConfig) -> Self {
        Self {
            storage,
            groups,
            config,
        }
    }

    /// §4.6 create: stands up an invite-only backing group with the facilitator as owner,
    /// then attempts to enroll each invitee. §9(c)/split-brain: the round table's
    /// `participants` list is derived from the group's *actual* post-enrollment membership,
    /// never from the requested invitee list — an invitee whose enrollment failed (already a
    /// member of a conflicting group, storage hiccup) is simply absent from both, so the two
    /// records can never disagree about who is actually seated at the table.
    pub async fn create(&self, req: CreateRoundTableRequest) -> HubResult<RoundTable> {
        let id = format!("roundtable://{}", uuid::Uuid::new_v4());
        let backing_group_id = format!("group://{id}");

        let group = self
            .groups
            .create(CreateGroupRequest {
                id: Some(backing_group_id.clone()),
                name: format!("round-table: {}", req.topic),
                creator: req.facilitator.clone(),
                access: crate::models::GroupAccessType::InviteOnly,
                join_key: None,
                max_members: req.invitees.len() + 1,
                message_ttl_sec: 3600,
                history_retention_sec: None,
            })
            .await?;

        for invitee in &req.invitees {
            if invitee == &req.facilitator {
                continue;
            }
            if let Err(e) = self
                .groups
                .add_member(&group.id, &req.facilitator, invitee)
                .await
            {
                eprintln!("round table {id} failed to enroll {invitee}: {e}");
            }
        }

        let enrolled = self.groups.get(&group.id).await?;
        let participants: Vec<String> = enrolled
            .members
            .iter()
            .map(|m| m.agent_id.clone())
            .filter(|a| a != &req.facilitator)
            .collect();

        let now = Utc::now();
        let timeout_minutes = req
            .timeout_minutes
            .unwrap_or(self.config.round_table_default_timeout_minutes);
        let expires_at = now + chrono::Duration::minutes(timeout_minutes);

        let rt = RoundTable {
            id: id.clone(),
            topic: req.topic,
            goal: req.goal,
            facilitator: req.facilitator,
            participants,
            backing_group_id: group.id,
            status: RoundTableStatus::Open,
            thread: Vec::new(),
            outcome: None,
            decision: None,
            created_at: now.to_rfc3339(),
            expires_at: expires_at.to_rfc3339(),
            resolved_at: None,
        };

        let created = self
            .storage
            .create_round_table(rt)
            .await
            .map_err(|e| HubError::Storage(e.to_string()))?;

        for participant in &created.participants {
            let envelope = work_order_envelope(&created, participant);
            if let Err(e) = self.groups.deliver_unsigned(envelope).await {
                eprintln!(
                    "round table {} failed to deliver work_order to {participant}: {e}",
                    created.id
                );
            }
        }

        Ok(created)
    }

    pub async fn get(&self, id: &str, requester: &str) -> HubResult<RoundTable> {
        let rt = self.fetch(id).await?;
        self.require_seated(&rt, requester)?;
        Ok(rt)
    }

    pub async fn list_for(&self, agent_id: &str) -> HubResult<Vec<RoundTable>> {
        self.storage
            .list_round_tables(RoundTableFilter {
                status: None,
                participant: Some(agent_id.to_string()),
            })
            .await
            .map_err(|e| HubError::Storage(e.to_string()))
    }

    /// §4.6 speak: only the facilitator or a seated participant may post; the table must
    /// still be open; message length is bounded.
    pub async fn speak(&self, id: &str, from: &str, message: String) -> HubResult<RoundTable> {
        let rt = self.fetch(id).await?;
        self.require_seated(&rt, from)?;
        if rt.status != RoundTableStatus::Open {
            return Err(HubError::Conflict("round table is not open".into()));
        }
        if message.is_empty() {
            return Err(HubError::Validation("message must not be empty".into()));
        }
        if message.len() > MAX_MESSAGE_LEN {
            return Err(HubError::Validation(format!(
                "message exceeds the {MAX_MESSAGE_LEN}-character limit"
            )));
        }
        if rt.thread.len() >= MAX_THREAD_LEN {
            return Err(HubError::Conflict("round table thread is full".into()));
        }

        let entry = ThreadEntry {
            id: format!("thread://{}", uuid::Uuid::new_v4()),
            from: from.to_string(),
            message,
            timestamp: Utc::now().to_rfc3339(),
        };

        self.storage
            .update_round_table(id, Box::new(move |rt| rt.thread.push(entry)))
            .await
            .map_err(|e| HubError::Storage(e.to_string()))
    }

    /// §4.6 resolve: facilitator-only, records outcome/decision, deletes the backing group.
    pub async fn resolve(
        &self,
        id: &str,
        requester: &str,
        outcome: String,
        decision: Option<String>,
    ) -> HubResult<RoundTable> {
        let rt = self.fetch(id).await?;
        if rt.facilitator != requester {
            return Err(HubError::Forbidden(
                "only the facilitator may resolve a round table".into(),
            ));
        }
        if rt.status != RoundTableStatus::Open {
            return Err(HubError::Conflict("round table is not open".into()));
        }

        let now = Utc::now().to_rfc3339();
        let resolved = self
            .storage
            .update_round_table(
                id,
                Box::new(move |rt| {
                    rt.status = RoundTableStatus::Resolved;
                    rt.outcome = Some(outcome);
                    rt.decision = decision;
                    rt.resolved_at = Some(now);
                }),
            )
            .await
            .map_err(|e| HubError::Storage(e.to_string()))?;

        if let Err(e) = self.groups.delete(&rt.backing_group_id, requester).await {
            eprintln!(
                "round table {id} resolved but failed to tear down backing group {}: {e}",
                rt.backing_group_id
            );
        }

        Ok(resolved)
    }

    /// Background sweep (§4.6, §5): open tables past `expires_at` transition to `expired`,
    /// and the facilitator plus every seated participant each receive a `notification`
    /// envelope announcing it (§8 scenario 6), with signature verification disabled.
    pub async fn expire_stale(&self) -> HubResult<usize> {
        let open = self
            .storage
            .list_round_tables(RoundTableFilter {
                status: Some(RoundTableStatus::Open),
                participant: None,
            })
            .await
            .map_err(|e| HubError::Storage(e.to_string()))?;

        let now = Utc::now();
        let mut count = 0;
        for rt in open {
            let Ok(expires) = chrono::DateTime::parse_from_rfc3339(&rt.expires_at) else {
                continue;
            };
            if expires.with_timezone(&Utc) < now {
                let updated = self
                    .storage
                    .update_round_table(
                        &rt.id,
                        Box::new(|rt| rt.status = RoundTableStatus::Expired),
                    )
                    .await;
                count += 1;

                let rt = updated.unwrap_or(rt);
                let recipients = std::iter::once(rt.facilitator.clone()).chain(rt.participants.clone());
                for recipient in recipients {
                    let envelope = notification_envelope(&rt, &recipient);
                    if let Err(e) = self.groups.deliver_unsigned(envelope).await {
                        eprintln!(
                            "round table {} failed to notify {recipient} of expiry: {e}",
                            rt.id
                        );
                    }
                }

                if let Err(e) = self.groups.delete(&rt.backing_group_id, &rt.facilitator).await {
                    eprintln!(
                        "round table {} expired but failed to tear down backing group {}: {e}",
                        rt.id, rt.backing_group_id
                    );
                }
            }
        }
        Ok(count)
    }

    /// Background sweep: permanently deletes round tables that finished (resolved/expired)
    /// before `cutoff`, keeping the store bounded.
    pub async fn purge_stale(&self, cutoff: &str) -> HubResult<usize> {
        self.storage
            .purge_round_tables_before(cutoff)
            .await
            .map_err(|e| HubError::Storage(e.to_string()))
    }

    async fn fetch(&self, id: &str) -> HubResult<RoundTable> {
        self.storage.get_round_table(id).await.map_err(|e| match e {
            crate::storage::StorageError::NotFound => HubError::not_found("round_table"),
            other => HubError::Storage(other.to_string()),
        })
    }

    fn require_seated(&self, rt: &RoundTable, agent_id: &str) -> HubResult<()> {
        if rt.facilitator == agent_id || rt.participants.iter().any(|p| p == agent_id) {
            return Ok(());
        }
        Err(HubError::Forbidden(
            "only the facilitator or a seated participant may access this round table".into(),
        ))
    }
}

/// §4.6 create step 6: a `work_order` envelope addressed to each enrolled participant,
/// synthesized by the hub the same way group fanout is (no sender signature to verify).
fn work_order_envelope(rt: &RoundTable, recipient: &str) -> Envelope {
    Envelope {
        version: "1.0".into(),
        id: format!("workorder://{}:{recipient}", rt.id),
        kind: "work_order".into(),
        from: rt.facilitator.clone(),
        to: recipient.to_string(),
        subject: format!("Round Table: {}", rt.topic),
        body: serde_json::json!({
            "round_table_id": rt.id,
            "topic": rt.topic,
            "goal": rt.goal,
            "facilitator": rt.facilitator,
        }),
        timestamp: Utc::now().to_rfc3339(),
        correlation_id: None,
        reply_to: None,
        ttl_sec: None,
        signature: None,
    }
}

/// §8 scenario 6: a `notification` envelope sent to the facilitator and every participant
/// when a round table expires, subject `Round Table expired: <topic>`.
fn notification_envelope(rt: &RoundTable, recipient: &str) -> Envelope {
    Envelope {
        version: "1.0".into(),
        id: format!("notify://{}:{recipient}", rt.id),
        kind: "notification".into(),
        from: rt.facilitator.clone(),
        to: recipient.to_string(),
        subject: format!("Round Table expired: {}", rt.topic),
        body: serde_json::json!({
            "round_table_id": rt.id,
            "topic": rt.topic,
        }),
        timestamp: Utc::now().to_rfc3339(),
        correlation_id: None,
        reply_to: None,
        ttl_sec: None,
        signature: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::agent::AgentService;
    use crate::services::inbox::InboxService;
    use crate::storage::memory::MemoryStorage;

    async fn setup() -> RoundTableService {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let agents = Arc::new(AgentService::new(storage.clone(), HubConfig::default()));
        let inbox = Arc::new(InboxService::new(storage.clone(), agents, HubConfig::default()));
        let groups = Arc::new(GroupService::new(storage.clone(), inbox));
        RoundTableService::new(storage, groups, HubConfig::default())
    }

    #[tokio::test]
    async fn enrollment_reflects_actual_group_membership() {
        let svc = setup().await;
        let rt = svc
            .create(CreateRoundTableRequest {
                topic: "architecture review".into(),
                goal: "decide on storage layer".into(),
                facilitator: "agent://facilitator".into(),
                invitees: vec!["agent://alice".into(), "agent://bob".into()],
                timeout_minutes: None,
            })
            .await
            .unwrap();

        assert_eq!(rt.participants.len(), 2);
        assert!(rt.participants.contains(&"agent://alice".to_string()));

        let group = svc.groups.get(&rt.backing_group_id).await.unwrap();
        for p in &rt.participants {
            assert!(group.is_member(p));
        }
    }

    #[tokio::test]
    async fn non_participant_cannot_speak() {
        let svc = setup().await;
        let rt = svc
            .create(CreateRoundTableRequest {
                topic: "t".into(),
                goal: "g".into(),
                facilitator: "agent://facilitator".into(),
                invitees: vec!["agent://alice".into()],
                timeout_minutes: None,
            })
            .await
            .unwrap();

        let err = svc
            .speak(&rt.id, "agent://outsider", "hello".into())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Forbidden(_)));
    }

    #[tokio::test]
    async fn resolve_tears_down_backing_group() {
        let svc = setup().await;
        let rt = svc
            .create(CreateRoundTableRequest {
                topic: "t".into(),
                goal: "g".into(),
                facilitator: "agent://facilitator".into(),
                invitees: vec!["agent://alice".into()],
                timeout_minutes: None,
            })
            .await
            .unwrap();

        let resolved = svc
            .resolve(&rt.id, "agent://facilitator", "done".into(), Some("ship it".into()))
            .await
            .unwrap();
        assert_eq!(resolved.status, RoundTableStatus::Resolved);

        let err = svc.groups.get(&rt.backing_group_id).await.unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_sends_work_order_to_each_participant() {
        let svc = setup().await;
        let rt = svc
            .create(CreateRoundTableRequest {
                topic: "deploy?".into(),
                goal: "decide".into(),
                facilitator: "agent://facilitator".into(),
                invitees: vec!["agent://alice".into(), "agent://bob".into()],
                timeout_minutes: None,
            })
            .await
            .unwrap();

        for participant in &rt.participants {
            let pulled = svc
                .groups
                .inbox
                .pull(
                    participant,
                    crate::services::inbox::PullOptions {
                        visibility_timeout_sec: None,
                    },
                )
                .await
                .unwrap()
                .expect("participant should have received a work_order envelope");
            assert_eq!(pulled.envelope.kind, "work_order");
            assert_eq!(pulled.envelope.subject, "Round Table: deploy?");
        }
    }

    #[tokio::test]
    async fn speak_rejects_once_thread_is_full() {
        let svc = setup().await;
        let rt = svc
            .create(CreateRoundTableRequest {
                topic: "t".into(),
                goal: "g".into(),
                facilitator: "agent://facilitator".into(),
                invitees: vec!["agent://alice".into()],
                timeout_minutes: None,
            })
            .await
            .unwrap();

        for _ in 0..MAX_THREAD_LEN {
            svc.speak(&rt.id, "agent://alice", "hi".into()).await.unwrap();
        }

        let err = svc
            .speak(&rt.id, "agent://alice", "one more".into())
            .await
            .unwrap_err();
        assert!(matches!(err, HubError::Conflict(_)));
    }

    #[tokio::test]
    async fn expire_stale_notifies_everyone_and_tears_down_group() {
        let svc = setup().await;
        let rt = svc
            .create(CreateRoundTableRequest {
                topic: "deploy?".into(),
                goal: "decide".into(),
                facilitator: "agent://facilitator".into(),
                invitees: vec!["agent://alice".into()],
                timeout_minutes: Some(1),
            })
            .await
            .unwrap();

        // Drain the work_order sent on create so the notification pull below is unambiguous.
        svc.groups
            .inbox
            .pull(
                "agent://alice",
                crate::services::inbox::PullOptions {
                    visibility_timeout_sec: None,
                },
            )
            .await
            .unwrap();

        svc.storage
            .update_round_table(
                &rt.id,
                Box::new(|rt| {
                    rt.expires_at = (Utc::now() - chrono::Duration::minutes(1)).to_rfc3339();
                }),
            )
            .await
            .unwrap();

        let count = svc.expire_stale().await.unwrap();
        assert_eq!(count, 1);

        let notified = svc
            .groups
            .inbox
            .pull(
                "agent://alice",
                crate::services::inbox::PullOptions {
                    visibility_timeout_sec: None,
                },
            )
            .await
            .unwrap()
            .expect("participant should have been notified of expiry");
        assert_eq!(notified.envelope.kind, "notification");
        assert_eq!(notified.envelope.subject, "Round Table expired: deploy?");

        let err = svc.groups.get(&rt.backing_group_id).await.unwrap_err();
        assert!(matches!(err, HubError::NotFound(_)));
    }
}
