//! In-memory storage backend. A single `Mutex`-guarded region protects every state
//! transition, the same exclusion strategy the teacher's `Db` uses around its SQLite
//! connection — except here the "connection" is a handful of `HashMap`s. `lease_next` and
//! `create_message`'s dedupe check run inside that one critical section, which is what
//! makes them atomic with respect to concurrent callers (§4.2, §5).

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::models::{
    Agent, Group, GroupHistoryEntry, IssuedKey, MessageRecord, MessageStatus, RoundTable, Tenant,
};

use super::{AgentFilter, MessageFilter, RoundTableFilter, Storage, StorageError, StorageResult};

#[derive(Default)]
struct State {
    agents: HashMap<String, Agent>,
    messages: HashMap<String, MessageRecord>,
    groups: HashMap<String, Group>,
    group_history: HashMap<String, Vec<GroupHistoryEntry>>,
    round_tables: HashMap<String, RoundTable>,
    issued_keys: HashMap<String, IssuedKey>,
    issued_keys_by_hash: HashMap<String, String>,
    tenants: HashMap<String, Tenant>,
}

pub struct MemoryStorage {
    state: Mutex<State>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
        }
    }

    /// Seed a tenant directly (used by tests and by admin tooling outside the HTTP surface).
    pub fn seed_tenant(&self, tenant: Tenant) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.tenants.insert(tenant.id.clone(), tenant);
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn create_agent(&self, agent: Agent) -> StorageResult<Agent> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if s.agents.contains_key(&agent.agent_id) {
            return Err(StorageError::Conflict("agent_exists".into()));
        }
        s.agents.insert(agent.agent_id.clone(), agent.clone());
        Ok(agent)
    }

    async fn get_agent(&self, agent_id: &str) -> StorageResult<Agent> {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.agents.get(agent_id).cloned().ok_or(StorageError::NotFound)
    }

    async fn update_agent(
        &self,
        agent_id: &str,
        f: Box<dyn FnOnce(&mut Agent) + Send>,
    ) -> StorageResult<Agent> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let agent = s.agents.get_mut(agent_id).ok_or(StorageError::NotFound)?;
        f(agent);
        Ok(agent.clone())
    }

    async fn delete_agent(&self, agent_id: &str) -> StorageResult<()> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.agents.remove(agent_id).ok_or(StorageError::NotFound)?;
        Ok(())
    }

    async fn list_agents(&self, filter: AgentFilter) -> StorageResult<Vec<Agent>> {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(s.agents
            .values()
            .filter(|a| filter.status.is_none_or(|st| a.registration_status == st))
            .cloned()
            .collect())
    }

    async fn create_message(&self, message: MessageRecord) -> StorageResult<MessageRecord> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = s.messages.get(&message.id) {
            // Idempotent dedupe on envelope id (§4.2, §4.4 send step 6).
            return Ok(existing.clone());
        }
        s.messages.insert(message.id.clone(), message.clone());
        Ok(message)
    }

    async fn get_message(&self, message_id: &str) -> StorageResult<MessageRecord> {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.messages
            .get(message_id)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn update_message(
        &self,
        message_id: &str,
        f: Box<dyn FnOnce(&mut MessageRecord) + Send>,
    ) -> StorageResult<MessageRecord> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let msg = s
            .messages
            .get_mut(message_id)
            .ok_or(StorageError::NotFound)?;
        f(msg);
        msg.updated_at = Utc::now().to_rfc3339();
        Ok(msg.clone())
    }

    async fn list_messages(
        &self,
        recipient: &str,
        filter: MessageFilter,
    ) -> StorageResult<Vec<MessageRecord>> {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut out: Vec<MessageRecord> = s
            .messages
            .values()
            .filter(|m| m.recipient == recipient)
            .filter(|m| filter.status.is_none_or(|st| m.status == st))
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.created_at.as_str(), a.id.as_str()).cmp(&(b.created_at.as_str(), b.id.as_str())));
        Ok(out)
    }

    async fn delete_message(&self, message_id: &str) -> StorageResult<()> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.messages.remove(message_id).ok_or(StorageError::NotFound)?;
        Ok(())
    }

    async fn lease_next(
        &self,
        recipient: &str,
        visibility_timeout_sec: i64,
    ) -> StorageResult<MessageRecord> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let candidate_id = s
            .messages
            .values()
            .filter(|m| m.recipient == recipient && m.status == MessageStatus::Queued)
            .min_by(|a, b| (a.created_at.as_str(), a.id.as_str()).cmp(&(b.created_at.as_str(), b.id.as_str())))
            .map(|m| m.id.clone())
            .ok_or(StorageError::NotFound)?;

        let now = Utc::now();
        let lease_until = now + chrono::Duration::seconds(visibility_timeout_sec);
        let msg = s.messages.get_mut(&candidate_id).expect("candidate exists");
        msg.status = MessageStatus::Leased;
        msg.lease_until = Some(lease_until.to_rfc3339());
        msg.attempts += 1;
        msg.updated_at = now.to_rfc3339();
        Ok(msg.clone())
    }

    async fn reclaim_expired_leases(&self) -> StorageResult<Vec<MessageRecord>> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let mut reclaimed = Vec::new();
        for msg in s.messages.values_mut() {
            if msg.status != MessageStatus::Leased {
                continue;
            }
            let Some(lease_until) = &msg.lease_until else {
                continue;
            };
            let Ok(deadline) = chrono::DateTime::parse_from_rfc3339(lease_until) else {
                continue;
            };
            if deadline.with_timezone(&Utc) < now {
                msg.status = MessageStatus::Queued;
                msg.lease_until = None;
                msg.updated_at = now.to_rfc3339();
                reclaimed.push(msg.clone());
            }
        }
        Ok(reclaimed)
    }

    async fn expire_old_messages(&self) -> StorageResult<Vec<MessageRecord>> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Utc::now();
        let mut expired = Vec::new();
        for msg in s.messages.values_mut() {
            if msg.status != MessageStatus::Queued {
                continue;
            }
            let Ok(created) = chrono::DateTime::parse_from_rfc3339(&msg.created_at) else {
                continue;
            };
            let deadline = created.with_timezone(&Utc) + chrono::Duration::seconds(msg.ttl_sec);
            if deadline < now {
                msg.status = MessageStatus::Expired;
                msg.updated_at = now.to_rfc3339();
                expired.push(msg.clone());
            }
        }
        Ok(expired)
    }

    async fn create_group(&self, group: Group) -> StorageResult<Group> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if s.groups.contains_key(&group.id) {
            return Err(StorageError::Conflict("group_exists".into()));
        }
        s.groups.insert(group.id.clone(), group.clone());
        Ok(group)
    }

    async fn get_group(&self, group_id: &str) -> StorageResult<Group> {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.groups.get(group_id).cloned().ok_or(StorageError::NotFound)
    }

    async fn update_group(
        &self,
        group_id: &str,
        f: Box<dyn FnOnce(&mut Group) + Send>,
    ) -> StorageResult<Group> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let group = s.groups.get_mut(group_id).ok_or(StorageError::NotFound)?;
        f(group);
        Ok(group.clone())
    }

    async fn delete_group(&self, group_id: &str) -> StorageResult<()> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.groups.remove(group_id).ok_or(StorageError::NotFound)?;
        s.group_history.remove(group_id);
        Ok(())
    }

    async fn list_groups(&self) -> StorageResult<Vec<Group>> {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(s.groups.values().cloned().collect())
    }

    async fn append_group_history(&self, entry: GroupHistoryEntry) -> StorageResult<bool> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entries = s.group_history.entry(entry.group_id.clone()).or_default();
        if entries
            .iter()
            .any(|e| e.group_message_id == entry.group_message_id)
        {
            return Ok(false);
        }
        entries.push(entry);
        Ok(true)
    }

    async fn list_group_history(
        &self,
        group_id: &str,
        limit: usize,
        since: Option<&str>,
    ) -> StorageResult<Vec<GroupHistoryEntry>> {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<GroupHistoryEntry> = s
            .group_history
            .get(group_id)
            .cloned()
            .unwrap_or_default();
        if let Some(cursor) = since {
            entries.retain(|e| e.timestamp.as_str() > cursor);
        }
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        Ok(entries)
    }

    async fn purge_group_history_before(&self, cutoff: &str) -> StorageResult<usize> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut purged = 0;
        for entries in s.group_history.values_mut() {
            let before = entries.len();
            entries.retain(|e| e.timestamp.as_str() >= cutoff);
            purged += before - entries.len();
        }
        Ok(purged)
    }

    async fn create_round_table(&self, rt: RoundTable) -> StorageResult<RoundTable> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if s.round_tables.contains_key(&rt.id) {
            return Err(StorageError::Conflict("round_table_exists".into()));
        }
        s.round_tables.insert(rt.id.clone(), rt.clone());
        Ok(rt)
    }

    async fn get_round_table(&self, id: &str) -> StorageResult<RoundTable> {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.round_tables.get(id).cloned().ok_or(StorageError::NotFound)
    }

    async fn update_round_table(
        &self,
        id: &str,
        f: Box<dyn FnOnce(&mut RoundTable) + Send>,
    ) -> StorageResult<RoundTable> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let rt = s.round_tables.get_mut(id).ok_or(StorageError::NotFound)?;
        f(rt);
        Ok(rt.clone())
    }

    async fn delete_round_table(&self, id: &str) -> StorageResult<()> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.round_tables.remove(id).ok_or(StorageError::NotFound)?;
        Ok(())
    }

    async fn list_round_tables(&self, filter: RoundTableFilter) -> StorageResult<Vec<RoundTable>> {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(s.round_tables
            .values()
            .filter(|rt| filter.status.is_none_or(|st| rt.status == st))
            .filter(|rt| {
                filter
                    .participant
                    .as_deref()
                    .is_none_or(|p| rt.participants.iter().any(|x| x == p) || rt.facilitator == p)
            })
            .cloned()
            .collect())
    }

    async fn purge_round_tables_before(&self, cutoff: &str) -> StorageResult<usize> {
        use crate::models::RoundTableStatus;
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let before = s.round_tables.len();
        s.round_tables.retain(|_, rt| {
            let terminal = matches!(
                rt.status,
                RoundTableStatus::Resolved | RoundTableStatus::Expired
            );
            !(terminal && rt.created_at.as_str() < cutoff)
        });
        Ok(before - s.round_tables.len())
    }

    async fn create_issued_key(&self, key: IssuedKey) -> StorageResult<IssuedKey> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.issued_keys_by_hash
            .insert(key.key_hash.clone(), key.key_id.clone());
        s.issued_keys.insert(key.key_id.clone(), key.clone());
        Ok(key)
    }

    async fn get_issued_key_by_hash(&self, key_hash: &str) -> StorageResult<IssuedKey> {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let id = s
            .issued_keys_by_hash
            .get(key_hash)
            .ok_or(StorageError::NotFound)?;
        s.issued_keys.get(id).cloned().ok_or(StorageError::NotFound)
    }

    async fn list_issued_keys(&self) -> StorageResult<Vec<IssuedKey>> {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(s.issued_keys.values().cloned().collect())
    }

    async fn revoke_issued_key(&self, key_id: &str) -> StorageResult<()> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let key = s.issued_keys.get_mut(key_id).ok_or(StorageError::NotFound)?;
        key.revoked = true;
        key.revoked_at = Some(Utc::now().to_rfc3339());
        Ok(())
    }

    async fn mark_issued_key_used(&self, key_id: &str) -> StorageResult<()> {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let key = s.issued_keys.get_mut(key_id).ok_or(StorageError::NotFound)?;
        key.used_at = Some(Utc::now().to_rfc3339());
        Ok(())
    }

    async fn get_tenant(&self, tenant_id: &str) -> StorageResult<Tenant> {
        let s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        s.tenants.get(tenant_id).cloned().ok_or(StorageError::NotFound)
    }
}
