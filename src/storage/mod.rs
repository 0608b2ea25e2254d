//! Storage abstraction (§4.2): a backend-neutral interface over agents, messages, groups,
//! group-message history, round tables, issued API keys, tenants. Two implementations live
//! alongside this trait: an in-process map-based backend (`memory`) and a remote
//! document-store-backed client (`remote`).

pub mod memory;
pub mod remote;

use async_trait::async_trait;

use crate::models::{
    Agent, Group, GroupHistoryEntry, IssuedKey, MessageRecord, RoundTable, Tenant,
};

#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("not found")]
    NotFound,
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Default)]
pub struct MessageFilter {
    pub status: Option<crate::models::MessageStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub status: Option<crate::models::RegistrationStatus>,
}

#[derive(Debug, Clone, Default)]
pub struct RoundTableFilter {
    pub status: Option<crate::models::RoundTableStatus>,
    pub participant: Option<String>,
}

/// The full storage contract. All operations are asynchronous; implementations MUST uphold
/// the invariants named in §4.2 (`lease_next` is race-free, `create_message` is idempotent
/// on envelope id, sub-object updates are partial merges not replacements).
#[async_trait]
pub trait Storage: Send + Sync {
    // Agents
    async fn create_agent(&self, agent: Agent) -> StorageResult<Agent>;
    async fn get_agent(&self, agent_id: &str) -> StorageResult<Agent>;
    /// Merge-updates an agent record with the callback's output; runs under the backend's
    /// own exclusion so callers get read-modify-write atomicity.
    async fn update_agent(
        &self,
        agent_id: &str,
        f: Box<dyn FnOnce(&mut Agent) + Send>,
    ) -> StorageResult<Agent>;
    async fn delete_agent(&self, agent_id: &str) -> StorageResult<()>;
    async fn list_agents(&self, filter: AgentFilter) -> StorageResult<Vec<Agent>>;

    // Messages
    async fn create_message(&self, message: MessageRecord) -> StorageResult<MessageRecord>;
    async fn get_message(&self, message_id: &str) -> StorageResult<MessageRecord>;
    async fn update_message(
        &self,
        message_id: &str,
        f: Box<dyn FnOnce(&mut MessageRecord) + Send>,
    ) -> StorageResult<MessageRecord>;
    async fn list_messages(
        &self,
        recipient: &str,
        filter: MessageFilter,
    ) -> StorageResult<Vec<MessageRecord>>;
    async fn delete_message(&self, message_id: &str) -> StorageResult<()>;
    /// Atomically selects the oldest `queued` record for `recipient` (tie-broken by id),
    /// transitions it to `leased` with a deadline `visibility_timeout_sec` out, increments
    /// its attempt counter, and returns it. Returns `StorageError::NotFound` when empty.
    async fn lease_next(
        &self,
        recipient: &str,
        visibility_timeout_sec: i64,
    ) -> StorageResult<MessageRecord>;
    /// Scans `leased` records whose lease has passed and returns them to `queued`.
    async fn reclaim_expired_leases(&self) -> StorageResult<Vec<MessageRecord>>;
    /// Scans `queued` records whose TTL has elapsed and transitions them to `expired`.
    async fn expire_old_messages(&self) -> StorageResult<Vec<MessageRecord>>;

    // Groups
    async fn create_group(&self, group: Group) -> StorageResult<Group>;
    async fn get_group(&self, group_id: &str) -> StorageResult<Group>;
    async fn update_group(
        &self,
        group_id: &str,
        f: Box<dyn FnOnce(&mut Group) + Send>,
    ) -> StorageResult<Group>;
    async fn delete_group(&self, group_id: &str) -> StorageResult<()>;
    async fn list_groups(&self) -> StorageResult<Vec<Group>>;

    // Group history
    async fn append_group_history(&self, entry: GroupHistoryEntry) -> StorageResult<bool>;
    async fn list_group_history(
        &self,
        group_id: &str,
        limit: usize,
        since: Option<&str>,
    ) -> StorageResult<Vec<GroupHistoryEntry>>;
    async fn purge_group_history_before(&self, cutoff: &str) -> StorageResult<usize>;

    // Round tables
    async fn create_round_table(&self, rt: RoundTable) -> StorageResult<RoundTable>;
    async fn get_round_table(&self, id: &str) -> StorageResult<RoundTable>;
    async fn update_round_table(
        &self,
        id: &str,
        f: Box<dyn FnOnce(&mut RoundTable) + Send>,
    ) -> StorageResult<RoundTable>;
    async fn delete_round_table(&self, id: &str) -> StorageResult<()>;
    async fn list_round_tables(&self, filter: RoundTableFilter) -> StorageResult<Vec<RoundTable>>;
    async fn purge_round_tables_before(&self, cutoff: &str) -> StorageResult<usize>;

    // Issued keys
    async fn create_issued_key(&self, key: IssuedKey) -> StorageResult<IssuedKey>;
    async fn get_issued_key_by_hash(&self, key_hash: &str) -> StorageResult<IssuedKey>;
    async fn list_issued_keys(&self) -> StorageResult<Vec<IssuedKey>>;
    async fn revoke_issued_key(&self, key_id: &str) -> StorageResult<()>;
    async fn mark_issued_key_used(&self, key_id: &str) -> StorageResult<()>;

    // Tenants
    async fn get_tenant(&self, tenant_id: &str) -> StorageResult<Tenant>;
}
