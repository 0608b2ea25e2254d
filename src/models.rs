//! Entities of §3: Agent, Message record, Group, Group-message history entry, Round table,
//! Issued API key, Tenant — plus the envelope wire format of §6.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// --- Envelope (§6 wire format) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeSignature {
    pub alg: String,
    pub kid: String,
    pub sig: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub body: serde_json::Value,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_sec: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<EnvelopeSignature>,
}

// --- Agent (§3) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationMode {
    Legacy,
    Seed,
    Import,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeartbeatStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRecord {
    pub version: u32,
    pub public_key: String,
    pub active: bool,
    pub created_at: String,
    /// Set when a rotation supersedes this key; verification still accepts it until then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivate_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub last_heartbeat: String,
    pub status: HeartbeatStatus,
    pub interval_ms: u64,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    pub secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub agent_id: String,
    pub agent_type: String,
    pub public_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub did: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    pub registration_mode: RegistrationMode,
    pub key_version: u32,
    pub keys: Vec<KeyRecord>,
    pub created_at: String,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deactivate_at: Option<String>,
    pub verification_tier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derivation_context: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookConfig>,
    pub heartbeat: Heartbeat,
    #[serde(default)]
    pub trusted_agents: Vec<String>,
    #[serde(default)]
    pub blocked_agents: Vec<String>,
    pub registration_status: RegistrationStatus,
}

// --- Message record (§3) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Queued,
    Leased,
    Acked,
    Nacked,
    Failed,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub recipient: String,
    pub envelope: Envelope,
    pub status: MessageStatus,
    pub attempts: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acked_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub ttl_sec: i64,
}

// --- Group (§3) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupAccessType {
    Open,
    InviteOnly,
    KeyProtected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupRole {
    Owner,
    Admin,
    Member,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupAccess {
    #[serde(rename = "type")]
    pub kind: GroupAccessType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub join_key_hash: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSettings {
    pub max_members: usize,
    pub message_ttl_sec: i64,
    #[serde(default)]
    pub history_retention_sec: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMember {
    pub agent_id: String,
    pub role: GroupRole,
    pub joined_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: String,
    pub name: String,
    pub creator: String,
    pub access: GroupAccess,
    pub settings: GroupSettings,
    pub members: Vec<GroupMember>,
    pub created_at: String,
    pub deleted: bool,
}

impl Group {
    pub fn owner(&self) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.role == GroupRole::Owner)
    }

    pub fn member(&self, agent_id: &str) -> Option<&GroupMember> {
        self.members.iter().find(|m| m.agent_id == agent_id)
    }

    pub fn is_member(&self, agent_id: &str) -> bool {
        self.member(agent_id).is_some()
    }
}

// --- Group-message history entry (§3) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupHistoryEntry {
    pub group_id: String,
    pub group_message_id: String,
    pub sender: String,
    pub subject: String,
    pub body: serde_json::Value,
    pub timestamp: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

// --- Round table (§3) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundTableStatus {
    Open,
    Resolved,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadEntry {
    pub id: String,
    pub from: String,
    pub message: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundTable {
    pub id: String,
    pub topic: String,
    pub goal: String,
    pub facilitator: String,
    pub participants: Vec<String>,
    pub backing_group_id: String,
    pub status: RoundTableStatus,
    pub thread: Vec<ThreadEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decision: Option<String>,
    pub created_at: String,
    pub expires_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

// --- Issued API key (§3) ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedKey {
    pub key_id: String,
    pub key_hash: String,
    pub client_id: String,
    pub description: String,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
    pub revoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<String>,
    pub single_use: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_agent_id: Option<String>,
}

// --- Tenant (§3, optional feature) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantRegistrationPolicy {
    Open,
    ApprovalRequired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: String,
    pub registration_policy: TenantRegistrationPolicy,
}

pub type Metadata = HashMap<String, serde_json::Value>;
