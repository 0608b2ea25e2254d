//! HTTP surface (§6): agent lifecycle, inbox send/pull/ack/nack/reply, group membership and
//! fanout, round-table deliberation, issued-key management, discovery documents, health/stats.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use rocket::http::Status;
use rocket::request::{FromRequest, Outcome, Request};
use rocket::serde::json::Json;
use rocket::{delete, get, post, put, State};
use serde::Deserialize;

use crate::auth::{ApiKey, MasterKey};
use crate::crypto;
use crate::error::{HubError, HubResult};
use crate::models::{Envelope, GroupAccessType, IssuedKey};
use crate::rate_limit::{RateLimitConfig, RateLimiter};
use crate::services::agent::{AgentService, RegisterInput, RegisterRequest};
use crate::services::group::{CreateGroupRequest, GroupService, PostMessageRequest};
use crate::services::inbox::{InboxService, PullOptions};
use crate::services::round_table::{CreateRoundTableRequest, RoundTableService};
use crate::storage::Storage;

// --- Client IP extraction (teacher's pattern, used to key unauthenticated rate limits) ---

pub struct ClientIp(pub String);

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let ip = req
            .headers()
            .get_one("X-Forwarded-For")
            .and_then(|s| s.split(',').next())
            .map(|s| s.trim().to_string())
            .or_else(|| req.remote().map(|r| r.ip().to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        Outcome::Success(ClientIp(ip))
    }
}

fn rate_limited(limiter: &RateLimiter, key: &str, max: usize, window_secs: u64) -> Result<(), HubError> {
    if limiter.check(key, max, window_secs) {
        Ok(())
    } else {
        Err(HubError::PolicyDenied(format!(
            "rate limit exceeded for {key}"
        )))
    }
}

// --- System ---

#[get("/health")]
pub fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "admp-hub",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[get("/api/stats")]
pub async fn stats(
    storage: &State<Arc<dyn Storage>>,
) -> HubResult<Json<serde_json::Value>> {
    let agents = storage
        .list_agents(crate::storage::AgentFilter::default())
        .await
        .map_err(|e| HubError::Storage(e.to_string()))?;
    let groups = storage
        .list_groups()
        .await
        .map_err(|e| HubError::Storage(e.to_string()))?;
    let round_tables = storage
        .list_round_tables(crate::storage::RoundTableFilter::default())
        .await
        .map_err(|e| HubError::Storage(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "agents": agents.len(),
        "groups": groups.len(),
        "round_tables": round_tables.len(),
    })))
}

// --- Agents ---

#[derive(Deserialize)]
pub struct RegisterAgentBody {
    pub agent_id: Option<String>,
    pub agent_type: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub webhook_url: Option<String>,
    pub webhook_secret: Option<String>,
    pub mode: String,
    pub seed_b64: Option<String>,
    pub tenant_id: Option<String>,
    pub public_key_b64: Option<String>,
}

#[post("/api/agents/register", format = "json", data = "<body>")]
pub async fn register_agent(
    agents: &State<Arc<AgentService>>,
    limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    ip: ClientIp,
    body: Json<RegisterAgentBody>,
) -> HubResult<(Status, Json<serde_json::Value>)> {
    rate_limited(
        limiter,
        &format!("register:{}", ip.0),
        rate_config.register_max,
        rate_config.register_window_secs,
    )?;

    let mode = match body.mode.as_str() {
        "legacy" => RegisterInput::Legacy,
        "seed" => {
            let seed_b64 = body
                .seed_b64
                .as_deref()
                .ok_or_else(|| HubError::Validation("seed_b64 is required for seed mode".into()))?;
            let seed = B64.decode(seed_b64)
                .map_err(|e| HubError::Validation(format!("invalid seed_b64: {e}")))?;
            let tenant_id = body
                .tenant_id
                .clone()
                .ok_or_else(|| HubError::Validation("missing_tenant".into()))?;
            RegisterInput::Seed { seed, tenant_id }
        }
        "import" => {
            let public_key_b64 = body
                .public_key_b64
                .clone()
                .ok_or_else(|| HubError::Validation("public_key_b64 is required for import mode".into()))?;
            RegisterInput::Import { public_key_b64 }
        }
        other => return Err(HubError::Validation(format!("unknown registration mode: {other}"))),
    };

    let outcome = agents
        .register(RegisterRequest {
            agent_id: body.agent_id.clone(),
            agent_type: body.agent_type.clone(),
            metadata: body.metadata.clone(),
            webhook_url: body.webhook_url.clone(),
            webhook_secret: body.webhook_secret.clone(),
            mode,
        })
        .await?;

    Ok((
        Status::Created,
        Json(serde_json::json!({
            "agent": outcome.agent,
            "private_key_b64": outcome.private_key_b64,
            "webhook_secret": outcome.webhook_secret,
        })),
    ))
}

#[get("/api/agents/<agent_id>")]
pub async fn get_agent(agents: &State<Arc<AgentService>>, agent_id: &str) -> HubResult<Json<crate::models::Agent>> {
    Ok(Json(agents.get(agent_id).await?))
}

#[delete("/api/agents/<agent_id>")]
pub async fn delete_agent(agents: &State<Arc<AgentService>>, agent_id: &str, _key: ApiKey) -> HubResult<Json<serde_json::Value>> {
    agents.delete(agent_id).await?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

#[derive(Deserialize)]
pub struct HeartbeatBody {
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[post("/api/agents/<agent_id>/heartbeat", format = "json", data = "<body>")]
pub async fn heartbeat(
    agents: &State<Arc<AgentService>>,
    agent_id: &str,
    body: Json<HeartbeatBody>,
    key: ApiKey,
) -> HubResult<Json<crate::models::Agent>> {
    key.authorize_as(agent_id)?;
    Ok(Json(agents.heartbeat(agent_id, body.metadata.clone()).await?))
}

#[post("/api/agents/<agent_id>/approve")]
pub async fn approve_agent(agents: &State<Arc<AgentService>>, agent_id: &str, _master: MasterKey) -> HubResult<Json<crate::models::Agent>> {
    Ok(Json(agents.approve(agent_id).await?))
}

#[derive(Deserialize)]
pub struct RejectBody {
    #[serde(default)]
    pub reason: String,
}

#[post("/api/agents/<agent_id>/reject", format = "json", data = "<body>")]
pub async fn reject_agent(
    agents: &State<Arc<AgentService>>,
    agent_id: &str,
    body: Json<RejectBody>,
    _master: MasterKey,
) -> HubResult<Json<crate::models::Agent>> {
    Ok(Json(agents.reject(agent_id, &body.reason).await?))
}

#[derive(Deserialize)]
pub struct TrustBody {
    pub trusted_agent_id: String,
}

#[get("/api/agents/<agent_id>/trusted")]
pub async fn list_trusted_agents(
    agents: &State<Arc<AgentService>>,
    agent_id: &str,
) -> HubResult<Json<Vec<String>>> {
    Ok(Json(agents.get(agent_id).await?.trusted_agents))
}

#[post("/api/agents/<agent_id>/trusted", format = "json", data = "<body>")]
pub async fn add_trusted_agent(
    agents: &State<Arc<AgentService>>,
    agent_id: &str,
    body: Json<TrustBody>,
    key: ApiKey,
) -> HubResult<Json<crate::models::Agent>> {
    key.authorize_as(agent_id)?;
    Ok(Json(agents.add_trusted_agent(agent_id, &body.trusted_agent_id).await?))
}

#[delete("/api/agents/<agent_id>/trusted/<trusted_agent_id>")]
pub async fn remove_trusted_agent(
    agents: &State<Arc<AgentService>>,
    agent_id: &str,
    trusted_agent_id: &str,
    key: ApiKey,
) -> HubResult<Json<crate::models::Agent>> {
    key.authorize_as(agent_id)?;
    Ok(Json(agents.remove_trusted_agent(agent_id, trusted_agent_id).await?))
}

#[derive(Deserialize)]
pub struct WebhookConfigBody {
    pub url: String,
    pub secret: Option<String>,
}

#[put("/api/agents/<agent_id>/webhook", format = "json", data = "<body>")]
pub async fn configure_webhook(
    agents: &State<Arc<AgentService>>,
    agent_id: &str,
    body: Json<WebhookConfigBody>,
    key: ApiKey,
) -> HubResult<Json<serde_json::Value>> {
    key.authorize_as(agent_id)?;
    let secret = agents
        .configure_webhook(agent_id, body.url.clone(), body.secret.clone())
        .await?;
    Ok(Json(serde_json::json!({"secret": secret})))
}

#[delete("/api/agents/<agent_id>/webhook")]
pub async fn remove_webhook(agents: &State<Arc<AgentService>>, agent_id: &str, key: ApiKey) -> HubResult<Json<serde_json::Value>> {
    key.authorize_as(agent_id)?;
    agents.remove_webhook(agent_id).await?;
    Ok(Json(serde_json::json!({"removed": true})))
}

#[derive(Deserialize)]
pub struct RotateKeyBody {
    pub seed_b64: String,
    pub tenant_id: String,
}

#[post("/api/agents/<agent_id>/rotate-key", format = "json", data = "<body>")]
pub async fn rotate_key(
    agents: &State<Arc<AgentService>>,
    agent_id: &str,
    body: Json<RotateKeyBody>,
    key: ApiKey,
) -> HubResult<Json<serde_json::Value>> {
    key.authorize_as(agent_id)?;
    let seed = B64.decode(&body.seed_b64)
        .map_err(|e| HubError::Validation(format!("invalid seed_b64: {e}")))?;
    let (agent, private_key_b64) = agents.rotate_key(agent_id, &seed, &body.tenant_id).await?;
    Ok(Json(serde_json::json!({
        "agent": agent,
        "private_key_b64": private_key_b64,
    })))
}

// --- Inbox ---

#[post("/api/agents/<agent_id>/messages", format = "json", data = "<envelope>")]
pub async fn send_message(
    inbox: &State<Arc<InboxService>>,
    limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    agent_id: &str,
    envelope: Json<Envelope>,
) -> HubResult<(Status, Json<crate::models::MessageRecord>)> {
    let envelope = envelope.into_inner();
    if envelope.from != agent_id {
        return Err(HubError::Validation(
            "envelope.from must match the sending agent in the path".into(),
        ));
    }
    rate_limited(
        limiter,
        &format!("send:{}", envelope.from),
        rate_config.send_max,
        rate_config.send_window_secs,
    )?;
    Ok((Status::Created, Json(inbox.send(envelope).await?)))
}

#[derive(Deserialize)]
pub struct PullQuery {
    #[serde(default)]
    pub visibility_timeout_sec: Option<i64>,
}

#[post("/api/agents/<agent_id>/inbox/pull", format = "json", data = "<body>")]
pub async fn pull_message(
    inbox: &State<Arc<InboxService>>,
    limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    agent_id: &str,
    body: Json<PullQuery>,
    key: ApiKey,
) -> HubResult<Json<Option<crate::models::MessageRecord>>> {
    key.authorize_as(agent_id)?;
    rate_limited(
        limiter,
        &format!("pull:{agent_id}"),
        rate_config.pull_max,
        rate_config.pull_window_secs,
    )?;
    let opts = PullOptions {
        visibility_timeout_sec: body.visibility_timeout_sec,
    };
    Ok(Json(inbox.pull(agent_id, opts).await?))
}

#[post("/api/agents/<agent_id>/inbox/reclaim")]
pub async fn reclaim_inbox(
    inbox: &State<Arc<InboxService>>,
    agent_id: &str,
    key: ApiKey,
) -> HubResult<Json<serde_json::Value>> {
    key.authorize_as(agent_id)?;
    let reclaimed = inbox.reclaim_expired_leases().await?;
    Ok(Json(serde_json::json!({"reclaimed": reclaimed})))
}

#[derive(Deserialize)]
pub struct AckBody {
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

#[post("/api/agents/<agent_id>/messages/<message_id>/ack", format = "json", data = "<body>")]
pub async fn ack_message(
    inbox: &State<Arc<InboxService>>,
    agent_id: &str,
    message_id: &str,
    body: Json<AckBody>,
) -> HubResult<Json<crate::models::MessageRecord>> {
    Ok(Json(inbox.ack(agent_id, message_id, body.result.clone()).await?))
}

#[derive(Deserialize)]
pub struct NackBody {
    #[serde(default)]
    pub requeue: bool,
    #[serde(default)]
    pub extend_sec: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[post("/api/agents/<agent_id>/messages/<message_id>/nack", format = "json", data = "<body>")]
pub async fn nack_message(
    inbox: &State<Arc<InboxService>>,
    agent_id: &str,
    message_id: &str,
    body: Json<NackBody>,
) -> HubResult<Json<crate::models::MessageRecord>> {
    Ok(Json(
        inbox
            .nack(agent_id, message_id, body.requeue, body.extend_sec, body.reason.clone())
            .await?,
    ))
}

#[post("/api/agents/<agent_id>/messages/<message_id>/reply", format = "json", data = "<envelope>")]
pub async fn reply_message(
    inbox: &State<Arc<InboxService>>,
    agent_id: &str,
    message_id: &str,
    envelope: Json<Envelope>,
) -> HubResult<Json<crate::models::MessageRecord>> {
    Ok(Json(inbox.reply(agent_id, message_id, envelope.into_inner()).await?))
}

#[get("/api/messages/<message_id>/status")]
pub async fn get_message_status(
    inbox: &State<Arc<InboxService>>,
    message_id: &str,
) -> HubResult<Json<crate::models::MessageRecord>> {
    Ok(Json(inbox.get_status(message_id).await?))
}

#[get("/api/agents/<agent_id>/inbox/stats")]
pub async fn inbox_stats(
    inbox: &State<Arc<InboxService>>,
    agent_id: &str,
) -> HubResult<Json<crate::services::inbox::InboxStats>> {
    Ok(Json(inbox.stats(agent_id).await?))
}

// --- Groups ---

#[derive(Deserialize)]
pub struct CreateGroupBody {
    pub id: Option<String>,
    pub name: String,
    pub creator: String,
    pub access: String,
    pub join_key: Option<String>,
    #[serde(default = "default_max_members")]
    pub max_members: usize,
    #[serde(default = "default_group_ttl")]
    pub message_ttl_sec: i64,
    pub history_retention_sec: Option<i64>,
}

fn default_max_members() -> usize {
    100
}

fn default_group_ttl() -> i64 {
    86_400
}

#[post("/api/groups", format = "json", data = "<body>")]
pub async fn create_group(groups: &State<Arc<GroupService>>, body: Json<CreateGroupBody>) -> HubResult<Json<crate::models::Group>> {
    let access = match body.access.as_str() {
        "open" => GroupAccessType::Open,
        "invite_only" => GroupAccessType::InviteOnly,
        "key_protected" => GroupAccessType::KeyProtected,
        other => return Err(HubError::Validation(format!("unknown access type: {other}"))),
    };
    Ok(Json(
        groups
            .create(CreateGroupRequest {
                id: body.id.clone(),
                name: body.name.clone(),
                creator: body.creator.clone(),
                access,
                join_key: body.join_key.clone(),
                max_members: body.max_members,
                message_ttl_sec: body.message_ttl_sec,
                history_retention_sec: body.history_retention_sec,
            })
            .await?,
    ))
}

#[get("/api/groups/<group_id>")]
pub async fn get_group(groups: &State<Arc<GroupService>>, group_id: &str) -> HubResult<Json<crate::models::Group>> {
    Ok(Json(groups.get(group_id).await?))
}

#[get("/api/groups")]
pub async fn list_groups(groups: &State<Arc<GroupService>>) -> HubResult<Json<Vec<crate::models::Group>>> {
    Ok(Json(groups.list().await?))
}

#[derive(Deserialize)]
pub struct DeleteGroupBody {
    pub requester: String,
}

#[delete("/api/groups/<group_id>", format = "json", data = "<body>")]
pub async fn delete_group(
    groups: &State<Arc<GroupService>>,
    group_id: &str,
    body: Json<DeleteGroupBody>,
) -> HubResult<Json<serde_json::Value>> {
    groups.delete(group_id, &body.requester).await?;
    Ok(Json(serde_json::json!({"deleted": true})))
}

#[derive(Deserialize)]
pub struct JoinGroupBody {
    pub agent_id: String,
    pub join_key: Option<String>,
}

#[post("/api/groups/<group_id>/join", format = "json", data = "<body>")]
pub async fn join_group(
    groups: &State<Arc<GroupService>>,
    group_id: &str,
    body: Json<JoinGroupBody>,
) -> HubResult<Json<crate::models::Group>> {
    Ok(Json(
        groups
            .join(group_id, &body.agent_id, body.join_key.as_deref())
            .await?,
    ))
}

#[derive(Deserialize)]
pub struct AddMemberBody {
    pub requester: String,
    pub agent_id: String,
}

#[post("/api/groups/<group_id>/members", format = "json", data = "<body>")]
pub async fn add_group_member(
    groups: &State<Arc<GroupService>>,
    group_id: &str,
    body: Json<AddMemberBody>,
) -> HubResult<Json<crate::models::Group>> {
    Ok(Json(
        groups
            .add_member(group_id, &body.requester, &body.agent_id)
            .await?,
    ))
}

#[delete("/api/groups/<group_id>/members/<agent_id>")]
pub async fn leave_group(
    groups: &State<Arc<GroupService>>,
    group_id: &str,
    agent_id: &str,
) -> HubResult<Json<serde_json::Value>> {
    groups.leave(group_id, agent_id).await?;
    Ok(Json(serde_json::json!({"left": true})))
}

#[derive(Deserialize)]
pub struct PostGroupMessageBody {
    pub sender: String,
    pub subject: String,
    pub body: serde_json::Value,
    pub correlation_id: Option<String>,
}

#[post("/api/groups/<group_id>/messages", format = "json", data = "<body>")]
pub async fn post_group_message(
    groups: &State<Arc<GroupService>>,
    limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    group_id: &str,
    body: Json<PostGroupMessageBody>,
) -> HubResult<Json<crate::models::GroupHistoryEntry>> {
    rate_limited(
        limiter,
        &format!("group-post:{}", body.sender),
        rate_config.group_post_max,
        rate_config.group_post_window_secs,
    )?;
    Ok(Json(
        groups
            .post_message(
                group_id,
                PostMessageRequest {
                    sender: body.sender.clone(),
                    subject: body.subject.clone(),
                    body: body.body.clone(),
                    correlation_id: body.correlation_id.clone(),
                },
            )
            .await?,
    ))
}

#[get("/api/groups/<group_id>/messages?<limit>&<since>")]
pub async fn get_group_history(
    groups: &State<Arc<GroupService>>,
    group_id: &str,
    limit: Option<usize>,
    since: Option<String>,
) -> HubResult<Json<Vec<crate::models::GroupHistoryEntry>>> {
    Ok(Json(
        groups
            .history(group_id, limit.unwrap_or(50), since.as_deref())
            .await?,
    ))
}

// --- Round tables ---

#[derive(Deserialize)]
pub struct CreateRoundTableBody {
    pub topic: String,
    pub goal: String,
    pub facilitator: String,
    pub invitees: Vec<String>,
    pub timeout_minutes: Option<i64>,
}

#[post("/api/round-tables", format = "json", data = "<body>")]
pub async fn create_round_table(
    round_tables: &State<Arc<RoundTableService>>,
    body: Json<CreateRoundTableBody>,
) -> HubResult<Json<crate::models::RoundTable>> {
    Ok(Json(
        round_tables
            .create(CreateRoundTableRequest {
                topic: body.topic.clone(),
                goal: body.goal.clone(),
                facilitator: body.facilitator.clone(),
                invitees: body.invitees.clone(),
                timeout_minutes: body.timeout_minutes,
            })
            .await?,
    ))
}

#[get("/api/round-tables/<id>?<requester>")]
pub async fn get_round_table(
    round_tables: &State<Arc<RoundTableService>>,
    id: &str,
    requester: &str,
) -> HubResult<Json<crate::models::RoundTable>> {
    Ok(Json(round_tables.get(id, requester).await?))
}

#[get("/api/round-tables?<agent_id>")]
pub async fn list_round_tables(
    round_tables: &State<Arc<RoundTableService>>,
    agent_id: &str,
) -> HubResult<Json<Vec<crate::models::RoundTable>>> {
    Ok(Json(round_tables.list_for(agent_id).await?))
}

#[derive(Deserialize)]
pub struct SpeakBody {
    pub from: String,
    pub message: String,
}

#[post("/api/round-tables/<id>/speak", format = "json", data = "<body>")]
pub async fn speak_round_table(
    round_tables: &State<Arc<RoundTableService>>,
    limiter: &State<RateLimiter>,
    rate_config: &State<RateLimitConfig>,
    id: &str,
    body: Json<SpeakBody>,
) -> HubResult<Json<crate::models::RoundTable>> {
    rate_limited(
        limiter,
        &format!("round-table-speak:{}", body.from),
        rate_config.round_table_speak_max,
        rate_config.round_table_speak_window_secs,
    )?;
    Ok(Json(
        round_tables
            .speak(id, &body.from, body.message.clone())
            .await?,
    ))
}

#[derive(Deserialize)]
pub struct ResolveBody {
    pub requester: String,
    pub outcome: String,
    pub decision: Option<String>,
}

#[post("/api/round-tables/<id>/resolve", format = "json", data = "<body>")]
pub async fn resolve_round_table(
    round_tables: &State<Arc<RoundTableService>>,
    id: &str,
    body: Json<ResolveBody>,
) -> HubResult<Json<crate::models::RoundTable>> {
    Ok(Json(
        round_tables
            .resolve(id, &body.requester, body.outcome.clone(), body.decision.clone())
            .await?,
    ))
}

// --- Issued keys (master-key gated) ---

#[derive(Deserialize)]
pub struct IssueKeyBody {
    pub client_id: String,
    pub description: String,
    pub target_agent_id: Option<String>,
    pub single_use: bool,
    pub expires_at: Option<String>,
}

#[post("/api/keys", format = "json", data = "<body>")]
pub async fn issue_key(
    storage: &State<Arc<dyn Storage>>,
    body: Json<IssueKeyBody>,
    _master: MasterKey,
) -> HubResult<Json<serde_json::Value>> {
    let raw_key = uuid::Uuid::new_v4().to_string();
    let key_hash = crypto::sha256_hex(&raw_key);
    let issued = IssuedKey {
        key_id: format!("key://{}", uuid::Uuid::new_v4()),
        key_hash,
        client_id: body.client_id.clone(),
        description: body.description.clone(),
        created_at: chrono::Utc::now().to_rfc3339(),
        expires_at: body.expires_at.clone(),
        revoked: false,
        revoked_at: None,
        single_use: body.single_use,
        used_at: None,
        target_agent_id: body.target_agent_id.clone(),
    };
    let created = storage
        .create_issued_key(issued)
        .await
        .map_err(|e| HubError::Storage(e.to_string()))?;
    Ok(Json(serde_json::json!({
        "key": created,
        "raw_key": raw_key,
    })))
}

#[get("/api/keys")]
pub async fn list_keys(storage: &State<Arc<dyn Storage>>, _master: MasterKey) -> HubResult<Json<Vec<IssuedKey>>> {
    Ok(Json(
        storage
            .list_issued_keys()
            .await
            .map_err(|e| HubError::Storage(e.to_string()))?,
    ))
}

#[post("/api/keys/<key_id>/revoke")]
pub async fn revoke_key(storage: &State<Arc<dyn Storage>>, key_id: &str, _master: MasterKey) -> HubResult<Json<serde_json::Value>> {
    storage
        .revoke_issued_key(key_id)
        .await
        .map_err(|e| HubError::Storage(e.to_string()))?;
    Ok(Json(serde_json::json!({"revoked": true})))
}

// --- Discovery ---

#[get("/.well-known/agent-keys.json")]
pub async fn agent_keys_jwks(storage: &State<Arc<dyn Storage>>) -> HubResult<Json<serde_json::Value>> {
    let agents = storage
        .list_agents(crate::storage::AgentFilter::default())
        .await
        .map_err(|e| HubError::Storage(e.to_string()))?;
    let keys: Vec<serde_json::Value> = agents
        .iter()
        .flat_map(|a| {
            a.keys.iter().map(move |k| {
                serde_json::json!({
                    "kid": format!("{}:v{}", a.agent_id, k.version),
                    "kty": "OKP",
                    "crv": "Ed25519",
                    "x": k.public_key,
                    "active": k.active,
                })
            })
        })
        .collect();
    Ok(Json(serde_json::json!({"keys": keys})))
}

#[get("/api/agents/<agent_id>/did.json")]
pub async fn did_document(agents: &State<Arc<AgentService>>, agent_id: &str) -> HubResult<Json<serde_json::Value>> {
    let agent = agents.get(agent_id).await?;
    let did = agent
        .did
        .clone()
        .ok_or_else(|| HubError::Validation("this agent was not registered with a DID".into()))?;
    Ok(Json(serde_json::json!({
        "id": did,
        "verificationMethod": [{
            "id": format!("{did}#key-1"),
            "type": "Ed25519VerificationKey2020",
            "controller": did,
            "publicKeyBase64": agent.public_key,
        }],
    })))
}

// --- Catchers ---

#[rocket::catch(429)]
pub fn too_many_requests() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "rate limit exceeded", "code": "POLICY_DENIED"}))
}

#[rocket::catch(404)]
pub fn not_found() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "not found", "code": "NOT_FOUND"}))
}

#[rocket::catch(401)]
pub fn unauthorized() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "unauthorized", "code": "UNAUTHORIZED"}))
}

#[rocket::catch(400)]
pub fn bad_request() -> Json<serde_json::Value> {
    Json(serde_json::json!({"error": "bad request", "code": "VALIDATION_ERROR"}))
}

