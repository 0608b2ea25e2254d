//! Remote storage backend: a document-store client reached over HTTP. Same contract as
//! `memory::MemoryStorage`, but latency is higher, so callers (the services in
//! `crate::services`) bulk-load things like group membership once per fanout rather than
//! looking them up per recipient (§4.2, §5).
//!
//! Collections mirror the persisted layout of §6: `admp_agents`, `admp_messages`,
//! `admp_groups`, `admp_group_messages`, `admp_round_tables`, `admp_keys`, `admp_tenants`.
//! Document ids are entity ids. `lease_next` is delegated to the store's own conditional
//! update endpoint so it stays race-free without a client-side lock (§9).

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::models::{
    Agent, Group, GroupHistoryEntry, IssuedKey, MessageRecord, RoundTable, Tenant,
};

use super::{AgentFilter, MessageFilter, RoundTableFilter, Storage, StorageError, StorageResult};

const MAX_RETRIES: u32 = 3;

pub struct RemoteStorage {
    http: Client,
    base_url: String,
    app_id: String,
    api_key: Option<String>,
}

impl RemoteStorage {
    pub fn new(base_url: &str, app_id: &str, api_key: Option<String>) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_millis(200 * 5))
            .build()
            .expect("failed to build remote storage HTTP client");
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            app_id: app_id.to_string(),
            api_key,
        }
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/apps/{}{}",
            self.base_url,
            self.app_id,
            path
        )
    }

    fn decorate(&self, rb: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => rb.bearer_auth(key),
            None => rb,
        }
    }

    /// Retry transient (5xx, timeout) failures with a short fixed backoff; 4xx never retries.
    async fn execute_with_retry(
        &self,
        build: impl Fn() -> RequestBuilder,
    ) -> StorageResult<Response> {
        let mut last_err = None;
        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(50 * 2u64.pow(attempt))).await;
            }
            let start = Instant::now();
            match self.decorate(build()).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) if resp.status() == StatusCode::NOT_FOUND => {
                    return Err(StorageError::NotFound)
                }
                Ok(resp) if resp.status() == StatusCode::CONFLICT => {
                    return Err(StorageError::Conflict("remote store reported conflict".into()))
                }
                Ok(resp) if resp.status().is_server_error() => {
                    last_err = Some(format!("HTTP {} after {:?}", resp.status(), start.elapsed()));
                }
                Ok(resp) => {
                    return Err(StorageError::Backend(format!("HTTP {}", resp.status())));
                }
                Err(e) => last_err = Some(e.to_string()),
            }
        }
        Err(StorageError::Backend(
            last_err.unwrap_or_else(|| "remote store unreachable".into()),
        ))
    }

    async fn put_doc<T: Serialize + Sync>(&self, collection: &str, id: &str, doc: &T) -> StorageResult<()> {
        let body = serde_json::to_value(doc).map_err(|e| StorageError::Backend(e.to_string()))?;
        let path = format!("/collections/{collection}/docs/{id}");
        self.execute_with_retry(|| self.http.put(self.url(&path)).json(&body))
            .await?;
        Ok(())
    }

    async fn get_doc<T: DeserializeOwned>(&self, collection: &str, id: &str) -> StorageResult<T> {
        let path = format!("/collections/{collection}/docs/{id}");
        let resp = self
            .execute_with_retry(|| self.http.get(self.url(&path)))
            .await?;
        resp.json::<T>()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn delete_doc(&self, collection: &str, id: &str) -> StorageResult<()> {
        let path = format!("/collections/{collection}/docs/{id}");
        self.execute_with_retry(|| self.http.delete(self.url(&path)))
            .await?;
        Ok(())
    }

    async fn query_docs<T: DeserializeOwned>(
        &self,
        collection: &str,
        filter: &serde_json::Value,
    ) -> StorageResult<Vec<T>> {
        let path = format!("/collections/{collection}/query");
        let resp = self
            .execute_with_retry(|| self.http.post(self.url(&path)).json(filter))
            .await?;
        resp.json::<Vec<T>>()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

#[async_trait]
impl Storage for RemoteStorage {
    async fn create_agent(&self, agent: Agent) -> StorageResult<Agent> {
        if self.get_doc::<Agent>("admp_agents", &agent.agent_id).await.is_ok() {
            return Err(StorageError::Conflict("agent_exists".into()));
        }
        self.put_doc("admp_agents", &agent.agent_id, &agent).await?;
        Ok(agent)
    }

    async fn get_agent(&self, agent_id: &str) -> StorageResult<Agent> {
        self.get_doc("admp_agents", agent_id).await
    }

    async fn update_agent(
        &self,
        agent_id: &str,
        f: Box<dyn FnOnce(&mut Agent) + Send>,
    ) -> StorageResult<Agent> {
        let mut agent: Agent = self.get_doc("admp_agents", agent_id).await?;
        f(&mut agent);
        self.put_doc("admp_agents", agent_id, &agent).await?;
        Ok(agent)
    }

    async fn delete_agent(&self, agent_id: &str) -> StorageResult<()> {
        self.delete_doc("admp_agents", agent_id).await
    }

    async fn list_agents(&self, filter: AgentFilter) -> StorageResult<Vec<Agent>> {
        let query = serde_json::json!({ "status": filter.status });
        self.query_docs("admp_agents", &query).await
    }

    async fn create_message(&self, message: MessageRecord) -> StorageResult<MessageRecord> {
        if let Ok(existing) = self.get_doc::<MessageRecord>("admp_messages", &message.id).await {
            return Ok(existing);
        }
        self.put_doc("admp_messages", &message.id, &message).await?;
        Ok(message)
    }

    async fn get_message(&self, message_id: &str) -> StorageResult<MessageRecord> {
        self.get_doc("admp_messages", message_id).await
    }

    async fn update_message(
        &self,
        message_id: &str,
        f: Box<dyn FnOnce(&mut MessageRecord) + Send>,
    ) -> StorageResult<MessageRecord> {
        let mut msg: MessageRecord = self.get_doc("admp_messages", message_id).await?;
        f(&mut msg);
        msg.updated_at = chrono::Utc::now().to_rfc3339();
        self.put_doc("admp_messages", message_id, &msg).await?;
        Ok(msg)
    }

    async fn list_messages(
        &self,
        recipient: &str,
        filter: MessageFilter,
    ) -> StorageResult<Vec<MessageRecord>> {
        let query = serde_json::json!({ "recipient": recipient, "status": filter.status });
        self.query_docs("admp_messages", &query).await
    }

    async fn delete_message(&self, message_id: &str) -> StorageResult<()> {
        self.delete_doc("admp_messages", message_id).await
    }

    async fn lease_next(
        &self,
        recipient: &str,
        visibility_timeout_sec: i64,
    ) -> StorageResult<MessageRecord> {
        // Delegated to the store's conditional-update endpoint so atomicity doesn't depend
        // on a client-side lock (§9: "relies on the remote store's own concurrency control").
        let path = "/collections/admp_messages/atomic/lease-next";
        let body = serde_json::json!({
            "recipient": recipient,
            "visibility_timeout_sec": visibility_timeout_sec,
        });
        let resp = self
            .execute_with_retry(|| self.http.post(self.url(path)).json(&body))
            .await?;
        resp.json::<MessageRecord>()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn reclaim_expired_leases(&self) -> StorageResult<Vec<MessageRecord>> {
        let path = "/collections/admp_messages/atomic/reclaim-expired";
        let resp = self
            .execute_with_retry(|| self.http.post(self.url(path)))
            .await?;
        resp.json::<Vec<MessageRecord>>()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn expire_old_messages(&self) -> StorageResult<Vec<MessageRecord>> {
        let path = "/collections/admp_messages/atomic/expire-old";
        let resp = self
            .execute_with_retry(|| self.http.post(self.url(path)))
            .await?;
        resp.json::<Vec<MessageRecord>>()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn create_group(&self, group: Group) -> StorageResult<Group> {
        if self.get_doc::<Group>("admp_groups", &group.id).await.is_ok() {
            return Err(StorageError::Conflict("group_exists".into()));
        }
        self.put_doc("admp_groups", &group.id, &group).await?;
        Ok(group)
    }

    async fn get_group(&self, group_id: &str) -> StorageResult<Group> {
        self.get_doc("admp_groups", group_id).await
    }

    async fn update_group(
        &self,
        group_id: &str,
        f: Box<dyn FnOnce(&mut Group) + Send>,
    ) -> StorageResult<Group> {
        let mut group: Group = self.get_doc("admp_groups", group_id).await?;
        f(&mut group);
        self.put_doc("admp_groups", group_id, &group).await?;
        Ok(group)
    }

    async fn delete_group(&self, group_id: &str) -> StorageResult<()> {
        self.delete_doc("admp_groups", group_id).await
    }

    async fn list_groups(&self) -> StorageResult<Vec<Group>> {
        self.query_docs("admp_groups", &serde_json::json!({})).await
    }

    async fn append_group_history(&self, entry: GroupHistoryEntry) -> StorageResult<bool> {
        let doc_id = format!("{}:{}", entry.group_id, entry.group_message_id);
        if self
            .get_doc::<GroupHistoryEntry>("admp_group_messages", &doc_id)
            .await
            .is_ok()
        {
            return Ok(false);
        }
        self.put_doc("admp_group_messages", &doc_id, &entry).await?;
        Ok(true)
    }

    async fn list_group_history(
        &self,
        group_id: &str,
        limit: usize,
        since: Option<&str>,
    ) -> StorageResult<Vec<GroupHistoryEntry>> {
        let query = serde_json::json!({
            "group_id": group_id,
            "since": since,
            "limit": limit,
            "order": "desc",
        });
        self.query_docs("admp_group_messages", &query).await
    }

    async fn purge_group_history_before(&self, cutoff: &str) -> StorageResult<usize> {
        let path = "/collections/admp_group_messages/atomic/purge-before";
        let resp = self
            .execute_with_retry(|| self.http.post(self.url(path)).json(&serde_json::json!({ "cutoff": cutoff })))
            .await?;
        #[derive(serde::Deserialize)]
        struct PurgeResult {
            purged: usize,
        }
        resp.json::<PurgeResult>()
            .await
            .map(|r| r.purged)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn create_round_table(&self, rt: RoundTable) -> StorageResult<RoundTable> {
        if self.get_doc::<RoundTable>("admp_round_tables", &rt.id).await.is_ok() {
            return Err(StorageError::Conflict("round_table_exists".into()));
        }
        self.put_doc("admp_round_tables", &rt.id, &rt).await?;
        Ok(rt)
    }

    async fn get_round_table(&self, id: &str) -> StorageResult<RoundTable> {
        self.get_doc("admp_round_tables", id).await
    }

    async fn update_round_table(
        &self,
        id: &str,
        f: Box<dyn FnOnce(&mut RoundTable) + Send>,
    ) -> StorageResult<RoundTable> {
        let mut rt: RoundTable = self.get_doc("admp_round_tables", id).await?;
        f(&mut rt);
        self.put_doc("admp_round_tables", id, &rt).await?;
        Ok(rt)
    }

    async fn delete_round_table(&self, id: &str) -> StorageResult<()> {
        self.delete_doc("admp_round_tables", id).await
    }

    async fn list_round_tables(&self, filter: RoundTableFilter) -> StorageResult<Vec<RoundTable>> {
        let query = serde_json::json!({
            "status": filter.status,
            "participant": filter.participant,
        });
        self.query_docs("admp_round_tables", &query).await
    }

    async fn purge_round_tables_before(&self, cutoff: &str) -> StorageResult<usize> {
        let path = "/collections/admp_round_tables/atomic/purge-before";
        let resp = self
            .execute_with_retry(|| self.http.post(self.url(path)).json(&serde_json::json!({ "cutoff": cutoff })))
            .await?;
        #[derive(serde::Deserialize)]
        struct PurgeResult {
            purged: usize,
        }
        resp.json::<PurgeResult>()
            .await
            .map(|r| r.purged)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn create_issued_key(&self, key: IssuedKey) -> StorageResult<IssuedKey> {
        self.put_doc("admp_keys", &key.key_id, &key).await?;
        let path = format!("/collections/admp_keys/index/by-hash/{}", key.key_hash);
        self.execute_with_retry(|| self.http.put(self.url(&path)).json(&key.key_id))
            .await?;
        Ok(key)
    }

    async fn get_issued_key_by_hash(&self, key_hash: &str) -> StorageResult<IssuedKey> {
        let path = format!("/collections/admp_keys/index/by-hash/{key_hash}");
        let resp = self
            .execute_with_retry(|| self.http.get(self.url(&path)))
            .await?;
        let key_id: String = resp
            .json()
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        self.get_doc("admp_keys", &key_id).await
    }

    async fn list_issued_keys(&self) -> StorageResult<Vec<IssuedKey>> {
        self.query_docs("admp_keys", &serde_json::json!({})).await
    }

    async fn revoke_issued_key(&self, key_id: &str) -> StorageResult<()> {
        let mut key: IssuedKey = self.get_doc("admp_keys", key_id).await?;
        key.revoked = true;
        key.revoked_at = Some(chrono::Utc::now().to_rfc3339());
        self.put_doc("admp_keys", key_id, &key).await
    }

    async fn mark_issued_key_used(&self, key_id: &str) -> StorageResult<()> {
        let mut key: IssuedKey = self.get_doc("admp_keys", key_id).await?;
        key.used_at = Some(chrono::Utc::now().to_rfc3339());
        self.put_doc("admp_keys", key_id, &key).await
    }

    async fn get_tenant(&self, tenant_id: &str) -> StorageResult<Tenant> {
        self.get_doc("admp_tenants", tenant_id).await
    }
}
