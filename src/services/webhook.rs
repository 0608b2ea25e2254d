//! Webhook push service (§4.7): fires an HMAC-signed delivery notification to a recipient's
//! configured endpoint whenever a message is queued for it. Bounded retry (3 attempts at
//! 0s/1s/2s, ≤3s total), dispatched off the request path so `send` never blocks on it.
//! Final failure just means the message stays queued and pollable — push is an optimization
//! over pull, never a replacement for it.

use chrono::Utc;
use serde::Serialize;

use crate::crypto;
use crate::models::{MessageRecord, WebhookConfig};

const USER_AGENT: &str = "ADMP-Server/1.0";
const RETRY_DELAYS_MS: [u64; 2] = [1_000, 2_000];

#[derive(Serialize)]
struct WebhookPayload {
    event: &'static str,
    message_id: String,
    envelope: serde_json::Value,
    delivered_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    signature: Option<String>,
}

/// Spawns the delivery attempt loop in the background and returns immediately.
pub fn dispatch(webhook: WebhookConfig, message: MessageRecord) {
    tokio::spawn(async move {
        if let Err(e) = deliver(&webhook, &message).await {
            eprintln!(
                "webhook push to {} for message {} exhausted retries: {e}",
                webhook.url, message.id
            );
        }
    });
}

async fn deliver(webhook: &WebhookConfig, message: &MessageRecord) -> Result<(), String> {
    let envelope_json =
        serde_json::to_value(&message.envelope).map_err(|e| format!("cannot serialize envelope: {e}"))?;

    let mut payload = WebhookPayload {
        event: "message.received",
        message_id: message.id.clone(),
        envelope: envelope_json,
        delivered_at: Utc::now().to_rfc3339(),
        signature: None,
    };
    let payload_value = serde_json::to_value(&payload).map_err(|e| e.to_string())?;
    let signature = crypto::webhook_hmac(&webhook.secret, &payload_value)?;
    payload.signature = Some(signature.clone());

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()
        .map_err(|e| e.to_string())?;
    let mut last_err = String::new();

    for (attempt, delay_ms) in std::iter::once(0).chain(RETRY_DELAYS_MS).enumerate() {
        if delay_ms > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
        }
        let attempt_number = attempt + 1;
        let result = client
            .post(&webhook.url)
            .header("Content-Type", "application/json")
            .header("User-Agent", USER_AGENT)
            .header("X-ADMP-Event", payload.event)
            .header("X-ADMP-Message-ID", &payload.message_id)
            .header("X-ADMP-Delivery-Attempt", attempt_number.to_string())
            .header("X-ADMP-Signature", &signature)
            .json(&payload)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => return Ok(()),
            Ok(resp) => last_err = format!("status {}", resp.status()),
            Err(e) => last_err = e.to_string(),
        }
    }

    Err(last_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_schedule_stays_within_three_seconds() {
        let total: u64 = RETRY_DELAYS_MS.iter().sum();
        assert!(total <= 3_000);
    }
}
