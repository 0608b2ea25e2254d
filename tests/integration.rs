use admp_hub::config::HubConfig;
use admp_hub::crypto;
use admp_hub::rate_limit::RateLimitConfig;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use ed25519_dalek::SigningKey;
use rocket::http::{ContentType, Status};
use rocket::local::blocking::Client;

fn test_client() -> Client {
    let rocket = admp_hub::rocket_with_config(HubConfig::default(), RateLimitConfig::default());
    Client::tracked(rocket).expect("valid rocket instance")
}

fn register_legacy(client: &Client, agent_id: &str) -> serde_json::Value {
    let res = client
        .post("/api/agents/register")
        .header(ContentType::JSON)
        .body(format!(
            r#"{{"agent_id": "{agent_id}", "agent_type": "worker", "mode": "legacy"}}"#
        ))
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    res.into_json().unwrap()
}

fn signed_envelope(
    priv_key_b64: &str,
    id: &str,
    from: &str,
    to: &str,
    subject: &str,
) -> serde_json::Value {
    let key_bytes = B64.decode(priv_key_b64).unwrap();
    let key_bytes: [u8; 32] = key_bytes.try_into().unwrap();
    let key = SigningKey::from_bytes(&key_bytes);
    let body = serde_json::json!({"hello": "world"});
    let ts = chrono::Utc::now().to_rfc3339();
    let sig = crypto::sign_envelope(&key, &ts, &body, from, to, None).unwrap();
    serde_json::json!({
        "version": "1.0",
        "id": id,
        "type": "task",
        "from": from,
        "to": to,
        "subject": subject,
        "body": body,
        "timestamp": ts,
        "signature": {"alg": "ed25519", "kid": "v1", "sig": sig},
    })
}

// --- System ---

#[test]
fn health_and_stats() {
    let client = test_client();
    let res = client.get("/health").dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert_eq!(body["service"], "admp-hub");

    let res = client.get("/api/stats").dispatch();
    assert_eq!(res.status(), Status::Ok);
}

// --- Agent registration and heartbeat ---

#[test]
fn register_agent_and_heartbeat() {
    let client = test_client();
    let body = register_legacy(&client, "agent://alice");
    assert_eq!(body["agent"]["agent_id"], "agent://alice");
    assert!(body["private_key_b64"].is_string());

    let res = client
        .post("/api/agents/agent://alice/heartbeat")
        .header(ContentType::JSON)
        .body("{}")
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let agent: serde_json::Value = res.into_json().unwrap();
    assert_eq!(agent["heartbeat"]["status"], "online");
}

#[test]
fn duplicate_registration_conflicts() {
    let client = test_client();
    register_legacy(&client, "agent://dup");
    let res = client
        .post("/api/agents/register")
        .header(ContentType::JSON)
        .body(r#"{"agent_id": "agent://dup", "agent_type": "worker", "mode": "legacy"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Conflict);
}

// --- Inbox send / pull / ack ---

#[test]
fn send_pull_ack_round_trip() {
    let client = test_client();
    let sender = register_legacy(&client, "agent://sender");
    register_legacy(&client, "agent://recipient");
    let priv_key = sender["private_key_b64"].as_str().unwrap();

    let envelope = signed_envelope(priv_key, "msg-1", "agent://sender", "agent://recipient", "ping");
    let res = client
        .post("/api/agents/agent://sender/messages")
        .header(ContentType::JSON)
        .body(envelope.to_string())
        .dispatch();
    assert_eq!(res.status(), Status::Created);
    let record: serde_json::Value = res.into_json().unwrap();
    assert_eq!(record["status"], "queued");

    let res = client
        .post("/api/agents/agent://recipient/inbox/pull")
        .header(ContentType::JSON)
        .body("{}")
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let leased: serde_json::Value = res.into_json().unwrap();
    assert_eq!(leased["status"], "leased");
    assert_eq!(leased["id"], "msg-1");

    let res = client
        .post("/api/agents/agent://recipient/messages/msg-1/ack")
        .header(ContentType::JSON)
        .body("{}")
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let acked: serde_json::Value = res.into_json().unwrap();
    assert_eq!(acked["status"], "acked");
}

#[test]
fn send_rejects_tampered_body() {
    let client = test_client();
    let sender = register_legacy(&client, "agent://sender2");
    register_legacy(&client, "agent://recipient2");
    let priv_key = sender["private_key_b64"].as_str().unwrap();

    let mut envelope = signed_envelope(priv_key, "msg-2", "agent://sender2", "agent://recipient2", "ping");
    envelope["body"] = serde_json::json!({"tampered": true});

    let res = client
        .post("/api/agents/agent://sender2/messages")
        .header(ContentType::JSON)
        .body(envelope.to_string())
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

#[test]
fn pull_is_exclusive_between_two_callers() {
    let client = test_client();
    let sender = register_legacy(&client, "agent://sender3");
    register_legacy(&client, "agent://recipient3");
    let priv_key = sender["private_key_b64"].as_str().unwrap();

    let envelope = signed_envelope(priv_key, "msg-3", "agent://sender3", "agent://recipient3", "ping");
    client
        .post("/api/agents/agent://sender3/messages")
        .header(ContentType::JSON)
        .body(envelope.to_string())
        .dispatch();

    let first = client
        .post("/api/agents/agent://recipient3/inbox/pull")
        .header(ContentType::JSON)
        .body("{}")
        .dispatch();
    let first_body: serde_json::Value = first.into_json().unwrap();
    assert!(!first_body.is_null());

    let second = client
        .post("/api/agents/agent://recipient3/inbox/pull")
        .header(ContentType::JSON)
        .body("{}")
        .dispatch();
    let second_body: serde_json::Value = second.into_json().unwrap();
    assert!(second_body.is_null());
}

// --- Groups ---

#[test]
fn group_post_fans_out_to_members() {
    let client = test_client();
    register_legacy(&client, "agent://owner");
    register_legacy(&client, "agent://member1");

    let res = client
        .post("/api/groups")
        .header(ContentType::JSON)
        .body(r#"{"name": "ops", "creator": "agent://owner", "access": "open"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let group: serde_json::Value = res.into_json().unwrap();
    let group_id = group["id"].as_str().unwrap();

    let res = client
        .post(format!("/api/groups/{group_id}/join"))
        .header(ContentType::JSON)
        .body(r#"{"agent_id": "agent://member1"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post(format!("/api/groups/{group_id}/messages"))
        .header(ContentType::JSON)
        .body(r#"{"sender": "agent://owner", "subject": "status", "body": {"text": "all good"}}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post("/api/agents/agent://member1/inbox/pull")
        .header(ContentType::JSON)
        .body("{}")
        .dispatch();
    let leased: serde_json::Value = res.into_json().unwrap();
    assert_eq!(leased["envelope"]["subject"], "status");
}

// --- Round tables ---

#[test]
fn round_table_enrollment_and_resolution() {
    let client = test_client();
    register_legacy(&client, "agent://facilitator");
    register_legacy(&client, "agent://panelist1");
    register_legacy(&client, "agent://panelist2");

    let res = client
        .post("/api/round-tables")
        .header(ContentType::JSON)
        .body(
            r#"{"topic": "release plan", "goal": "decide", "facilitator": "agent://facilitator",
                "invitees": ["agent://panelist1", "agent://panelist2"]}"#,
        )
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let table: serde_json::Value = res.into_json().unwrap();
    let id = table["id"].as_str().unwrap();
    let participants = table["participants"].as_array().unwrap();
    assert_eq!(participants.len(), 2);

    let res = client
        .post(format!("/api/round-tables/{id}/speak"))
        .header(ContentType::JSON)
        .body(r#"{"from": "agent://panelist1", "message": "I propose next Tuesday"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);

    let res = client
        .post(format!("/api/round-tables/{id}/resolve"))
        .header(ContentType::JSON)
        .body(r#"{"requester": "agent://facilitator", "outcome": "decided", "decision": "Tuesday"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let resolved: serde_json::Value = res.into_json().unwrap();
    assert_eq!(resolved["status"], "resolved");
    assert_eq!(resolved["decision"], "Tuesday");
}

#[test]
fn non_participant_cannot_speak_at_round_table() {
    let client = test_client();
    register_legacy(&client, "agent://facilitator2");
    register_legacy(&client, "agent://outsider");

    let res = client
        .post("/api/round-tables")
        .header(ContentType::JSON)
        .body(
            r#"{"topic": "budget", "goal": "decide", "facilitator": "agent://facilitator2",
                "invitees": []}"#,
        )
        .dispatch();
    let table: serde_json::Value = res.into_json().unwrap();
    let id = table["id"].as_str().unwrap();

    let res = client
        .post(format!("/api/round-tables/{id}/speak"))
        .header(ContentType::JSON)
        .body(r#"{"from": "agent://outsider", "message": "let me in"}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Forbidden);
}

// --- Master-key gated issued keys ---

#[test]
fn issuing_keys_requires_master_key() {
    let config = HubConfig {
        api_key_required: true,
        master_api_key: Some("super-secret".into()),
        ..HubConfig::default()
    };
    let rocket = admp_hub::rocket_with_config(config, RateLimitConfig::default());
    let client = Client::tracked(rocket).expect("valid rocket instance");

    let res = client
        .post("/api/keys")
        .header(ContentType::JSON)
        .body(r#"{"client_id": "ci", "description": "ci runner", "single_use": false}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Unauthorized);

    let res = client
        .post("/api/keys")
        .header(ContentType::JSON)
        .header(rocket::http::Header::new("Authorization", "Bearer super-secret"))
        .body(r#"{"client_id": "ci", "description": "ci runner", "single_use": false}"#)
        .dispatch();
    assert_eq!(res.status(), Status::Ok);
    let body: serde_json::Value = res.into_json().unwrap();
    assert!(body["raw_key"].is_string());
}

// --- Not found ---

#[test]
fn unknown_agent_is_not_found() {
    let client = test_client();
    let res = client.get("/api/agents/agent://ghost").dispatch();
    assert_eq!(res.status(), Status::NotFound);
}
