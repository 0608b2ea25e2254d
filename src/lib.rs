pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod models;
pub mod rate_limit;
pub mod routes;
pub mod scheduler;
pub mod services;
pub mod storage;

use std::sync::Arc;

use config::HubConfig;
use rate_limit::{RateLimitConfig, RateLimiter};
use rocket_cors::CorsOptions;
use services::agent::AgentService;
use services::group::GroupService;
use services::inbox::InboxService;
use services::round_table::RoundTableService;
use storage::memory::MemoryStorage;
use storage::remote::RemoteStorage;
use storage::Storage;

pub fn rocket() -> rocket::Rocket<rocket::Build> {
    build_rocket(HubConfig::from_env(), RateLimitConfig::from_env())
}

pub fn rocket_with_config(config: HubConfig, rate_config: RateLimitConfig) -> rocket::Rocket<rocket::Build> {
    build_rocket(config, rate_config)
}

fn build_rocket(config: HubConfig, rate_limit_config: RateLimitConfig) -> rocket::Rocket<rocket::Build> {
    let storage: Arc<dyn Storage> = match config.storage_backend {
        config::StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        config::StorageBackend::Remote => {
            let url = config
                .remote_store_url
                .clone()
                .expect("STORAGE_BACKEND=remote requires REMOTE_STORE_URL");
            let app_id = config
                .remote_store_app_id
                .clone()
                .expect("STORAGE_BACKEND=remote requires REMOTE_STORE_APP_ID");
            let api_key = config.remote_store_api_key.clone();
            Arc::new(RemoteStorage::new(&url, &app_id, api_key))
        }
    };

    let agents = Arc::new(AgentService::new(storage.clone(), config.clone()));
    let inbox = Arc::new(InboxService::new(storage.clone(), agents.clone(), config.clone()));
    let groups = Arc::new(GroupService::new(storage.clone(), inbox.clone()));
    let round_tables = Arc::new(RoundTableService::new(
        storage.clone(),
        groups.clone(),
        config.clone(),
    ));

    let rate_limiter = RateLimiter::new();

    let cors = CorsOptions::default()
        .to_cors()
        .expect("Failed to create CORS");

    let cleanup_interval_ms = config.cleanup_interval_ms;
    let round_table_purge_after_hours = config.round_table_purge_after_hours;
    let port = config.port;

    let figment = rocket::Config::figment().merge(("port", port));

    rocket::custom(figment)
        .manage(storage)
        .manage(config)
        .manage(agents.clone())
        .manage(inbox.clone())
        .manage(groups.clone())
        .manage(round_tables.clone())
        .manage(rate_limit_config)
        .manage(rate_limiter)
        .attach(cors)
        .register(
            "/",
            rocket::catchers![
                routes::too_many_requests,
                routes::not_found,
                routes::unauthorized,
                routes::bad_request,
            ],
        )
        .mount(
            "/",
            rocket::routes![
                routes::health,
                routes::stats,
                routes::register_agent,
                routes::get_agent,
                routes::delete_agent,
                routes::heartbeat,
                routes::approve_agent,
                routes::reject_agent,
                routes::list_trusted_agents,
                routes::add_trusted_agent,
                routes::remove_trusted_agent,
                routes::configure_webhook,
                routes::remove_webhook,
                routes::rotate_key,
                routes::send_message,
                routes::pull_message,
                routes::reclaim_inbox,
                routes::ack_message,
                routes::nack_message,
                routes::reply_message,
                routes::get_message_status,
                routes::inbox_stats,
                routes::create_group,
                routes::get_group,
                routes::list_groups,
                routes::delete_group,
                routes::join_group,
                routes::add_group_member,
                routes::leave_group,
                routes::post_group_message,
                routes::get_group_history,
                routes::create_round_table,
                routes::get_round_table,
                routes::list_round_tables,
                routes::speak_round_table,
                routes::resolve_round_table,
                routes::issue_key,
                routes::list_keys,
                routes::revoke_key,
                routes::agent_keys_jwks,
                routes::did_document,
            ],
        )
        .attach(rocket::fairing::AdHoc::on_liftoff(
            "Background Sweeps",
            move |_rocket| {
                Box::pin(async move {
                    scheduler::spawn(
                        inbox,
                        agents,
                        round_tables,
                        groups,
                        cleanup_interval_ms,
                        round_table_purge_after_hours,
                    );
                    println!("🧹 Background sweep scheduler started ({cleanup_interval_ms}ms interval)");
                })
            },
        ))
}
