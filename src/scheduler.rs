//! Background sweep scheduler (§4.3-§4.6, §5): one ticker loop, `cleanup_interval_ms` apart,
//! driving inbox lease reclaim, message TTL expiry, agent offline detection, and round-table
//! expiry/purge. Each sweep runs to completion before the next tick so sweeps never overlap.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::services::agent::AgentService;
use crate::services::group::GroupService;
use crate::services::inbox::InboxService;
use crate::services::round_table::RoundTableService;

const GROUP_HISTORY_PURGE_AFTER_DAYS: i64 = 30;

pub fn spawn(
    inbox: Arc<InboxService>,
    agents: Arc<AgentService>,
    round_tables: Arc<RoundTableService>,
    groups: Arc<GroupService>,
    interval_ms: u64,
    round_table_purge_after_hours: i64,
) {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        loop {
            run_sweep(
                &inbox,
                &agents,
                &round_tables,
                &groups,
                round_table_purge_after_hours,
            )
            .await;
            tokio::time::sleep(Duration::from_millis(interval_ms)).await;
        }
    });
}

async fn run_sweep(
    inbox: &InboxService,
    agents: &AgentService,
    round_tables: &RoundTableService,
    groups: &GroupService,
    round_table_purge_after_hours: i64,
) {
    match inbox.reclaim_expired_leases().await {
        Ok(n) if n > 0 => println!("🔁 reclaimed {n} expired lease(s)"),
        Ok(_) => {}
        Err(e) => eprintln!("⚠️  lease reclaim sweep failed: {e}"),
    }

    match inbox.expire_old_messages().await {
        Ok(n) if n > 0 => println!("⏳ expired {n} message(s) past their TTL"),
        Ok(_) => {}
        Err(e) => eprintln!("⚠️  message expiry sweep failed: {e}"),
    }

    match agents.mark_offline_agents().await {
        Ok(n) if n > 0 => println!("📴 marked {n} agent(s) offline on missed heartbeat"),
        Ok(_) => {}
        Err(e) => eprintln!("⚠️  heartbeat sweep failed: {e}"),
    }

    match round_tables.expire_stale().await {
        Ok(n) if n > 0 => println!("🗓️  expired {n} stale round table(s)"),
        Ok(_) => {}
        Err(e) => eprintln!("⚠️  round table expiry sweep failed: {e}"),
    }

    let rt_cutoff = (Utc::now() - chrono::Duration::hours(round_table_purge_after_hours)).to_rfc3339();
    match round_tables.purge_stale(&rt_cutoff).await {
        Ok(n) if n > 0 => println!("🗑️  purged {n} finished round table(s)"),
        Ok(_) => {}
        Err(e) => eprintln!("⚠️  round table purge sweep failed: {e}"),
    }

    let history_cutoff = (Utc::now() - chrono::Duration::days(GROUP_HISTORY_PURGE_AFTER_DAYS)).to_rfc3339();
    match groups.purge_history_before(&history_cutoff).await {
        Ok(n) if n > 0 => println!("🗑️  purged {n} old group history entries"),
        Ok(_) => {}
        Err(e) => eprintln!("⚠️  group history purge sweep failed: {e}"),
    }
}
