//! Delta engine: apply ledger-entry change events with the minimum
//! necessary writes.
//!
//! Contributions are derived per event (subtract old values, add new
//! values, across both period types), netted per coordinate, and applied in
//! one transaction per batch. Transient store failures retry with bounded
//! backoff; a negative entry count or exhausted retries
//! escalate to a full rebuild of every affected (tenant, period).

use std::collections::{BTreeMap, BTreeSet};

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::CubeConfig;
use crate::error::{CubeError, CubeResult};
use crate::ledger::{self, DisplayNames};
use crate::locks::{LockKey, PeriodLocks};
use crate::model::{category_key, ChangeEvent, Coordinate, EntryValues, Facts};
use crate::period::{periods_covering, Period};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaSummary {
    pub batch_id: Uuid,
    pub events: usize,
    pub coordinates_written: usize,
    pub attempts: u32,
    pub escalated_periods: usize,
}

/// Derive and net all contributions for a batch. Pure; this is the step
/// that collapses a description-only update into no write at all, and a
/// same-coordinate amount change into a single delta.
pub fn net_contributions(events: &[ChangeEvent]) -> CubeResult<BTreeMap<Coordinate, Facts>> {
    let mut net: BTreeMap<Coordinate, Facts> = BTreeMap::new();
    for event in events {
        event.validate()?;
        if let Some(old) = &event.old_values {
            accumulate(&mut net, &event.tenant_id, old, -1);
        }
        if let Some(new) = &event.new_values {
            accumulate(&mut net, &event.tenant_id, new, 1);
        }
    }
    net.retain(|_, facts| !facts.is_zero());
    Ok(net)
}

fn accumulate(
    net: &mut BTreeMap<Coordinate, Facts>,
    tenant_id: &str,
    values: &EntryValues,
    sign: i64,
) {
    for period in periods_covering(values.entry_date) {
        let coord = Coordinate {
            tenant_id: tenant_id.to_string(),
            period,
            entry_type: values.entry_type,
            category_id: category_key(values.category_id.as_deref()),
            account_id: values.account_id.clone(),
            is_recurring: values.is_recurring,
        };
        net.entry(coord).or_default().add(Facts {
            total_amount_cents: sign * values.amount_cents,
            entry_count: sign,
        });
    }
}

/// Apply a batch of change events. All writes land in one transaction or
/// none do; the affected periods stay locked against concurrent rebuilds
/// for the whole unit, including any escalation.
pub async fn apply_events(
    pool: &SqlitePool,
    cfg: &CubeConfig,
    locks: &PeriodLocks,
    events: &[ChangeEvent],
) -> CubeResult<DeltaSummary> {
    let batch_id = Uuid::new_v4();
    let net = net_contributions(events)?;
    if net.is_empty() {
        tracing::debug!(
            target: "ledgercube",
            event = "delta_batch_empty",
            batch_id = %batch_id,
            events = events.len()
        );
        return Ok(DeltaSummary {
            batch_id,
            events: events.len(),
            coordinates_written: 0,
            attempts: 0,
            escalated_periods: 0,
        });
    }

    let affected: BTreeSet<(String, Period)> = net
        .keys()
        .map(|coord| (coord.tenant_id.clone(), coord.period))
        .collect();
    let _guards = locks
        .acquire_all(
            affected
                .iter()
                .map(|(tenant, period)| LockKey::new(tenant, period)),
        )
        .await;

    let names = batch_display_names(pool, &net).await?;

    let mut attempt = 0u32;
    let escalate_cause: CubeError = loop {
        attempt += 1;
        match apply_once(pool, &net, &names).await {
            Ok(()) => {
                tracing::info!(
                    target: "ledgercube",
                    event = "delta_batch_applied",
                    batch_id = %batch_id,
                    events = events.len(),
                    coordinates = net.len(),
                    attempt
                );
                return Ok(DeltaSummary {
                    batch_id,
                    events: events.len(),
                    coordinates_written: net.len(),
                    attempts: attempt,
                    escalated_periods: 0,
                });
            }
            Err(err @ CubeError::NegativeCount { .. }) => {
                // Drift between cube and ledger; never clamped.
                tracing::error!(
                    target: "ledgercube",
                    event = "delta_negative_count",
                    batch_id = %batch_id,
                    code = err.code(),
                    error = %err,
                    batch = %summarize_batch(events)
                );
                break err;
            }
            Err(err) if err.is_transient() && attempt < cfg.max_apply_attempts => {
                tracing::warn!(
                    target: "ledgercube",
                    event = "delta_batch_retry",
                    batch_id = %batch_id,
                    attempt,
                    error = %err
                );
                tokio::time::sleep(cfg.backoff_delay(attempt)).await;
            }
            Err(err) => {
                tracing::error!(
                    target: "ledgercube",
                    event = "delta_batch_failed",
                    batch_id = %batch_id,
                    code = err.code(),
                    attempt,
                    error = %err
                );
                break err;
            }
        }
    };

    // Fallback: recompute every affected period from the ledger. The locks
    // acquired above are still held, so no concurrent delta interleaves.
    tracing::warn!(
        target: "ledgercube",
        event = "delta_escalate_rebuild",
        batch_id = %batch_id,
        periods = affected.len(),
        cause = escalate_cause.code()
    );
    for (tenant_id, period) in &affected {
        crate::rebuild::rebuild_unlocked(pool, cfg, tenant_id, period, None)
            .await
            .map_err(|err| CubeError::RetriesExhausted {
                attempts: attempt,
                source: Box::new(err),
            })?;
    }

    Ok(DeltaSummary {
        batch_id,
        events: events.len(),
        coordinates_written: 0,
        attempts: attempt,
        escalated_periods: affected.len(),
    })
}

async fn apply_once(
    pool: &SqlitePool,
    net: &BTreeMap<Coordinate, Facts>,
    names: &BTreeMap<String, DisplayNames>,
) -> CubeResult<()> {
    let mut tx = pool.begin().await?;
    for (coord, delta) in net {
        let tenant_names = names.get(&coord.tenant_id);
        let category_name = tenant_names
            .map(|n| n.category(&coord.category_id))
            .unwrap_or(crate::model::UNKNOWN_NAME);
        let account_name = tenant_names
            .map(|n| n.account(&coord.account_id))
            .unwrap_or(crate::model::UNKNOWN_NAME);
        crate::store::upsert_increment(&mut *tx, coord, category_name, account_name, *delta)
            .await?;
        crate::store::delete_if_zero(&mut *tx, coord).await?;
    }
    tx.commit().await.map_err(CubeError::from)
}

async fn batch_display_names(
    pool: &SqlitePool,
    net: &BTreeMap<Coordinate, Facts>,
) -> CubeResult<BTreeMap<String, DisplayNames>> {
    let mut by_tenant: BTreeMap<String, (BTreeSet<String>, BTreeSet<String>)> = BTreeMap::new();
    for coord in net.keys() {
        let (categories, accounts) = by_tenant.entry(coord.tenant_id.clone()).or_default();
        categories.insert(coord.category_id.clone());
        accounts.insert(coord.account_id.clone());
    }

    let mut conn = pool.acquire().await?;
    let mut names = BTreeMap::new();
    for (tenant_id, (categories, accounts)) in &by_tenant {
        let resolved =
            ledger::lookup_display_names(&mut *conn, tenant_id, categories, accounts).await;
        names.insert(tenant_id.clone(), resolved);
    }
    Ok(names)
}

fn summarize_batch(events: &[ChangeEvent]) -> String {
    let ids: Vec<&str> = events.iter().map(|e| e.entry_id.as_str()).take(20).collect();
    format!("{} events: [{}]", events.len(), ids.join(", "))
}
