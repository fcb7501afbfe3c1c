//! Rebuild engine: make an aggregate slice exactly correct by discarding
//! it and recomputing from the ledger.
//!
//! Used for initial population, the bulk optimizer's regeneration step, and
//! the delta engine's failure fallback. Delete and recompute run inside one
//! transaction per (tenant, period), so queries never observe a partially
//! rebuilt period.

use std::collections::{BTreeMap, BTreeSet};

use sqlx::SqlitePool;

use crate::config::CubeConfig;
use crate::error::{CubeError, CubeResult};
use crate::ledger::{self, LedgerEntry};
use crate::locks::{LockKey, PeriodLocks};
use crate::model::{AggregateRecord, Coordinate, Facts, SliceFilter};
use crate::period::Period;
use crate::time::now_ms;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildStats {
    pub records_deleted: u64,
    pub records_inserted: usize,
    pub entries_read: usize,
}

/// Pure grouping step shared by rebuild and the reconciliation shadow path,
/// so the two can never disagree about how entries aggregate.
pub fn aggregate_entries(
    tenant_id: &str,
    period: &Period,
    entries: &[LedgerEntry],
) -> BTreeMap<Coordinate, Facts> {
    let mut groups: BTreeMap<Coordinate, Facts> = BTreeMap::new();
    for entry in entries {
        let coord = Coordinate {
            tenant_id: tenant_id.to_string(),
            period: *period,
            entry_type: entry.entry_type,
            category_id: entry.category_key(),
            account_id: entry.account_id.clone(),
            is_recurring: entry.is_recurring,
        };
        let facts = groups.entry(coord).or_default();
        facts.add(Facts {
            total_amount_cents: entry.amount_cents,
            entry_count: 1,
        });
    }
    groups
}

/// Read-only recompute of a period's expected facts, straight from the
/// ledger. The reconciliation service diffs this against live records.
pub async fn shadow_compute(
    pool: &SqlitePool,
    tenant_id: &str,
    period: &Period,
    filter: Option<&SliceFilter>,
) -> CubeResult<BTreeMap<Coordinate, Facts>> {
    let mut conn = pool.acquire().await?;
    let entries = ledger::entries_for_period(&mut *conn, tenant_id, period, filter).await?;
    Ok(aggregate_entries(tenant_id, period, &entries))
}

/// Rebuild one (tenant, period) slice. Takes the period lock, then retries
/// transient failures with backoff; a ledger read failure aborts with the
/// transaction rolled back, leaving the previous records in place.
pub async fn rebuild(
    pool: &SqlitePool,
    cfg: &CubeConfig,
    locks: &PeriodLocks,
    tenant_id: &str,
    period: &Period,
    filter: Option<&SliceFilter>,
) -> CubeResult<RebuildStats> {
    let _guard = locks.acquire(&LockKey::new(tenant_id, period)).await;
    rebuild_unlocked(pool, cfg, tenant_id, period, filter).await
}

/// Rebuild with the period lock already held by the caller (delta
/// escalation and the bulk optimizer hold their locks across several
/// slices).
pub(crate) async fn rebuild_unlocked(
    pool: &SqlitePool,
    cfg: &CubeConfig,
    tenant_id: &str,
    period: &Period,
    filter: Option<&SliceFilter>,
) -> CubeResult<RebuildStats> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match rebuild_once(pool, tenant_id, period, filter).await {
            Ok(stats) => {
                tracing::info!(
                    target: "ledgercube",
                    event = "rebuild_complete",
                    tenant_id = %tenant_id,
                    period = %period,
                    scoped = filter.is_some(),
                    deleted = stats.records_deleted,
                    inserted = stats.records_inserted,
                    entries = stats.entries_read,
                    attempt
                );
                return Ok(stats);
            }
            Err(err) if err.is_transient() && attempt < cfg.max_apply_attempts => {
                tracing::warn!(
                    target: "ledgercube",
                    event = "rebuild_retry",
                    tenant_id = %tenant_id,
                    period = %period,
                    attempt,
                    error = %err
                );
                tokio::time::sleep(cfg.backoff_delay(attempt)).await;
            }
            Err(err) => {
                tracing::error!(
                    target: "ledgercube",
                    event = "rebuild_failed",
                    tenant_id = %tenant_id,
                    period = %period,
                    code = err.code(),
                    attempt,
                    error = %err
                );
                return Err(err);
            }
        }
    }
}

async fn rebuild_once(
    pool: &SqlitePool,
    tenant_id: &str,
    period: &Period,
    filter: Option<&SliceFilter>,
) -> CubeResult<RebuildStats> {
    let mut tx = pool.begin().await?;

    let records_deleted = crate::store::delete_slice(&mut *tx, tenant_id, period, filter).await?;
    let entries = ledger::entries_for_period(&mut *tx, tenant_id, period, filter).await?;
    let groups = aggregate_entries(tenant_id, period, &entries);

    let mut category_keys: BTreeSet<String> = BTreeSet::new();
    let mut account_ids: BTreeSet<String> = BTreeSet::new();
    for coord in groups.keys() {
        category_keys.insert(coord.category_id.clone());
        account_ids.insert(coord.account_id.clone());
    }
    let names =
        ledger::lookup_display_names(&mut *tx, tenant_id, &category_keys, &account_ids).await;

    let now = now_ms();
    let records: Vec<AggregateRecord> = groups
        .into_iter()
        .map(|(coordinate, facts)| AggregateRecord {
            category_name: names.category(&coordinate.category_id).to_string(),
            account_name: names.account(&coordinate.account_id).to_string(),
            coordinate,
            facts,
            created_at: now,
            updated_at: now,
        })
        .collect();

    crate::store::insert_records(&mut *tx, &records).await?;
    tx.commit().await.map_err(CubeError::from)?;

    Ok(RebuildStats {
        records_deleted,
        records_inserted: records.len(),
        entries_read: entries.len(),
    })
}
