//! Reconciliation: periodic drift detection and correction.
//!
//! For a rolling window of recent periods, recompute the expected facts
//! from the ledger (read-only shadow pass), diff against the live records,
//! and when they disagree run a corrective rebuild. A discrepancy is the
//! signal this job exists to detect, not a failure of the job itself;
//! repeated discrepancies at the same coordinate across runs point at a
//! delta engine defect and belong to alerting, outside this crate.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use sqlx::SqlitePool;

use crate::config::CubeConfig;
use crate::error::CubeResult;
use crate::locks::PeriodLocks;
use crate::model::{Coordinate, Facts};
use crate::period::{Period, PeriodType};
use crate::time::now_ms;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscrepancySample {
    pub tenant_id: String,
    pub period_type: PeriodType,
    pub period_start: NaiveDate,
    pub coordinate: String,
    pub live: Option<Facts>,
    pub expected: Option<Facts>,
    pub observed_at_ms: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub periods_checked: u64,
    pub discrepancies: u64,
    pub rebuilds: u64,
    pub last: Option<DiscrepancySample>,
}

/// Accumulated totals across all runs, read back from the audit table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub periods_checked: u64,
    pub discrepancies: u64,
    pub rebuilds: u64,
    pub last_coordinate: Option<String>,
    pub last_observed_at_ms: Option<i64>,
}

/// The most recent `window` periods of each type, counting back from (and
/// including) the period containing `as_of`.
pub fn recent_periods(as_of: NaiveDate, window: u32) -> Vec<Period> {
    let mut periods = Vec::new();
    for period_type in PeriodType::ALL {
        let mut period = Period::covering(period_type, as_of);
        for _ in 0..window {
            periods.push(period);
            let previous_day = period.start.pred_opt();
            match previous_day {
                Some(day) => period = Period::covering(period_type, day),
                None => break,
            }
        }
    }
    periods
}

/// First coordinate whose facts differ between live and expected, if any.
/// Either side missing a coordinate present on the other counts.
pub(crate) fn first_diff(
    live: &BTreeMap<Coordinate, Facts>,
    expected: &BTreeMap<Coordinate, Facts>,
) -> Option<(Coordinate, Option<Facts>, Option<Facts>)> {
    for (coord, facts) in live {
        match expected.get(coord) {
            Some(want) if want == facts => {}
            other => return Some((coord.clone(), Some(*facts), other.copied())),
        }
    }
    for (coord, want) in expected {
        if !live.contains_key(coord) {
            return Some((coord.clone(), None, Some(*want)));
        }
    }
    None
}

/// Entry point for the external scheduler.
pub async fn run_reconciliation(
    pool: &SqlitePool,
    cfg: &CubeConfig,
    locks: &PeriodLocks,
    tenant_id: &str,
    window: u32,
    as_of: NaiveDate,
) -> CubeResult<ReconcileOutcome> {
    let mut outcome = ReconcileOutcome::default();

    for period in recent_periods(as_of, window) {
        outcome.periods_checked += 1;

        let expected = crate::rebuild::shadow_compute(pool, tenant_id, &period, None).await?;
        let live = load_live_facts(pool, tenant_id, &period).await?;

        let Some((coordinate, live_facts, expected_facts)) = first_diff(&live, &expected) else {
            continue;
        };

        outcome.discrepancies += 1;
        let sample = DiscrepancySample {
            tenant_id: tenant_id.to_string(),
            period_type: period.period_type,
            period_start: period.start,
            coordinate: coordinate.to_string(),
            live: live_facts,
            expected: expected_facts,
            observed_at_ms: now_ms(),
        };
        log_discrepancy(&sample);

        crate::rebuild::rebuild(pool, cfg, locks, tenant_id, &period, None).await?;
        outcome.rebuilds += 1;
        outcome.last = Some(sample);
    }

    if let Err(err) = persist_outcome(pool, &outcome).await {
        if is_missing_table(&err) {
            tracing::debug!(
                target: "ledgercube",
                event = "reconcile_persist_skipped",
                reason = "missing_table"
            );
        } else {
            tracing::warn!(
                target: "ledgercube",
                event = "reconcile_persist_failed",
                error = %err
            );
        }
    }

    tracing::info!(
        target: "ledgercube",
        event = "reconcile_run_complete",
        tenant_id = %tenant_id,
        periods = outcome.periods_checked,
        discrepancies = outcome.discrepancies,
        rebuilds = outcome.rebuilds
    );

    Ok(outcome)
}

async fn load_live_facts(
    pool: &SqlitePool,
    tenant_id: &str,
    period: &Period,
) -> CubeResult<BTreeMap<Coordinate, Facts>> {
    let mut conn = pool.acquire().await?;
    let records = crate::store::load_period(&mut *conn, tenant_id, period).await?;
    Ok(records
        .into_iter()
        .map(|record| (record.coordinate, record.facts))
        .collect())
}

fn log_discrepancy(sample: &DiscrepancySample) {
    tracing::warn!(
        target: "ledgercube",
        event = "reconcile_discrepancy",
        tenant_id = %sample.tenant_id,
        period_type = %sample.period_type,
        period_start = %sample.period_start,
        coordinate = %sample.coordinate,
        live_amount = ?sample.live.map(|f| f.total_amount_cents),
        live_count = ?sample.live.map(|f| f.entry_count),
        expected_amount = ?sample.expected.map(|f| f.total_amount_cents),
        expected_count = ?sample.expected.map(|f| f.entry_count),
        "live aggregates diverged from ledger; scheduling rebuild"
    );
}

async fn persist_outcome(pool: &SqlitePool, outcome: &ReconcileOutcome) -> Result<(), sqlx::Error> {
    if outcome.periods_checked == 0 && outcome.discrepancies == 0 {
        return Ok(());
    }

    let mut query = sqlx::query(
        "INSERT INTO reconciliation_audit (\
             id, periods_checked, discrepancies, rebuilds,\
             last_tenant_id, last_period_type, last_period_start, last_coordinate,\
             last_live_amount, last_live_count, last_expected_amount, last_expected_count,\
             last_observed_at_ms\
         ) VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)\
         ON CONFLICT(id) DO UPDATE SET \
             periods_checked = reconciliation_audit.periods_checked + excluded.periods_checked,\
             discrepancies = reconciliation_audit.discrepancies + excluded.discrepancies,\
             rebuilds = reconciliation_audit.rebuilds + excluded.rebuilds,\
             last_tenant_id = COALESCE(excluded.last_tenant_id, reconciliation_audit.last_tenant_id),\
             last_period_type = COALESCE(excluded.last_period_type, reconciliation_audit.last_period_type),\
             last_period_start = COALESCE(excluded.last_period_start, reconciliation_audit.last_period_start),\
             last_coordinate = COALESCE(excluded.last_coordinate, reconciliation_audit.last_coordinate),\
             last_live_amount = COALESCE(excluded.last_live_amount, reconciliation_audit.last_live_amount),\
             last_live_count = COALESCE(excluded.last_live_count, reconciliation_audit.last_live_count),\
             last_expected_amount = COALESCE(excluded.last_expected_amount, reconciliation_audit.last_expected_amount),\
             last_expected_count = COALESCE(excluded.last_expected_count, reconciliation_audit.last_expected_count),\
             last_observed_at_ms = COALESCE(excluded.last_observed_at_ms, reconciliation_audit.last_observed_at_ms)",
    )
    .bind(clamp_i64(outcome.periods_checked))
    .bind(clamp_i64(outcome.discrepancies))
    .bind(clamp_i64(outcome.rebuilds));

    if let Some(last) = &outcome.last {
        query = query
            .bind(Some(last.tenant_id.as_str()))
            .bind(Some(last.period_type.as_str()))
            .bind(Some(last.period_start.to_string()))
            .bind(Some(last.coordinate.as_str()))
            .bind(last.live.map(|f| f.total_amount_cents))
            .bind(last.live.map(|f| f.entry_count))
            .bind(last.expected.map(|f| f.total_amount_cents))
            .bind(last.expected.map(|f| f.entry_count))
            .bind(Some(last.observed_at_ms));
    } else {
        query = query
            .bind(Option::<&str>::None)
            .bind(Option::<&str>::None)
            .bind(Option::<String>::None)
            .bind(Option::<&str>::None)
            .bind(Option::<i64>::None)
            .bind(Option::<i64>::None)
            .bind(Option::<i64>::None)
            .bind(Option::<i64>::None)
            .bind(Option::<i64>::None);
    }

    query.execute(pool).await.map(|_| ())
}

pub async fn load_summary(pool: &SqlitePool) -> Result<ReconcileSummary, sqlx::Error> {
    use sqlx::Row;

    let row = match sqlx::query(
        "SELECT periods_checked, discrepancies, rebuilds, last_coordinate, last_observed_at_ms \
         FROM reconciliation_audit WHERE id = 1",
    )
    .fetch_optional(pool)
    .await
    {
        Ok(row) => row,
        Err(err) => {
            if is_missing_table(&err) {
                return Ok(ReconcileSummary::default());
            }
            return Err(err);
        }
    };

    let mut summary = ReconcileSummary::default();
    if let Some(row) = row {
        summary.periods_checked = clamp_u64(row.try_get("periods_checked").unwrap_or(0));
        summary.discrepancies = clamp_u64(row.try_get("discrepancies").unwrap_or(0));
        summary.rebuilds = clamp_u64(row.try_get("rebuilds").unwrap_or(0));
        summary.last_coordinate = row.try_get("last_coordinate").unwrap_or(None);
        summary.last_observed_at_ms = row.try_get("last_observed_at_ms").unwrap_or(None);
    }
    Ok(summary)
}

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn clamp_u64(value: i64) -> u64 {
    if value <= 0 {
        0
    } else {
        value as u64
    }
}

fn is_missing_table(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err)
            if db_err.message().contains("no such table")
                && db_err.message().contains("reconciliation_audit")
    )
}
