use std::sync::Arc;

use chrono::NaiveDate;
use serde_json::Value;
use sqlx::SqlitePool;

use crate::bulk::{self, BulkChange, BulkSummary};
use crate::config::CubeConfig;
use crate::delta::{self, DeltaSummary};
use crate::error::CubeResult;
use crate::locks::PeriodLocks;
use crate::model::{ChangeEvent, SliceFilter};
use crate::period::Period;
use crate::rebuild::{self, RebuildStats};
use crate::reconcile::{self, ReconcileOutcome, ReconcileSummary};
use crate::store::{self, QuerySpec};

/// Handle owning the pool, config, and period locks. One `Cube` per
/// database; clones share the lock map, which is what keeps concurrent
/// delta and rebuild work on the same period mutually exclusive.
#[derive(Clone)]
pub struct Cube {
    pool: SqlitePool,
    config: CubeConfig,
    locks: Arc<PeriodLocks>,
}

impl Cube {
    pub fn new(pool: SqlitePool, config: CubeConfig) -> Self {
        Cube {
            pool,
            config,
            locks: Arc::new(PeriodLocks::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &CubeConfig {
        &self.config
    }

    /// Per-entry path: apply a batch of ledger change events.
    pub async fn apply_events(&self, events: &[ChangeEvent]) -> CubeResult<DeltaSummary> {
        delta::apply_events(&self.pool, &self.config, &self.locks, events).await
    }

    /// Whether a uniform batch of this size should take the bulk path.
    pub fn should_use_bulk(&self, batch_len: usize) -> bool {
        bulk::should_use_bulk(&self.config, batch_len)
    }

    /// Mass-edit path: regenerate the slices touched by a uniform change.
    pub async fn apply_bulk_change(&self, change: &BulkChange) -> CubeResult<BulkSummary> {
        bulk::apply_bulk_change(&self.pool, &self.config, &self.locks, change).await
    }

    /// Recompute one (tenant, period) slice from the ledger.
    pub async fn rebuild_period(
        &self,
        tenant_id: &str,
        period: &Period,
        filter: Option<&SliceFilter>,
    ) -> CubeResult<RebuildStats> {
        rebuild::rebuild(&self.pool, &self.config, &self.locks, tenant_id, period, filter).await
    }

    /// Scheduler entry point: check recent periods for drift and repair.
    pub async fn run_reconciliation(
        &self,
        tenant_id: &str,
        window: u32,
        as_of: NaiveDate,
    ) -> CubeResult<ReconcileOutcome> {
        reconcile::run_reconciliation(
            &self.pool,
            &self.config,
            &self.locks,
            tenant_id,
            window,
            as_of,
        )
        .await
    }

    /// As [`Cube::run_reconciliation`], with the window taken from
    /// [`CubeConfig::reconcile_window`].
    pub async fn run_reconciliation_default(
        &self,
        tenant_id: &str,
        as_of: NaiveDate,
    ) -> CubeResult<ReconcileOutcome> {
        self.run_reconciliation(tenant_id, self.config.reconcile_window, as_of)
            .await
    }

    pub async fn reconciliation_summary(&self) -> Result<ReconcileSummary, sqlx::Error> {
        reconcile::load_summary(&self.pool).await
    }

    /// Read path for downstream reporting consumers.
    pub async fn query_totals(&self, tenant_id: &str, spec: &QuerySpec) -> CubeResult<Vec<Value>> {
        store::query_totals(&self.pool, tenant_id, spec).await
    }
}
