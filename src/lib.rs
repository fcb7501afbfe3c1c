//! ledgercube: a pre-aggregated, multi-dimensional summary of
//! financial-transaction activity, kept continuously consistent with a
//! mutable SQLite ledger without full rescans.
//!
//! The ledger mutation path feeds change events into [`Cube::apply_events`]
//! (or [`Cube::apply_bulk_change`] for uniform mass edits); reporting reads
//! come from [`Cube::query_totals`]; [`Cube::run_reconciliation`] repairs
//! drift out-of-band.

pub mod bulk;
pub mod config;
pub mod db;
pub mod delta;
pub mod error;
pub mod ledger;
pub mod locks;
pub mod logging;
pub mod migrate;
pub mod model;
pub mod period;
pub mod rebuild;
pub mod reconcile;
pub mod state;
pub mod store;
mod time;

pub use bulk::{BulkChange, BulkSummary, DimensionChange};
pub use config::CubeConfig;
pub use delta::DeltaSummary;
pub use error::{CubeError, CubeResult};
pub use model::{
    category_key, AggregateRecord, ChangeEvent, ChangeOp, Coordinate, EntryType, EntryValues,
    Facts, SliceFilter, UNCATEGORIZED,
};
pub use period::{distinct_periods, periods_covering, periods_in_range, Period, PeriodType};
pub use rebuild::RebuildStats;
pub use reconcile::{ReconcileOutcome, ReconcileSummary};
pub use state::Cube;
pub use store::{Dimension, QuerySpec};
