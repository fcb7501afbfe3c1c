//! Aggregate record store.
//!
//! All fact mutation goes through `upsert_increment` (the store's native
//! conditional update, so concurrent writers to one coordinate serialize in
//! SQLite rather than racing a read-modify-write at the application layer)
//! and `delete_if_zero`. The rebuild engine uses
//! `delete_slice` + `insert_records`. `query_totals` is the read path.

use serde_json::{Map, Value};
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection, SqlitePool};

use crate::error::{is_count_check_violation, CubeError, CubeResult};
use crate::model::{AggregateRecord, Coordinate, Facts, SliceFilter};
use crate::period::{Period, PeriodType};
use crate::time::now_ms;

/// Atomic increment of both facts at one coordinate; creates the row on
/// first contribution. Display names are refreshed on every write so stale
/// denormalized strings heal over time.
pub async fn upsert_increment(
    conn: &mut SqliteConnection,
    coord: &Coordinate,
    category_name: &str,
    account_name: &str,
    delta: Facts,
) -> CubeResult<()> {
    let now = now_ms();
    let result = sqlx::query(
        "INSERT INTO aggregate_records (\
             tenant_id, period_type, period_start, period_end, entry_type,\
             category_id, account_id, is_recurring, category_name, account_name,\
             total_amount_cents, entry_count, created_at, updated_at\
         ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)\
         ON CONFLICT(tenant_id, period_type, period_start, entry_type, category_id, account_id, is_recurring)\
         DO UPDATE SET \
             total_amount_cents = aggregate_records.total_amount_cents + excluded.total_amount_cents,\
             entry_count = aggregate_records.entry_count + excluded.entry_count,\
             category_name = excluded.category_name,\
             account_name = excluded.account_name,\
             updated_at = excluded.updated_at",
    )
    .bind(&coord.tenant_id)
    .bind(coord.period.period_type.as_str())
    .bind(coord.period.start.to_string())
    .bind(coord.period.end.to_string())
    .bind(coord.entry_type.as_str())
    .bind(&coord.category_id)
    .bind(&coord.account_id)
    .bind(coord.is_recurring as i64)
    .bind(category_name)
    .bind(account_name)
    .bind(delta.total_amount_cents)
    .bind(delta.entry_count)
    .bind(now)
    .bind(now)
    .execute(conn)
    .await;

    match result {
        Ok(_) => Ok(()),
        Err(err) if is_count_check_violation(&err) => Err(CubeError::NegativeCount {
            coordinate: coord.to_string(),
        }),
        Err(err) => Err(err.into()),
    }
}

/// A zero-count record carries no information and must not persist.
/// Deletes iff the count is exactly 0; a leftover non-zero amount
/// on such a row is drift evidence and gets logged.
pub async fn delete_if_zero(conn: &mut SqliteConnection, coord: &Coordinate) -> CubeResult<()> {
    let leftover: Option<i64> = sqlx::query_scalar(
        "DELETE FROM aggregate_records \
         WHERE tenant_id = ? AND period_type = ? AND period_start = ? AND entry_type = ? \
           AND category_id = ? AND account_id = ? AND is_recurring = ? AND entry_count = 0 \
         RETURNING total_amount_cents",
    )
    .bind(&coord.tenant_id)
    .bind(coord.period.period_type.as_str())
    .bind(coord.period.start.to_string())
    .bind(coord.entry_type.as_str())
    .bind(&coord.category_id)
    .bind(&coord.account_id)
    .bind(coord.is_recurring as i64)
    .fetch_optional(conn)
    .await?;

    if let Some(amount) = leftover {
        if amount != 0 {
            tracing::warn!(
                target: "ledgercube",
                event = "zero_count_nonzero_amount",
                coordinate = %coord,
                amount_cents = amount,
                "removed zero-count record still carried amount"
            );
        }
    }
    Ok(())
}

/// Partial-key delete of a period slice. Used by the rebuild engine to
/// clear a (tenant, period, filter) slice before recomputing it.
pub async fn delete_slice(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    period: &Period,
    filter: Option<&SliceFilter>,
) -> CubeResult<u64> {
    let mut sql = String::from(
        "DELETE FROM aggregate_records \
         WHERE tenant_id = ? AND period_type = ? AND period_start = ?",
    );
    let mut binds: Vec<String> = Vec::new();
    append_filter(&mut sql, &mut binds, filter);

    let mut query = sqlx::query(&sql)
        .bind(tenant_id)
        .bind(period.period_type.as_str())
        .bind(period.start.to_string());
    for bind in &binds {
        query = query.bind(bind);
    }
    let result = query.execute(conn).await?;
    Ok(result.rows_affected())
}

/// Batch insert of freshly computed records. Rows with a zero count are
/// skipped rather than written and immediately cleaned up.
pub async fn insert_records(
    conn: &mut SqliteConnection,
    records: &[AggregateRecord],
) -> CubeResult<()> {
    for record in records {
        if record.facts.entry_count == 0 {
            continue;
        }
        sqlx::query(
            "INSERT INTO aggregate_records (\
                 tenant_id, period_type, period_start, period_end, entry_type,\
                 category_id, account_id, is_recurring, category_name, account_name,\
                 total_amount_cents, entry_count, created_at, updated_at\
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.coordinate.tenant_id)
        .bind(record.coordinate.period.period_type.as_str())
        .bind(record.coordinate.period.start.to_string())
        .bind(record.coordinate.period.end.to_string())
        .bind(record.coordinate.entry_type.as_str())
        .bind(&record.coordinate.category_id)
        .bind(&record.coordinate.account_id)
        .bind(record.coordinate.is_recurring as i64)
        .bind(&record.category_name)
        .bind(&record.account_name)
        .bind(record.facts.total_amount_cents)
        .bind(record.facts.entry_count)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

/// All records for one (tenant, period), in coordinate order.
pub async fn load_period(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    period: &Period,
) -> CubeResult<Vec<AggregateRecord>> {
    let rows = sqlx::query(
        "SELECT tenant_id, period_type, period_start, period_end, entry_type,\
                category_id, account_id, is_recurring, category_name, account_name,\
                total_amount_cents, entry_count, created_at, updated_at \
         FROM aggregate_records \
         WHERE tenant_id = ? AND period_type = ? AND period_start = ? \
         ORDER BY entry_type, category_id, account_id, is_recurring",
    )
    .bind(tenant_id)
    .bind(period.period_type.as_str())
    .bind(period.start.to_string())
    .fetch_all(conn)
    .await?;

    rows.iter().map(AggregateRecord::try_from).collect()
}

/// Group-by dimensions available to the read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    EntryType,
    Category,
    Account,
    Recurring,
    Period,
}

impl Dimension {
    fn group_columns(self) -> &'static [&'static str] {
        match self {
            Dimension::EntryType => &["entry_type"],
            Dimension::Category => &["category_id"],
            Dimension::Account => &["account_id"],
            Dimension::Recurring => &["is_recurring"],
            Dimension::Period => &["period_start", "period_end"],
        }
    }

    fn name_column(self) -> Option<(&'static str, &'static str)> {
        match self {
            Dimension::Category => Some(("category_name", "MAX(category_name)")),
            Dimension::Account => Some(("account_name", "MAX(account_name)")),
            _ => None,
        }
    }
}

/// Read-path query description. Coarser granularities (quarter, year) are
/// obtained by querying MONTHLY rows over the matching date range without
/// grouping by `Period`.
#[derive(Debug, Clone)]
pub struct QuerySpec {
    pub period_type: PeriodType,
    /// Periods with `range_start <= period_start < range_end`.
    pub range_start: chrono::NaiveDate,
    pub range_end: chrono::NaiveDate,
    pub group_by: Vec<Dimension>,
    pub filter: SliceFilter,
}

/// Filtered, grouped totals over aggregate records. Each row carries the
/// grouped dimension values plus `total_amount_cents`, `entry_count`, and
/// the derived `avg_amount_cents`.
pub async fn query_totals(
    pool: &SqlitePool,
    tenant_id: &str,
    spec: &QuerySpec,
) -> CubeResult<Vec<Value>> {
    let mut select_cols: Vec<String> = Vec::new();
    let mut group_cols: Vec<&'static str> = Vec::new();
    for dim in &spec.group_by {
        for col in dim.group_columns() {
            select_cols.push((*col).to_string());
            group_cols.push(col);
        }
        if let Some((alias, expr)) = dim.name_column() {
            select_cols.push(format!("{expr} AS {alias}"));
        }
    }
    select_cols.push("SUM(total_amount_cents) AS total_amount_cents".into());
    select_cols.push("SUM(entry_count) AS entry_count".into());

    let mut sql = format!(
        "SELECT {} FROM aggregate_records \
         WHERE tenant_id = ? AND period_type = ? AND period_start >= ? AND period_start < ?",
        select_cols.join(", ")
    );
    let mut binds: Vec<String> = Vec::new();
    append_filter(&mut sql, &mut binds, Some(&spec.filter));
    if !group_cols.is_empty() {
        sql.push_str(" GROUP BY ");
        sql.push_str(&group_cols.join(", "));
        sql.push_str(" ORDER BY ");
        sql.push_str(&group_cols.join(", "));
    }

    let mut query = sqlx::query(&sql)
        .bind(tenant_id)
        .bind(spec.period_type.as_str())
        .bind(spec.range_start.to_string())
        .bind(spec.range_end.to_string());
    for bind in &binds {
        query = query.bind(bind);
    }

    let rows = query.fetch_all(pool).await?;
    Ok(rows.iter().map(total_row_to_value).collect())
}

fn total_row_to_value(row: &SqliteRow) -> Value {
    use sqlx::{Column, TypeInfo, ValueRef};

    let mut map = Map::new();
    for col in row.columns() {
        let idx = col.ordinal();
        let val = match row.try_get_raw(idx).ok() {
            Some(raw) if !raw.is_null() => match raw.type_info().name() {
                "INTEGER" => row
                    .try_get::<i64, _>(idx)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
                "REAL" => row
                    .try_get::<f64, _>(idx)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
                _ => row
                    .try_get::<String, _>(idx)
                    .map(Value::from)
                    .unwrap_or(Value::Null),
            },
            _ => Value::Null,
        };
        map.insert(col.name().to_string(), val);
    }

    let total = map
        .get("total_amount_cents")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let count = map.get("entry_count").and_then(Value::as_i64).unwrap_or(0);
    let avg = if count == 0 { 0 } else { total / count };
    map.insert("avg_amount_cents".into(), Value::from(avg));
    Value::Object(map)
}

fn append_filter(sql: &mut String, binds: &mut Vec<String>, filter: Option<&SliceFilter>) {
    let Some(filter) = filter else {
        return;
    };
    if let Some(entry_type) = filter.entry_type {
        sql.push_str(" AND entry_type = ?");
        binds.push(entry_type.as_str().to_string());
    }
    if let Some(category) = &filter.category_id {
        sql.push_str(" AND category_id = ?");
        binds.push(category.clone());
    }
    if let Some(account) = &filter.account_id {
        sql.push_str(" AND account_id = ?");
        binds.push(account.clone());
    }
    if let Some(recurring) = filter.is_recurring {
        sql.push_str(" AND is_recurring = ?");
        binds.push(if recurring { "1".into() } else { "0".into() });
    }
}
