//! Read-only boundary to the ledger and metadata collaborators.
//!
//! The cube never writes these tables. Reads are tenant-scoped and skip
//! soft-deleted rows; a soft delete is expected to arrive as a DELETE
//! change event like any other mutation.

use std::collections::{BTreeSet, HashMap};

use chrono::NaiveDate;
use sqlx::{sqlite::SqliteRow, Row, SqliteConnection};

use crate::error::{CubeError, CubeResult};
use crate::model::{category_key, EntryType, SliceFilter, UNCATEGORIZED, UNKNOWN_NAME};
use crate::period::Period;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: String,
    pub tenant_id: String,
    pub account_id: String,
    pub category_id: Option<String>,
    pub entry_type: EntryType,
    pub amount_cents: i64,
    pub entry_date: NaiveDate,
    pub is_recurring: bool,
}

impl TryFrom<&SqliteRow> for LedgerEntry {
    type Error = CubeError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        let entry_type_raw: String = row.try_get("entry_type").map_err(CubeError::from)?;
        let entry_type = EntryType::parse(&entry_type_raw).ok_or_else(|| {
            CubeError::Store(sqlx::Error::Decode(
                format!("ledger_entries.entry_type: {entry_type_raw:?}").into(),
            ))
        })?;
        let date_raw: String = row.try_get("entry_date").map_err(CubeError::from)?;
        let entry_date = date_raw.parse::<NaiveDate>().map_err(|e| {
            CubeError::Store(sqlx::Error::Decode(
                format!("ledger_entries.entry_date: {date_raw:?}: {e}").into(),
            ))
        })?;

        Ok(LedgerEntry {
            id: row.try_get("id").map_err(CubeError::from)?,
            tenant_id: row.try_get("tenant_id").map_err(CubeError::from)?,
            account_id: row.try_get("account_id").map_err(CubeError::from)?,
            category_id: row
                .try_get::<Option<String>, _>("category_id")
                .map_err(CubeError::from)?,
            entry_type,
            amount_cents: row.try_get("amount_cents").map_err(CubeError::from)?,
            entry_date,
            is_recurring: row
                .try_get::<i64, _>("is_recurring")
                .map(|v| v != 0)
                .map_err(CubeError::from)?,
        })
    }
}

impl LedgerEntry {
    /// Category in the sentinel key form used by coordinates.
    pub fn category_key(&self) -> String {
        category_key(self.category_id.as_deref())
    }
}

/// Range read used by the rebuild engine: all live entries for the tenant
/// whose date falls in the period, narrowed by `filter` when given.
pub async fn entries_for_period(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    period: &Period,
    filter: Option<&SliceFilter>,
) -> CubeResult<Vec<LedgerEntry>> {
    let mut sql = String::from(
        "SELECT id, tenant_id, account_id, category_id, entry_type, amount_cents, \
                entry_date, is_recurring \
         FROM ledger_entries \
         WHERE tenant_id = ? AND entry_date >= ? AND entry_date < ? AND deleted_at IS NULL",
    );
    let mut binds: Vec<String> = Vec::new();
    if let Some(filter) = filter {
        if let Some(entry_type) = filter.entry_type {
            sql.push_str(" AND entry_type = ?");
            binds.push(entry_type.as_str().to_string());
        }
        if let Some(category) = &filter.category_id {
            if category == UNCATEGORIZED {
                // Same rule as category_key: NULL and blank both map to the
                // sentinel.
                sql.push_str(" AND (category_id IS NULL OR TRIM(category_id) = '')");
            } else {
                sql.push_str(" AND category_id = ?");
                binds.push(category.clone());
            }
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
    sql.push_str(" ORDER BY entry_date, id");

    let mut query = sqlx::query(&sql)
        .bind(tenant_id)
        .bind(period.start.to_string())
        .bind(period.end.to_string());
    for bind in &binds {
        query = query.bind(bind);
    }

    let rows = query
        .fetch_all(conn)
        .await
        .map_err(|source| CubeError::RebuildRead { source })?;
    rows.iter().map(LedgerEntry::try_from).collect()
}

/// Resolved display names for the denormalized record columns.
#[derive(Debug, Clone, Default)]
pub struct DisplayNames {
    categories: HashMap<String, String>,
    accounts: HashMap<String, String>,
}

impl DisplayNames {
    pub fn category(&self, category_key: &str) -> &str {
        if category_key == UNCATEGORIZED {
            return "Uncategorized";
        }
        self.categories
            .get(category_key)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_NAME)
    }

    pub fn account(&self, account_id: &str) -> &str {
        self.accounts
            .get(account_id)
            .map(String::as_str)
            .unwrap_or(UNKNOWN_NAME)
    }
}

/// Best-effort metadata lookup. A failure here degrades to placeholder
/// names; it must never block aggregate correctness.
pub async fn lookup_display_names(
    conn: &mut SqliteConnection,
    tenant_id: &str,
    category_keys: &BTreeSet<String>,
    account_ids: &BTreeSet<String>,
) -> DisplayNames {
    let mut names = DisplayNames::default();

    for key in category_keys {
        if key == UNCATEGORIZED {
            continue;
        }
        match sqlx::query_scalar::<_, String>(
            "SELECT name FROM categories WHERE tenant_id = ? AND id = ? AND deleted_at IS NULL",
        )
        .bind(tenant_id)
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        {
            Ok(Some(name)) => {
                names.categories.insert(key.clone(), name);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    target: "ledgercube",
                    event = "name_lookup_failed",
                    kind = "category",
                    id = %key,
                    error = %err
                );
            }
        }
    }

    for id in account_ids {
        match sqlx::query_scalar::<_, String>(
            "SELECT name FROM accounts WHERE tenant_id = ? AND id = ? AND deleted_at IS NULL",
        )
        .bind(tenant_id)
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        {
            Ok(Some(name)) => {
                names.accounts.insert(id.clone(), name);
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(
                    target: "ledgercube",
                    event = "name_lookup_failed",
                    kind = "account",
                    id = %id,
                    error = %err
                );
            }
        }
    }

    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_fall_back_to_placeholders() {
        let names = DisplayNames::default();
        assert_eq!(names.category("cat-1"), UNKNOWN_NAME);
        assert_eq!(names.category(UNCATEGORIZED), "Uncategorized");
        assert_eq!(names.account("acct-1"), UNKNOWN_NAME);
    }
}
