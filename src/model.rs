//! Cube data model: coordinates, facts, aggregate records, and the
//! ledger-entry change events the delta engine consumes.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, Row};

use crate::error::CubeError;
use crate::period::{Period, PeriodType};

/// Stable stand-in for "no category". A first-class dimension value: it
/// participates in coordinate identity and in the store's unique index,
/// which NULL would silently break.
pub const UNCATEGORIZED: &str = "__uncategorized__";

/// Display string used when metadata lookup fails or a name is missing.
pub const UNKNOWN_NAME: &str = "Unknown";

pub fn category_key(category_id: Option<&str>) -> String {
    match category_id {
        Some(id) if !id.trim().is_empty() => id.to_string(),
        _ => UNCATEGORIZED.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    Income,
    Expense,
    Transfer,
}

impl EntryType {
    pub fn as_str(self) -> &'static str {
        match self {
            EntryType::Income => "income",
            EntryType::Expense => "expense",
            EntryType::Transfer => "transfer",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "income" => Some(EntryType::Income),
            "expense" => Some(EntryType::Expense),
            "transfer" => Some(EntryType::Transfer),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The 7-tuple identifying at most one aggregate record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Coordinate {
    pub tenant_id: String,
    pub period: Period,
    pub entry_type: EntryType,
    /// Category key; `UNCATEGORIZED` for entries without one.
    pub category_id: String,
    pub account_id: String,
    pub is_recurring: bool,
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}/{}/{}",
            self.tenant_id,
            self.period,
            self.entry_type,
            self.category_id,
            self.account_id,
            self.is_recurring
        )
    }
}

/// The two stored facts. `avg` is always derived on read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facts {
    pub total_amount_cents: i64,
    pub entry_count: i64,
}

impl Facts {
    pub fn is_zero(&self) -> bool {
        self.total_amount_cents == 0 && self.entry_count == 0
    }

    pub fn add(&mut self, other: Facts) {
        self.total_amount_cents += other.total_amount_cents;
        self.entry_count += other.entry_count;
    }

    pub fn avg_amount_cents(&self) -> i64 {
        if self.entry_count == 0 {
            0
        } else {
            self.total_amount_cents / self.entry_count
        }
    }
}

/// One stored cube row: coordinate, denormalized display names, facts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub coordinate: Coordinate,
    /// Display-only; may go stale and is never part of identity.
    pub category_name: String,
    pub account_name: String,
    pub facts: Facts,
    pub created_at: i64,
    pub updated_at: i64,
}

impl AggregateRecord {
    pub fn avg_amount_cents(&self) -> i64 {
        self.facts.avg_amount_cents()
    }
}

fn decode_err(field: &str, detail: impl std::fmt::Display) -> CubeError {
    CubeError::Store(sqlx::Error::Decode(
        format!("aggregate_records.{field}: {detail}").into(),
    ))
}

fn parse_date(field: &str, raw: &str) -> Result<NaiveDate, CubeError> {
    raw.parse::<NaiveDate>()
        .map_err(|e| decode_err(field, format!("{raw:?}: {e}")))
}

impl TryFrom<&SqliteRow> for AggregateRecord {
    type Error = CubeError;

    fn try_from(row: &SqliteRow) -> Result<Self, Self::Error> {
        let period_type_raw: String = row.try_get("period_type").map_err(CubeError::from)?;
        let period_type = PeriodType::parse(&period_type_raw)
            .ok_or_else(|| decode_err("period_type", &period_type_raw))?;
        let period_start_raw: String = row.try_get("period_start").map_err(CubeError::from)?;
        let period_end_raw: String = row.try_get("period_end").map_err(CubeError::from)?;
        let entry_type_raw: String = row.try_get("entry_type").map_err(CubeError::from)?;
        let entry_type = EntryType::parse(&entry_type_raw)
            .ok_or_else(|| decode_err("entry_type", &entry_type_raw))?;

        Ok(AggregateRecord {
            coordinate: Coordinate {
                tenant_id: row.try_get("tenant_id").map_err(CubeError::from)?,
                period: Period {
                    period_type,
                    start: parse_date("period_start", &period_start_raw)?,
                    end: parse_date("period_end", &period_end_raw)?,
                },
                entry_type,
                category_id: row.try_get("category_id").map_err(CubeError::from)?,
                account_id: row.try_get("account_id").map_err(CubeError::from)?,
                is_recurring: row
                    .try_get::<i64, _>("is_recurring")
                    .map(|value| value != 0)
                    .map_err(CubeError::from)?,
            },
            category_name: row.try_get("category_name").map_err(CubeError::from)?,
            account_name: row.try_get("account_name").map_err(CubeError::from)?,
            facts: Facts {
                total_amount_cents: row
                    .try_get("total_amount_cents")
                    .map_err(CubeError::from)?,
                entry_count: row.try_get("entry_count").map_err(CubeError::from)?,
            },
            created_at: row.try_get("created_at").map_err(CubeError::from)?,
            updated_at: row.try_get("updated_at").map_err(CubeError::from)?,
        })
    }
}

/// Partial-key dimension filter. `None` fields match everything; the
/// category field, when present, holds the sentinel key form. Used for
/// slice deletes, scoped rebuilds, and the query read path.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SliceFilter {
    pub entry_type: Option<EntryType>,
    pub category_id: Option<String>,
    pub account_id: Option<String>,
    pub is_recurring: Option<bool>,
}

impl SliceFilter {
    pub fn is_empty(&self) -> bool {
        self.entry_type.is_none()
            && self.category_id.is_none()
            && self.account_id.is_none()
            && self.is_recurring.is_none()
    }

    pub fn matches(&self, entry_type: EntryType, category_id: &str, account_id: &str, is_recurring: bool) -> bool {
        self.entry_type.map_or(true, |t| t == entry_type)
            && self.category_id.as_deref().map_or(true, |c| c == category_id)
            && self.account_id.as_deref().map_or(true, |a| a == account_id)
            && self.is_recurring.map_or(true, |r| r == is_recurring)
    }
}

/// Dimension + fact values of a ledger entry, as carried by change events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryValues {
    pub account_id: String,
    pub category_id: Option<String>,
    pub amount_cents: i64,
    pub entry_date: NaiveDate,
    pub entry_type: EntryType,
    pub is_recurring: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A ledger mutation as delivered to the delta engine. At-least-once
/// delivery; the engine does not require exactly-once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub entry_id: String,
    pub tenant_id: String,
    pub op: ChangeOp,
    pub old_values: Option<EntryValues>,
    pub new_values: Option<EntryValues>,
}

impl ChangeEvent {
    pub fn inserted(entry_id: impl Into<String>, tenant_id: impl Into<String>, new: EntryValues) -> Self {
        ChangeEvent {
            entry_id: entry_id.into(),
            tenant_id: tenant_id.into(),
            op: ChangeOp::Insert,
            old_values: None,
            new_values: Some(new),
        }
    }

    pub fn updated(
        entry_id: impl Into<String>,
        tenant_id: impl Into<String>,
        old: EntryValues,
        new: EntryValues,
    ) -> Self {
        ChangeEvent {
            entry_id: entry_id.into(),
            tenant_id: tenant_id.into(),
            op: ChangeOp::Update,
            old_values: Some(old),
            new_values: Some(new),
        }
    }

    pub fn deleted(entry_id: impl Into<String>, tenant_id: impl Into<String>, old: EntryValues) -> Self {
        ChangeEvent {
            entry_id: entry_id.into(),
            tenant_id: tenant_id.into(),
            op: ChangeOp::Delete,
            old_values: Some(old),
            new_values: None,
        }
    }

    pub fn validate(&self) -> Result<(), CubeError> {
        let invalid = |reason| CubeError::InvalidEvent {
            entry_id: self.entry_id.clone(),
            reason,
        };
        match self.op {
            ChangeOp::Insert => {
                if self.old_values.is_some() {
                    return Err(invalid("insert carries old_values"));
                }
                if self.new_values.is_none() {
                    return Err(invalid("insert missing new_values"));
                }
            }
            ChangeOp::Update => {
                if self.old_values.is_none() || self.new_values.is_none() {
                    return Err(invalid("update requires old_values and new_values"));
                }
            }
            ChangeOp::Delete => {
                if self.new_values.is_some() {
                    return Err(invalid("delete carries new_values"));
                }
                if self.old_values.is_none() {
                    return Err(invalid("delete missing old_values"));
                }
            }
        }
        Ok(())
    }
}
