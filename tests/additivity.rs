//! Property checks: after an arbitrary sequence of insert/update/delete
//! events, the cube equals a from-scratch aggregation of the surviving
//! entries, carries no zero-count rows, and a full rebuild changes nothing.

use std::collections::{BTreeMap, HashMap};

use chrono::{Duration, NaiveDate};
use proptest::prelude::*;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tempfile::tempdir;

use ledgercube::{
    category_key, periods_covering, periods_in_range, ChangeEvent, Cube, CubeConfig, EntryType,
    EntryValues,
};

const CATEGORIES: [Option<&str>; 3] = [Some("cat-a"), Some("cat-b"), None];

#[derive(Debug, Clone)]
struct Op {
    slot: usize,
    kind: u8,
    amount: i64,
    day_offset: i64,
    category: usize,
}

fn op_strategy() -> impl Strategy<Value = Vec<Op>> {
    prop::collection::vec(
        (0usize..4, 0u8..3, 1i64..500, 0i64..59, 0usize..3).prop_map(
            |(slot, kind, amount, day_offset, category)| Op {
                slot,
                kind,
                amount,
                day_offset,
                category,
            },
        ),
        1..12,
    )
}

fn entry_values(op: &Op) -> EntryValues {
    let day = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap() + Duration::days(op.day_offset);
    EntryValues {
        account_id: "acct-a".into(),
        category_id: CATEGORIES[op.category].map(str::to_string),
        amount_cents: op.amount,
        entry_date: day,
        entry_type: EntryType::Expense,
        is_recurring: false,
    }
}

type FactKey = (String, String, String);

/// Expected (amount, count) per (period_type, period_start, category) from
/// the entries that survived the op sequence.
fn expected_facts(model: &HashMap<String, EntryValues>) -> BTreeMap<FactKey, (i64, i64)> {
    let mut expected = BTreeMap::new();
    for values in model.values() {
        for period in periods_covering(values.entry_date) {
            let key = (
                period.period_type.as_str().to_string(),
                period.start.to_string(),
                category_key(values.category_id.as_deref()),
            );
            let slot = expected.entry(key).or_insert((0i64, 0i64));
            slot.0 += values.amount_cents;
            slot.1 += 1;
        }
    }
    expected
}

async fn live_facts(pool: &SqlitePool) -> BTreeMap<FactKey, (i64, i64)> {
    let rows: Vec<(String, String, String, i64, i64)> = sqlx::query_as(
        "SELECT period_type, period_start, category_id, total_amount_cents, entry_count \
         FROM aggregate_records WHERE tenant_id = 't1'",
    )
    .fetch_all(pool)
    .await
    .expect("read aggregate_records");
    rows.into_iter()
        .map(|(pt, ps, cat, amount, count)| ((pt, ps, cat), (amount, count)))
        .collect()
}

async fn mirror_insert(pool: &SqlitePool, id: &str, values: &EntryValues) {
    sqlx::query(
        "INSERT INTO ledger_entries \
         (id, tenant_id, account_id, category_id, entry_type, amount_cents, entry_date, \
          is_recurring, created_at, updated_at) \
         VALUES (?, 't1', ?, ?, ?, ?, ?, ?, 0, 0)",
    )
    .bind(id)
    .bind(&values.account_id)
    .bind(values.category_id.as_deref())
    .bind(values.entry_type.as_str())
    .bind(values.amount_cents)
    .bind(values.entry_date.to_string())
    .bind(values.is_recurring)
    .execute(pool)
    .await
    .expect("mirror insert");
}

async fn mirror_update(pool: &SqlitePool, id: &str, values: &EntryValues) {
    sqlx::query(
        "UPDATE ledger_entries SET category_id = ?, amount_cents = ?, entry_date = ? \
         WHERE id = ?",
    )
    .bind(values.category_id.as_deref())
    .bind(values.amount_cents)
    .bind(values.entry_date.to_string())
    .bind(id)
    .execute(pool)
    .await
    .expect("mirror update");
}

async fn mirror_delete(pool: &SqlitePool, id: &str) {
    sqlx::query("DELETE FROM ledger_entries WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await
        .expect("mirror delete");
}

async fn run_sequence(ops: Vec<Op>) {
    let dir = tempdir().expect("tempdir");
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("test.sqlite").display()
    );
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await
        .expect("open pool");
    ledgercube::migrate::apply_migrations(&pool)
        .await
        .expect("migrate");
    let cube = Cube::new(pool, CubeConfig::default());

    let mut model: HashMap<String, EntryValues> = HashMap::new();
    for op in &ops {
        let id = format!("entry-{}", op.slot);
        let values = entry_values(op);
        let event = match (op.kind, model.get(&id)) {
            (0, None) => {
                mirror_insert(cube.pool(), &id, &values).await;
                model.insert(id.clone(), values.clone());
                ChangeEvent::inserted(id.as_str(), "t1", values)
            }
            (1, Some(old)) => {
                let old = old.clone();
                mirror_update(cube.pool(), &id, &values).await;
                model.insert(id.clone(), values.clone());
                ChangeEvent::updated(id.as_str(), "t1", old, values)
            }
            (2, Some(old)) => {
                let old = old.clone();
                mirror_delete(cube.pool(), &id).await;
                model.remove(&id);
                ChangeEvent::deleted(id.as_str(), "t1", old)
            }
            _ => continue,
        };
        cube.apply_events(&[event]).await.expect("apply event");
    }

    // The cube matches a from-scratch aggregation of the surviving entries.
    let live = live_facts(cube.pool()).await;
    assert_eq!(live, expected_facts(&model));

    // No zero-count records survive.
    let zero_rows: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM aggregate_records WHERE entry_count = 0",
    )
    .fetch_one(cube.pool())
    .await
    .expect("count zero rows");
    assert_eq!(zero_rows, 0);

    // Incremental maintenance and full rebuild agree.
    let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
    for period in periods_in_range(start, end) {
        cube.rebuild_period("t1", &period, None)
            .await
            .expect("rebuild");
    }
    assert_eq!(live_facts(cube.pool()).await, live);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn event_sequences_stay_consistent_with_the_ledger(ops in op_strategy()) {
        let rt = tokio::runtime::Runtime::new().expect("runtime");
        rt.block_on(run_sequence(ops));
    }
}
