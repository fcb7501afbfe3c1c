use anyhow::Result;
use chrono::NaiveDate;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tempfile::tempdir;

use ledgercube::{
    periods_in_range, BulkChange, Cube, CubeConfig, DimensionChange, EntryType,
};

async fn setup_cube(dir: &tempfile::TempDir) -> Result<Cube> {
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("test.sqlite").display()
    );
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await?;
    ledgercube::migrate::apply_migrations(&pool).await?;
    Ok(Cube::new(pool, CubeConfig::default()))
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

async fn insert_entry(pool: &SqlitePool, id: &str, category: &str, amount: i64, day: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO ledger_entries \
         (id, tenant_id, account_id, category_id, entry_type, amount_cents, entry_date, \
          is_recurring, created_at, updated_at) \
         VALUES (?, 't1', 'acct-a', ?, 'expense', ?, ?, 0, 0, 0)",
    )
    .bind(id)
    .bind(category)
    .bind(amount)
    .bind(day)
    .execute(pool)
    .await?;
    Ok(())
}

async fn category_facts(pool: &SqlitePool, period_type: &str, period_start: &str, category: &str) -> Result<Option<(i64, i64)>> {
    let row = sqlx::query_as(
        "SELECT total_amount_cents, entry_count FROM aggregate_records \
         WHERE tenant_id = 't1' AND period_type = ? AND period_start = ? AND category_id = ?",
    )
    .bind(period_type)
    .bind(period_start)
    .bind(category)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

async fn populate(cube: &Cube, range_start: NaiveDate, range_end: NaiveDate) -> Result<()> {
    for period in periods_in_range(range_start, range_end) {
        cube.rebuild_period("t1", &period, None).await?;
    }
    Ok(())
}

#[tokio::test]
async fn mass_recategorize_regenerates_both_slices() -> Result<()> {
    let dir = tempdir()?;
    let cube = setup_cube(&dir).await?;

    // 100 January entries in cat-a, 10 cents each; plus untouched February
    // activity in the same category.
    for i in 0..100 {
        let day = format!("2024-01-{:02}", (i % 28) + 1);
        insert_entry(cube.pool(), &format!("jan-{i}"), "cat-a", 10, &day).await?;
    }
    insert_entry(cube.pool(), "feb-1", "cat-a", 77, "2024-02-15").await?;
    populate(&cube, date(2024, 1, 1), date(2024, 2, 29)).await?;

    assert_eq!(
        category_facts(cube.pool(), "monthly", "2024-01-01", "cat-a").await?,
        Some((1000, 100))
    );

    // The ledger service mass-updates the rows, then hands the cube one
    // uniform change description instead of 100 events.
    sqlx::query(
        "UPDATE ledger_entries SET category_id = 'cat-b' \
         WHERE tenant_id = 't1' AND entry_date < '2024-02-01'",
    )
    .execute(cube.pool())
    .await?;

    let change = BulkChange {
        tenant_id: "t1".into(),
        changes: vec![DimensionChange::Category {
            old: Some("cat-a".into()),
            new: Some("cat-b".into()),
        }],
        range_start: date(2024, 1, 1),
        range_end: date(2024, 1, 31),
        entry_type: Some(EntryType::Expense),
    };
    assert!(cube.should_use_bulk(100));
    let summary = cube.apply_bulk_change(&change).await?;
    assert_eq!(summary.periods, periods_in_range(change.range_start, change.range_end).len());
    assert_eq!(summary.slices_rebuilt, summary.periods * 2);

    // January moved wholesale from cat-a to cat-b.
    assert_eq!(
        category_facts(cube.pool(), "monthly", "2024-01-01", "cat-a").await?,
        None
    );
    assert_eq!(
        category_facts(cube.pool(), "monthly", "2024-01-01", "cat-b").await?,
        Some((1000, 100))
    );
    // February record is outside the range and untouched.
    assert_eq!(
        category_facts(cube.pool(), "monthly", "2024-02-01", "cat-a").await?,
        Some((77, 1))
    );

    // Every weekly slice in January agrees with the ledger too.
    let weekly_total: Option<(i64, i64)> = sqlx::query_as(
        "SELECT SUM(total_amount_cents), SUM(entry_count) FROM aggregate_records \
         WHERE tenant_id = 't1' AND period_type = 'weekly' AND category_id = 'cat-b'",
    )
    .fetch_optional(cube.pool())
    .await?;
    assert_eq!(weekly_total, Some((1000, 100)));
    Ok(())
}

#[tokio::test]
async fn recurring_flag_flip_regenerates_flag_slices() -> Result<()> {
    let dir = tempdir()?;
    let cube = setup_cube(&dir).await?;

    for i in 0..5 {
        insert_entry(cube.pool(), &format!("e{i}"), "cat-a", 100, "2024-01-10").await?;
    }
    populate(&cube, date(2024, 1, 1), date(2024, 1, 31)).await?;

    sqlx::query("UPDATE ledger_entries SET is_recurring = 1 WHERE tenant_id = 't1'")
        .execute(cube.pool())
        .await?;

    cube.apply_bulk_change(&BulkChange {
        tenant_id: "t1".into(),
        changes: vec![DimensionChange::Recurring {
            old: false,
            new: true,
        }],
        range_start: date(2024, 1, 1),
        range_end: date(2024, 1, 31),
        entry_type: Some(EntryType::Expense),
    })
    .await?;

    let by_flag: Vec<(i64, i64)> = sqlx::query_as(
        "SELECT is_recurring, SUM(entry_count) FROM aggregate_records \
         WHERE tenant_id = 't1' AND period_type = 'monthly' GROUP BY is_recurring",
    )
    .fetch_all(cube.pool())
    .await?;
    assert_eq!(by_flag, vec![(1, 5)]);
    Ok(())
}

#[tokio::test]
async fn bulk_change_validation_surfaces_caller_errors() -> Result<()> {
    let dir = tempdir()?;
    let cube = setup_cube(&dir).await?;

    let noop = BulkChange {
        tenant_id: "t1".into(),
        changes: vec![DimensionChange::Account {
            old: "acct-a".into(),
            new: "acct-a".into(),
        }],
        range_start: date(2024, 1, 1),
        range_end: date(2024, 1, 31),
        entry_type: None,
    };
    let err = cube.apply_bulk_change(&noop).await.unwrap_err();
    assert_eq!(err.code(), "CUBE/INVALID_BULK");
    Ok(())
}
