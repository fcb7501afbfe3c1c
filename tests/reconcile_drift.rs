use anyhow::Result;
use chrono::NaiveDate;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tempfile::tempdir;

use ledgercube::{ChangeEvent, Cube, CubeConfig, EntryType, EntryValues};

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

async fn insert_entry(pool: &SqlitePool, id: &str, amount: i64, day: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO ledger_entries \
         (id, tenant_id, account_id, category_id, entry_type, amount_cents, entry_date, \
          is_recurring, created_at, updated_at) \
         VALUES (?, 't1', 'acct-a', 'cat-food', 'expense', ?, ?, 0, 0, 0)",
    )
    .bind(id)
    .bind(amount)
    .bind(day)
    .execute(pool)
    .await?;
    Ok(())
}

fn expense(amount: i64, day: NaiveDate) -> EntryValues {
    EntryValues {
        account_id: "acct-a".into(),
        category_id: Some("cat-food".into()),
        amount_cents: amount,
        entry_date: day,
        entry_type: EntryType::Expense,
        is_recurring: false,
    }
}

async fn monthly_amount(pool: &SqlitePool) -> Result<Option<i64>> {
    let row = sqlx::query_scalar(
        "SELECT total_amount_cents FROM aggregate_records \
         WHERE tenant_id = 't1' AND period_type = 'monthly' AND period_start = '2024-01-01' \
           AND category_id = 'cat-food'",
    )
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

#[tokio::test]
async fn out_of_band_edit_is_detected_and_repaired() -> Result<()> {
    let dir = tempdir()?;
    let cube = setup_cube(&dir).await?;

    // Ledger write and cube event agree to start with.
    insert_entry(cube.pool(), "e1", 100, "2024-01-15").await?;
    cube.apply_events(&[ChangeEvent::inserted(
        "e1",
        "t1",
        expense(100, date(2024, 1, 15)),
    )])
    .await?;
    assert_eq!(monthly_amount(cube.pool()).await?, Some(100));

    // Someone edits the ledger row without emitting an event.
    sqlx::query("UPDATE ledger_entries SET amount_cents = 150 WHERE id = 'e1'")
        .execute(cube.pool())
        .await?;

    let outcome = cube
        .run_reconciliation("t1", 1, date(2024, 1, 15))
        .await?;
    // One weekly plus one monthly period covers Jan 15; both drifted.
    assert_eq!(outcome.periods_checked, 2);
    assert_eq!(outcome.discrepancies, 2);
    assert_eq!(outcome.rebuilds, 2);
    let sample = outcome.last.expect("discrepancy sample recorded");
    assert_eq!(sample.tenant_id, "t1");
    assert_eq!(sample.live.unwrap().total_amount_cents, 100);
    assert_eq!(sample.expected.unwrap().total_amount_cents, 150);

    assert_eq!(monthly_amount(cube.pool()).await?, Some(150));

    // Once repaired, the next run is clean.
    let second = cube
        .run_reconciliation("t1", 1, date(2024, 1, 15))
        .await?;
    assert_eq!(second.discrepancies, 0);
    assert_eq!(second.rebuilds, 0);
    Ok(())
}

#[tokio::test]
async fn missing_live_record_counts_as_discrepancy() -> Result<()> {
    let dir = tempdir()?;
    let cube = setup_cube(&dir).await?;

    // Ledger has activity but nothing ever reached the cube.
    insert_entry(cube.pool(), "e1", 500, "2024-01-15").await?;

    let outcome = cube
        .run_reconciliation("t1", 1, date(2024, 1, 15))
        .await?;
    assert_eq!(outcome.discrepancies, 2);
    assert_eq!(monthly_amount(cube.pool()).await?, Some(500));
    Ok(())
}

#[tokio::test]
async fn configured_window_bounds_the_default_run() -> Result<()> {
    let dir = tempdir()?;
    let url = format!(
        "sqlite://{}?mode=rwc",
        dir.path().join("test.sqlite").display()
    );
    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect(&url)
        .await?;
    ledgercube::migrate::apply_migrations(&pool).await?;
    let cube = Cube::new(
        pool,
        CubeConfig {
            reconcile_window: 1,
            ..CubeConfig::default()
        },
    );

    insert_entry(cube.pool(), "e1", 500, "2024-01-15").await?;

    // Window 1 per period type: exactly one weekly and one monthly check.
    let outcome = cube
        .run_reconciliation_default("t1", date(2024, 1, 15))
        .await?;
    assert_eq!(outcome.periods_checked, 2);
    assert_eq!(outcome.rebuilds, 2);
    assert_eq!(monthly_amount(cube.pool()).await?, Some(500));
    Ok(())
}

#[tokio::test]
async fn audit_summary_accumulates_across_runs() -> Result<()> {
    let dir = tempdir()?;
    let cube = setup_cube(&dir).await?;

    insert_entry(cube.pool(), "e1", 500, "2024-01-15").await?;
    cube.run_reconciliation("t1", 1, date(2024, 1, 15)).await?;
    cube.run_reconciliation("t1", 1, date(2024, 1, 15)).await?;

    let summary = cube.reconciliation_summary().await?;
    assert_eq!(summary.periods_checked, 4);
    assert_eq!(summary.discrepancies, 2);
    assert_eq!(summary.rebuilds, 2);
    // Clean second run must not blank out the sample from the first.
    let coordinate = summary.last_coordinate.expect("sample retained");
    assert!(coordinate.contains("cat-food"));
    assert!(summary.last_observed_at_ms.is_some());
    Ok(())
}
