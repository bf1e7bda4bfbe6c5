use crate::DB_POOL;
use pg_query_stats::{
    CaptureCoordinator, CaptureOutcome, DomainLock, DomainMember, HistoricalRow, HistoricalStore, HistoryFilter, PgHistoricalStore,
    PgStatStatements, QueryStatsOptions, RawStatRecord, ResetDomain, StatsFilter, StatsSource, Support, merge, normalize,
};
use std::time::{Duration, SystemTime};

const TABLE: &str = "pg_query_stats_test";

async fn fresh_store() -> anyhow::Result<PgHistoricalStore> {
    DB_POOL.get().await?.batch_execute(&format!("DROP TABLE IF EXISTS {TABLE}")).await?;
    let store = PgHistoricalStore::new((**DB_POOL).clone(), TABLE, 10_000);
    store.create_table().await?;
    Ok(store)
}

fn record(query: &str, query_hash: Option<i64>, calls: i64, total_time_ms: f64) -> RawStatRecord {
    RawStatRecord { query: query.to_string(), query_hash, user: Some("app".to_string()), total_time_ms, calls, ..Default::default() }
}

#[tokio::test]
#[ignore = "requires a Postgres server"]
#[serial_test::serial]
async fn history_round_trip() -> anyhow::Result<()> {
    let store = fresh_store().await?;
    assert!(store.enabled().await);
    assert!(store.supports_query_hash().await);
    let schema = store.schema().await?;
    assert_eq!((schema.query_hash, schema.user), (Support::Supported, Support::Supported));

    let now = SystemTime::now();
    let earlier = now - Duration::from_secs(600);
    let rows = vec![
        HistoricalRow::new("primary", earlier, record("SELECT * FROM t WHERE id = ?", Some(1), 2, 40.0)),
        HistoricalRow::new("primary", now, record("SELECT * FROM t WHERE id = 5", Some(1), 3, 60.0)),
        HistoricalRow::new("primary", now, record("SELECT 2", Some(2), 1, 10.0)),
        HistoricalRow::new("replica", now, record("SELECT 3", Some(3), 1, 10.0)),
    ];
    assert_eq!(store.append(rows).await?, 4);

    let records = store.query(&HistoryFilter::new("primary")).await?;
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].query_hash, Some(1));
    assert_eq!(records[0].calls, 5);
    assert_eq!(records[0].total_time_ms, 100.0);
    assert_eq!(records[0].user.as_deref(), Some("app"));

    // '?' compares as '!', ahead of any digit
    assert_eq!(records[0].query, "SELECT * FROM t WHERE id = ?");
    assert_eq!(records[0].explainable_query.as_deref(), Some("SELECT * FROM t WHERE id = 5"));

    let stats = merge(Vec::new(), records, &QueryStatsOptions::default());
    assert_eq!(stats[0].explainable_query.as_deref(), Some("SELECT * FROM t WHERE id = 5"));

    let window = HistoryFilter { start_at: Some(now - Duration::from_secs(60)), ..HistoryFilter::new("primary") };
    let records = store.query(&window).await?;
    assert_eq!(records.iter().map(|r| r.calls).sum::<i64>(), 4);

    let filter = HistoryFilter { query_hash: Some(2), ..HistoryFilter::new("primary") };
    assert_eq!(store.query(&filter).await?.len(), 1);

    let samples = store.hash_series("primary", 1, now - Duration::from_secs(3600)).await?;
    assert_eq!(samples.len(), 2);
    assert!(samples[0].captured_at < samples[1].captured_at);
    assert_eq!(samples[1].average_time_ms, 20.0);

    assert_eq!(store.prune("primary", now - Duration::from_secs(60)).await?, 1);
    assert_eq!(store.query(&HistoryFilter::new("replica")).await?.len(), 1);
    Ok(())
}

#[tokio::test]
#[ignore = "requires a Postgres server"]
#[serial_test::serial]
async fn missing_history_table() -> anyhow::Result<()> {
    let store = PgHistoricalStore::new((**DB_POOL).clone(), "pg_query_stats_missing", 10_000);
    assert!(!store.enabled().await);
    assert!(store.query(&HistoryFilter::new("primary")).await?.is_empty());
    assert_eq!(store.prune("primary", SystemTime::now()).await?, 0);
    assert!(store.append(vec![HistoricalRow::new("primary", SystemTime::now(), record("SELECT 1", None, 1, 1.0))]).await.is_err());
    Ok(())
}

#[tokio::test]
#[ignore = "requires a Postgres server"]
#[serial_test::serial]
async fn advisory_lock() -> anyhow::Result<()> {
    let source = PgStatStatements::new((**DB_POOL).clone(), 10_000);
    let guard = source.try_lock("primary").await?;
    assert!(guard.is_some());
    assert!(source.try_lock("primary").await?.is_none());
    assert!(source.try_lock("other").await?.is_some());

    if let Some(guard) = guard {
        source.unlock(guard).await?;
    }
    let guard = source.try_lock("primary").await?;
    assert!(guard.is_some());

    // Dropping the guard ends the session holding it, which the server notices asynchronously
    drop(guard);
    for _ in 0..50 {
        if source.try_lock("primary").await?.is_some() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("advisory lock outlived its session")
}

#[tokio::test]
#[ignore = "requires a Postgres server with pg_stat_statements preloaded"]
#[serial_test::serial]
async fn capture_live_stats() -> anyhow::Result<()> {
    let source = PgStatStatements::new((**DB_POOL).clone(), 10_000);
    source.enable().await?;
    if !source.probe().await.usable() {
        return Ok(());
    }
    let capabilities = source.capabilities().await?;
    assert!(capabilities.server_version_num >= 90400);

    let db = DB_POOL.get().await?;
    for _ in 0..3 {
        db.query("SELECT count(*) FROM pg_class WHERE relname = $1", &[&"pg_query_stats"]).await?;
    }
    let live = source.current_stats(&StatsFilter { database: None, query_hash: None, limit: 1000 }).await?;
    assert!(live.iter().all(|r| r.calls > 0));
    assert!(live.windows(2).all(|w| w[0].total_time_ms >= w[1].total_time_ms));
    assert!(live.iter().all(|r| r.explainable_query.is_none()));
    let pg_class = live.iter().find(|r| r.query.contains("pg_class WHERE relname")).expect("statement is tracked");
    assert!(pg_class.calls >= 3);

    let by_hash = StatsFilter { database: None, query_hash: pg_class.query_hash, limit: 10 };
    assert!(source.current_stats(&by_hash).await?.iter().all(|r| r.query_hash == pg_class.query_hash));

    let history = fresh_store().await?;
    let database_name: String = db.query_one("SELECT current_database()", &[]).await?.get(0);
    let domain = ResetDomain { id: "primary".to_string(), members: vec![DomainMember { id: "primary".to_string(), database_name: Some(database_name) }] };
    let outcome = CaptureCoordinator::new(&source, &history, Duration::from_secs(30), 1_000_000).run(&domain).await?;
    assert!(matches!(outcome, CaptureOutcome::Captured { rows, members: 1 } if rows > 0));

    let captured = history.query(&HistoryFilter::new("primary")).await?;
    assert!(captured.iter().any(|r| r.query.contains("pg_class WHERE relname")));
    Ok(())
}

#[tokio::test]
#[ignore = "requires a Postgres server"]
#[serial_test::serial]
async fn server_grouping_matches_normalize() -> anyhow::Result<()> {
    let table = "pg_query_stats_test_no_hash";
    let db = DB_POOL.get().await?;
    db.batch_execute(&format!(
        "DROP TABLE IF EXISTS {table};
        CREATE TABLE {table} (database text NOT NULL, query text NOT NULL, total_time float8 NOT NULL, calls bigint NOT NULL, captured_at timestamptz NOT NULL)"
    ))
    .await?;
    let store = PgHistoricalStore::new((**DB_POOL).clone(), table, 10_000);
    assert!(store.enabled().await);
    assert!(!store.supports_query_hash().await);
    assert!(!store.supports_user().await);

    let queries = [
        "  SELECT * /* app:web */ FROM t\n\tWHERE id IN (?, ?,\n ?)  ",
        "SELECT *   FROM t WHERE id IN (?,?)",
        "/* job */ SELECT * FROM t WHERE id IN (?)",
        "UPDATE t SET a = ? /* multi\nline */ WHERE b = ?",
    ];
    for query in queries {
        assert_eq!(store.grouping_key(query).await?, normalize(query), "{query:?}");
    }

    let now = SystemTime::now();
    let rows = queries[..3].iter().map(|q| HistoricalRow::new("primary", now, record(q, None, 1, 10.0))).collect();
    assert_eq!(store.append(rows).await?, 3);
    let records = store.query(&HistoryFilter::new("primary")).await?;
    assert_eq!(records.len(), 1);
    assert_eq!((records[0].calls, records[0].user.as_deref()), (3, None));
    Ok(())
}
