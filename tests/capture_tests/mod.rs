use super::{FakeHistory, FakeSource, stat};
use pg_query_stats::{CaptureCoordinator, CaptureError, CaptureMode, CaptureOutcome, Config, DatabaseConfig, DomainLock, DomainMember, Monitor, ResetDomain};
use std::sync::atomic::Ordering;
use std::time::Duration;

fn domain(members: &[&str]) -> ResetDomain {
    ResetDomain {
        id: members[0].to_string(),
        members: members.iter().map(|m| DomainMember { id: m.to_string(), database_name: Some(format!("{m}_db")) }).collect(),
    }
}

fn coordinator<'a>(source: &'a FakeSource, history: &'a FakeHistory) -> CaptureCoordinator<'a, FakeSource, FakeHistory> {
    CaptureCoordinator::new(source, history, Duration::from_millis(200), 1_000_000)
}

#[tokio::test]
async fn captures_and_resets_once() {
    let source = FakeSource::with(&[("a_db", vec![stat("SELECT 1", Some(1), "app", 10, 5.0)]), ("b_db", vec![stat("SELECT 2", Some(2), "app", 0, 0.0)])]);
    let history = FakeHistory::default();
    let outcome = coordinator(&source, &history).run(&domain(&["a", "b"])).await.unwrap();
    assert_eq!(outcome, CaptureOutcome::Captured { rows: 1, members: 1 });
    assert_eq!(source.resets.load(Ordering::SeqCst), 1);
    assert!(!source.locked.load(Ordering::SeqCst));

    let rows = history.rows.lock().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].database_id, "a");
    assert_eq!(rows[0].calls, 10);
    assert_eq!(rows[0].total_time_ms, 300_000.0);
}

#[tokio::test]
async fn members_share_captured_at() {
    let source = FakeSource::with(&[
        ("a_db", vec![stat("SELECT 1", Some(1), "app", 1, 1.0), stat("SELECT 2", Some(2), "app", 1, 1.0)]),
        ("b_db", vec![stat("SELECT 3", Some(3), "app", 1, 1.0)]),
    ]);
    let history = FakeHistory::default();
    let outcome = coordinator(&source, &history).run(&domain(&["a", "b"])).await.unwrap();
    assert_eq!(outcome, CaptureOutcome::Captured { rows: 3, members: 2 });
    assert_eq!(source.resets.load(Ordering::SeqCst), 1);

    let rows = history.rows.lock().unwrap();
    assert_eq!(rows.iter().map(|r| r.database_id.as_str()).collect::<Vec<_>>(), vec!["a", "a", "b"]);
    assert!(rows.iter().all(|r| r.captured_at == rows[0].captured_at));
}

#[tokio::test]
async fn failed_member_aborts_cycle() {
    let source = FakeSource {
        failing: Some("b_db".to_string()),
        ..FakeSource::with(&[("a_db", vec![stat("SELECT 1", Some(1), "app", 10, 5.0)]), ("b_db", vec![stat("SELECT 2", Some(2), "app", 1, 1.0)])])
    };
    let history = FakeHistory::default();
    let error = coordinator(&source, &history).run(&domain(&["a", "b"])).await.unwrap_err();
    assert!(matches!(&error, CaptureError::Skipped { member, .. } if member == "b"));
    assert!(!error.is_data_loss());
    assert_eq!(source.resets.load(Ordering::SeqCst), 0);
    assert!(history.rows.lock().unwrap().is_empty());
    assert!(!source.locked.load(Ordering::SeqCst));

    // The counters survive for the next cycle
    assert_eq!(source.stats.lock().unwrap()["a_db"].len(), 1);
}

#[tokio::test]
async fn timed_out_member_aborts_cycle() {
    let source = FakeSource { stalling: Some("b_db".to_string()), ..FakeSource::with(&[("a_db", vec![stat("SELECT 1", Some(1), "app", 1, 1.0)])]) };
    let history = FakeHistory::default();
    let error = coordinator(&source, &history).run(&domain(&["a", "b"])).await.unwrap_err();
    assert!(matches!(&error, CaptureError::Skipped { member, .. } if member == "b"));
    assert_eq!(source.resets.load(Ordering::SeqCst), 0);
    assert!(history.rows.lock().unwrap().is_empty());
}

#[tokio::test]
async fn empty_snapshots_skip_reset() {
    let source = FakeSource::with(&[("a_db", vec![]), ("b_db", vec![])]);
    let history = FakeHistory::default();
    let outcome = coordinator(&source, &history).run(&domain(&["a", "b"])).await.unwrap();
    assert_eq!(outcome, CaptureOutcome::Empty);
    assert_eq!(source.resets.load(Ordering::SeqCst), 0);
    assert!(history.rows.lock().unwrap().is_empty());

    // Zero-call entries alone do not justify a reset
    let source = FakeSource::with(&[("a_db", vec![stat("SELECT 1", Some(1), "app", 0, 0.0)]), ("b_db", vec![])]);
    let outcome = coordinator(&source, &history).run(&domain(&["a", "b"])).await.unwrap();
    assert_eq!(outcome, CaptureOutcome::Empty);
    assert_eq!(source.resets.load(Ordering::SeqCst), 0);

    // An unusable extension reads as empty rather than failing
    let source = FakeSource { unusable: true, ..Default::default() };
    let outcome = coordinator(&source, &history).run(&domain(&["a"])).await.unwrap();
    assert_eq!(outcome, CaptureOutcome::Empty);
}

#[tokio::test]
async fn persistence_failure_after_reset_is_data_loss() {
    let source = FakeSource::with(&[("a_db", vec![stat("SELECT 1", Some(1), "app", 10, 5.0)])]);
    let history = FakeHistory { failing: true, ..Default::default() };
    let error = coordinator(&source, &history).run(&domain(&["a"])).await.unwrap_err();
    assert!(error.is_data_loss());
    assert!(matches!(error, CaptureError::DataLoss { rows: 1, .. }));
    assert_eq!(source.resets.load(Ordering::SeqCst), 1);
    assert!(!source.locked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn stalled_lock_attempt_times_out() {
    let source = FakeSource { stalling_lock: true, ..FakeSource::with(&[("a_db", vec![stat("SELECT 1", Some(1), "app", 10, 5.0)])]) };
    let history = FakeHistory::default();
    let capture = coordinator(&source, &history);
    let databases = domain(&["a"]);
    let run = capture.run(&databases);
    let error = tokio::time::timeout(Duration::from_secs(5), run).await.expect("bounded by the capture timeout").unwrap_err();
    assert!(matches!(error, CaptureError::Lock { .. }));
    assert!(!error.is_data_loss());
    assert_eq!(source.resets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stalled_append_is_data_loss() {
    let source = FakeSource::with(&[("a_db", vec![stat("SELECT 1", Some(1), "app", 10, 5.0)])]);
    let history = FakeHistory { stalling: true, ..Default::default() };
    let capture = coordinator(&source, &history);
    let databases = domain(&["a"]);
    let run = capture.run(&databases);
    let error = tokio::time::timeout(Duration::from_secs(5), run).await.expect("bounded by the capture timeout").unwrap_err();
    assert!(matches!(error, CaptureError::DataLoss { rows: 1, .. }));
    assert_eq!(source.resets.load(Ordering::SeqCst), 1);
    assert!(!source.locked.load(Ordering::SeqCst));
}

#[tokio::test]
async fn locked_domain_is_skipped() {
    let source = FakeSource::with(&[("a_db", vec![stat("SELECT 1", Some(1), "app", 10, 5.0)])]);
    let history = FakeHistory::default();
    let guard = source.try_lock("a").await.unwrap();
    assert!(guard.is_some());

    let error = coordinator(&source, &history).run(&domain(&["a"])).await.unwrap_err();
    assert!(matches!(error, CaptureError::Locked { .. }));
    assert_eq!(source.resets.load(Ordering::SeqCst), 0);

    source.unlock(()).await.unwrap();
    let outcome = coordinator(&source, &history).run(&domain(&["a"])).await.unwrap();
    assert_eq!(outcome, CaptureOutcome::Captured { rows: 1, members: 1 });
}

#[tokio::test]
async fn disabled_history_leaves_counters() {
    let source = FakeSource::with(&[("a_db", vec![stat("SELECT 1", Some(1), "app", 10, 5.0)])]);
    let history = FakeHistory { disabled: true, ..Default::default() };
    let outcome = coordinator(&source, &history).run(&domain(&["a"])).await.unwrap();
    assert_eq!(outcome, CaptureOutcome::HistoryDisabled);
    assert_eq!(source.resets.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn monitor_routes_by_capture_mode() -> anyhow::Result<()> {
    let mut config = Config::single("postgres://localhost/app");
    let mut shard = DatabaseConfig::new("shard", "postgres://localhost/shard");
    shard.capture_query_stats = CaptureMode::Member("primary".to_string());
    let mut archive = DatabaseConfig::new("archive", "postgres://localhost/archive");
    archive.capture_query_stats = CaptureMode::Disabled;
    config.databases.insert("shard".to_string(), shard);
    config.databases.insert("archive".to_string(), archive);
    let monitor = Monitor::new(config)?;

    // Neither answer needs a connection
    assert_eq!(monitor.capture_query_stats("shard").await?, CaptureOutcome::Delegated { owner: "primary".to_string() });
    assert_eq!(monitor.capture_query_stats("archive").await?, CaptureOutcome::Disabled);
    assert!(matches!(monitor.capture_query_stats("missing").await, Err(CaptureError::UnknownDatabase(_))));

    assert_eq!(monitor.primary().map(|d| d.id()), Some("primary"));
    assert_eq!(monitor.database("shard").map(|d| d.reset_domain_id()), Some("primary"));
    assert_eq!(monitor.databases().count(), 3);
    Ok(())
}

#[tokio::test]
async fn monitor_pools_are_bounded() -> anyhow::Result<()> {
    let mut config = Config::single("postgres://localhost/app");
    config.settings.connect_timeout_secs = 3;
    let monitor = Monitor::new(config)?;
    let primary = monitor.primary().unwrap();
    for pool in [primary.source().pool(), primary.history().pool()] {
        let timeouts = pool.timeouts();
        assert_eq!(timeouts.wait, Some(Duration::from_secs(3)));
        assert_eq!(timeouts.create, Some(Duration::from_secs(3)));
    }
    Ok(())
}
