//! VSite cycles with the bundled backends against the in-memory database.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use siteagent::{
    FixedClock, Result, Watermark,
    backends::ConfiguredBackends,
    config::AgentConfig,
    db::{Connector, InMemoryDatabase, Row, RowSource, SiteDb},
    vsite::{
        BackendFactory, TimestampStore, UpdateOutcome, UpdateScope, VSite, VSiteBackend,
        VSiteSettings,
    },
};

use crate::helpers::SITE;

fn settings() -> VSiteSettings {
    VSiteSettings {
        retry_interval: Duration::from_secs(30),
        database_retry_interval: Duration::from_secs(60),
        ready_hook: None,
    }
}

fn user(name: &str, password_type: &str) -> Row {
    Row::new()
        .with("uid", Some("1000"))
        .with("UserName", Some(name))
        .with("gid", Some("100"))
        .with("groupName", Some("users"))
        .with("homeDirectory", Some(format!("/home/{name}")))
        .with("userAccountState", Some("A"))
        .with("passwordType", Some(password_type))
}

#[tokio::test]
async fn test_null_backend_reads_the_window() {
    let config = AgentConfig::from_json(
        r#"{"connection": {"sitename": "siteA", "password_type": "crypt"}}"#,
        Path::new("test.json"),
    )
    .unwrap();
    let backends = ConfiguredBackends::from_config(&config).unwrap();

    let db = InMemoryDatabase::new();
    db.insert_row(RowSource::Users, SITE, "proj1", "2024-01-01T09:00:00", user("old", "crypt"));
    db.insert_row(RowSource::Users, SITE, "proj1", "2024-01-01T11:00:00", user("alice", "crypt"));
    db.insert_row(RowSource::Users, SITE, "proj1", "2024-01-01T11:30:00", user("bob", "md5"));
    db.set_now("2024-01-01T12:00:00");

    let dir = tempfile::tempdir().unwrap();
    let store = TimestampStore::new(dir.path(), "agent", SITE);
    store
        .save("proj1", &Watermark::new("2024-01-01T10:00:00"))
        .unwrap();
    let mut vsite = VSite::new(
        "proj1",
        SITE,
        backends.create("proj1").unwrap(),
        store.clone(),
        settings(),
        Arc::new(FixedClock::default()),
    );

    let mut session = db.connect().await.unwrap();
    let outcome = vsite.update(session.as_mut(), None).await.unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Completed {
            watermark: Watermark::new("2024-01-01T12:00:00"),
            advanced: true,
        }
    );

    let user_queries: Vec<_> = db
        .queries()
        .into_iter()
        .filter(|q| q.source == RowSource::Users)
        .collect();
    assert_eq!(user_queries.len(), 1);
    assert_eq!(user_queries[0].after, Some(Watermark::new("2024-01-01T10:00:00")));
    assert_eq!(user_queries[0].through, Some(Watermark::new("2024-01-01T12:00:00")));
    assert_eq!(
        user_queries[0].filters,
        vec![("passwordType".to_string(), "crypt".to_string())]
    );
    assert_eq!(store.load("proj1").as_str(), "2024-01-01T12:00:00");
}

#[cfg(unix)]
#[tokio::test]
async fn test_declining_ready_hook_skips_local_cycles() {
    use std::os::unix::fs::PermissionsExt;

    use siteagent::hooks::FilterHook;

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("not-ready.sh");
    std::fs::write(&script, "#!/bin/sh\nexit 3\n").unwrap();
    std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

    let mut settings = settings();
    settings.ready_hook = Some(Arc::new(
        FilterHook::parse(script.to_str().unwrap()).unwrap(),
    ));

    let db = InMemoryDatabase::new();
    db.set_now("2024-01-01T12:00:00");
    let backends =
        ConfiguredBackends::from_config(&AgentConfig::from_json(r#"{"connection": {}}"#, Path::new("t.json")).unwrap())
            .unwrap();
    let clock = Arc::new(FixedClock::new(5_000));
    let mut vsite = VSite::new(
        "proj1",
        SITE,
        backends.create("proj1").unwrap(),
        TimestampStore::new(dir.path(), "agent", SITE),
        settings,
        clock,
    );
    vsite.defer(Duration::from_secs(1));
    assert_eq!(vsite.retry_at(), Some(6_000));

    let mut session = db.connect().await.unwrap();
    let outcome = vsite.update(session.as_mut(), None).await.unwrap();
    assert_eq!(outcome, UpdateOutcome::NotReady);
    assert_eq!(vsite.retry_at(), None);
    assert!(vsite.watermark().is_epoch());
    assert!(db.queries().is_empty());

    // A refresh from the master is applied without asking the hook.
    let end = Watermark::new("2024-01-01T11:00:00");
    let outcome = vsite.update(session.as_mut(), Some(&end)).await.unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Completed {
            watermark: end,
            advanced: true,
        }
    );
}

/// Collects user names; on its first fetch it commits one more row behind
/// the reader's back and moves the database clock on.
#[derive(Debug)]
struct LateWriter {
    db: InMemoryDatabase,
    seen: Arc<Mutex<Vec<String>>>,
    wrote_late_row: bool,
}

#[async_trait]
impl VSiteBackend for LateWriter {
    async fn update_groups(&mut self, _db: &mut dyn SiteDb, _scope: &UpdateScope<'_>) -> Result<()> {
        Ok(())
    }

    async fn update_users(&mut self, db: &mut dyn SiteDb, scope: &UpdateScope<'_>) -> Result<()> {
        let rows = db
            .fetch_rows(&scope.query(RowSource::Users, &["UserName"]))
            .await?;
        self.seen
            .lock()
            .unwrap()
            .extend(rows.iter().filter_map(|r| r.get("UserName")).map(str::to_string));
        if !self.wrote_late_row {
            self.wrote_late_row = true;
            self.db.insert_row(
                RowSource::Users,
                SITE,
                "proj1",
                "2024-01-01T09:59:00",
                Row::new().with("UserName", Some("late")),
            );
            self.db.set_now("2024-01-01T10:00:00");
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_row_committed_mid_cycle_is_read_next_cycle() {
    let db = InMemoryDatabase::new();
    db.insert_row(
        RowSource::Users,
        SITE,
        "proj1",
        "2024-01-01T09:00:00",
        Row::new().with("UserName", Some("early")),
    );
    db.set_now("2024-01-01T09:58:00");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let dir = tempfile::tempdir().unwrap();
    let mut vsite = VSite::new(
        "proj1",
        SITE,
        Box::new(LateWriter {
            db: db.clone(),
            seen: seen.clone(),
            wrote_late_row: false,
        }),
        TimestampStore::new(dir.path(), "agent", SITE),
        settings(),
        Arc::new(FixedClock::default()),
    );
    let mut session = db.connect().await.unwrap();

    let outcome = vsite.update(session.as_mut(), None).await.unwrap();
    assert_eq!(
        outcome,
        UpdateOutcome::Completed {
            watermark: Watermark::new("2024-01-01T09:58:00"),
            advanced: true,
        }
    );
    assert_eq!(*seen.lock().unwrap(), vec!["early"]);

    db.set_now("2024-01-01T11:00:00");
    vsite.update(session.as_mut(), None).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["early", "late"]);
    assert_eq!(vsite.watermark().as_str(), "2024-01-01T11:00:00");
}
