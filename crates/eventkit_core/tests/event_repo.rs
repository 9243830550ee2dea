use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use eventkit_core::db::open_db_in_memory;
use eventkit_core::{
    Event, EventRepository, EventValidationError, ManualClock, RepoError, SqliteEventRepository,
};
use rusqlite::Connection;
use std::sync::Arc;
use uuid::Uuid;

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
}

#[test]
fn insert_and_get_roundtrip() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(at(1, 8)));
    let repo = SqliteEventRepository::with_clock(&conn, clock).unwrap();

    let mut event = Event::new("dentist", at(4, 9))
        .with_end(at(4, 10))
        .with_repeat("FREQ=WEEKLY;COUNT=3");
    event.description = "bring forms".to_string();
    event.location = Some("main street".to_string());
    let id = repo.insert_event(&event).unwrap();

    let loaded = repo.get_event(id).unwrap().unwrap();
    assert_eq!(loaded.title, "dentist");
    assert_eq!(loaded.description, "bring forms");
    assert_eq!(loaded.location.as_deref(), Some("main street"));
    assert_eq!(loaded.start, at(4, 9));
    assert_eq!(loaded.end, Some(at(4, 10)));
    assert_eq!(loaded.repeat_expression(), Some("FREQ=WEEKLY;COUNT=3"));
    assert_eq!(loaded.created, at(1, 8));
    assert_eq!(loaded.modified, at(1, 8));
}

#[test]
fn start_keeps_millisecond_precision() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteEventRepository::try_new(&conn).unwrap();

    let start = at(2, 0) + TimeDelta::milliseconds(250);
    let id = repo.insert_event(&Event::new("precise", start)).unwrap();

    assert_eq!(repo.get_event(id).unwrap().unwrap().start, start);
}

#[test]
fn sub_millisecond_parts_are_dropped_on_write() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteEventRepository::try_new(&conn).unwrap();

    let start = at(2, 0) + TimeDelta::microseconds(1_250_750);
    let end = at(2, 1) + TimeDelta::nanoseconds(999_999);
    let id = repo
        .insert_event(&Event::new("fine", start).with_end(end))
        .unwrap();

    let loaded = repo.get_event(id).unwrap().unwrap();
    assert_eq!(loaded.start, at(2, 0) + TimeDelta::milliseconds(1_250));
    assert_eq!(loaded.end, Some(at(2, 1)));
}

#[test]
fn blank_rule_is_stored_as_absent() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteEventRepository::try_new(&conn).unwrap();

    let id = repo
        .insert_event(&Event::new("one-off", at(2, 9)).with_repeat("   "))
        .unwrap();

    assert_eq!(repo.get_event(id).unwrap().unwrap().repeat_expression, None);
}

#[test]
fn get_missing_returns_none() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteEventRepository::try_new(&conn).unwrap();

    assert!(repo.get_event(Uuid::new_v4()).unwrap().is_none());
}

#[test]
fn modified_strictly_increases_even_when_clock_stalls() {
    let conn = open_db_in_memory().unwrap();
    let clock = Arc::new(ManualClock::new(at(1, 8)));
    let repo = SqliteEventRepository::with_clock(&conn, clock.clone()).unwrap();

    let mut event = Event::new("draft", at(3, 9));
    repo.insert_event(&event).unwrap();
    let first = repo.get_event(event.id).unwrap().unwrap().modified;

    event.title = "second".to_string();
    repo.update_event(&event).unwrap();
    let second = repo.get_event(event.id).unwrap().unwrap().modified;
    assert!(second > first);

    clock.set(at(1, 7));
    event.title = "third".to_string();
    repo.update_event(&event).unwrap();
    let third = repo.get_event(event.id).unwrap();
    let third = third.unwrap();
    assert!(third.modified > second);
    assert_eq!(third.created, at(1, 8));

    clock.advance(TimeDelta::days(1));
    repo.update_event(&event).unwrap();
    assert_eq!(
        repo.get_event(event.id).unwrap().unwrap().modified,
        at(2, 7)
    );
}

#[test]
fn update_missing_returns_not_found() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteEventRepository::try_new(&conn).unwrap();

    let event = Event::new("ghost", at(1, 0));
    let err = repo.update_event(&event).unwrap_err();
    assert!(matches!(err, RepoError::NotFound(id) if id == event.id));
}

#[test]
fn write_paths_reject_invalid_events() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteEventRepository::try_new(&conn).unwrap();

    let inverted = Event::new("inverted", at(2, 10)).with_end(at(2, 9));
    assert!(matches!(
        repo.insert_event(&inverted),
        Err(RepoError::Validation(EventValidationError::EndBeforeStart { .. }))
    ));

    let event = Event::new("plain", at(2, 10));
    repo.insert_event(&event).unwrap();
    assert!(matches!(
        repo.set_master(event.id, Some(event.id)),
        Err(RepoError::Validation(EventValidationError::SelfReference(_)))
    ));
}

#[test]
fn query_children_orders_by_start_and_skips_own_rules() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteEventRepository::try_new(&conn).unwrap();

    let master = Event::new("series", at(1, 9)).with_repeat("FREQ=DAILY;COUNT=4");
    repo.insert_event(&master).unwrap();

    for day in [4, 2, 3] {
        repo.insert_event(&master.project_to_child(at(day, 9))).unwrap();
    }
    let mut split = master.project_to_child(at(5, 9));
    split.repeat_expression = Some("FREQ=DAILY;COUNT=2".to_string());
    repo.insert_event(&split).unwrap();
    repo.insert_event(&Event::new("unrelated", at(2, 12))).unwrap();

    let starts: Vec<_> = repo
        .query_children(master.id)
        .unwrap()
        .into_iter()
        .map(|child| child.start)
        .collect();
    assert_eq!(starts, vec![at(2, 9), at(3, 9), at(4, 9)]);
}

#[test]
fn set_master_reparents_and_detaches() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteEventRepository::try_new(&conn).unwrap();

    let first = Event::new("first", at(1, 9)).with_repeat("FREQ=DAILY;COUNT=2");
    let second = Event::new("second", at(1, 10)).with_repeat("FREQ=DAILY;COUNT=2");
    repo.insert_event(&first).unwrap();
    repo.insert_event(&second).unwrap();
    let child = first.project_to_child(at(2, 9));
    repo.insert_event(&child).unwrap();

    repo.set_master(child.id, Some(second.id)).unwrap();
    assert!(repo.query_children(first.id).unwrap().is_empty());
    assert_eq!(repo.query_children(second.id).unwrap().len(), 1);

    repo.set_master(child.id, None).unwrap();
    assert!(repo.get_event(child.id).unwrap().unwrap().master_id.is_none());
    assert!(matches!(
        repo.set_master(Uuid::new_v4(), None),
        Err(RepoError::NotFound(_))
    ));
}

#[test]
fn delete_orphans_children_instead_of_cascading() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteEventRepository::try_new(&conn).unwrap();

    let master = Event::new("series", at(1, 9)).with_repeat("FREQ=DAILY;COUNT=3");
    repo.insert_event(&master).unwrap();
    let child = master.project_to_child(at(2, 9));
    repo.insert_event(&child).unwrap();

    repo.delete_event(master.id).unwrap();

    assert!(repo.get_event(master.id).unwrap().is_none());
    let orphan = repo.get_event(child.id).unwrap().unwrap();
    assert!(orphan.master_id.is_none());
    assert!(matches!(
        repo.delete_event(master.id),
        Err(RepoError::NotFound(_))
    ));
}

#[test]
fn atomically_rolls_back_every_write_on_error() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteEventRepository::try_new(&conn).unwrap();

    let kept = Event::new("kept", at(1, 9));
    repo.insert_event(&kept).unwrap();
    let discarded = Event::new("discarded", at(1, 10));

    let result: Result<(), RepoError> = repo.atomically(|| {
        repo.insert_event(&discarded)?;
        repo.atomically(|| repo.delete_event(kept.id))?;
        Err(RepoError::NotFound(Uuid::nil()))
    });

    assert!(result.is_err());
    assert!(repo.get_event(discarded.id).unwrap().is_none());
    assert!(repo.get_event(kept.id).unwrap().is_some());
    assert!(conn.is_autocommit());
}

#[test]
fn try_new_rejects_unmigrated_connection() {
    let conn = Connection::open_in_memory().unwrap();

    let result = SqliteEventRepository::try_new(&conn);
    assert!(matches!(
        result,
        Err(RepoError::UninitializedConnection {
            actual_version: 0,
            ..
        })
    ));
}

#[test]
fn try_new_rejects_missing_column() {
    let conn = Connection::open_in_memory().unwrap();
    conn.execute_batch(
        "CREATE TABLE events (id TEXT PRIMARY KEY, title TEXT);
         PRAGMA user_version = 1;",
    )
    .unwrap();

    let result = SqliteEventRepository::try_new(&conn);
    assert!(matches!(
        result,
        Err(RepoError::MissingRequiredColumn {
            table: "events",
            column: "description",
        })
    ));
}
