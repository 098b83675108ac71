//! SQLite-backed event repository.
//!
//! Events are stored in a single `events` table whose TEXT primary key holds
//! the serialized [EventId]; the primary-key constraint is what makes a live
//! insert an atomic lock acquisition. Abstract queries and updates are
//! rendered to SQL through a fixed field-path → column mapping, so callers
//! never touch column names.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};

use crate::error::EventError;
use crate::event::{CancelInfo, EventId, EventRecord};
use crate::identity::{Kind, KindType, Owner, OwnerType, Target};
use crate::repository::{Condition, EventRepository, FieldValue, Query, Sort, UpdateSet};

const SCHEMA_VERSION: i64 = 1;

const EVENT_COLUMNS: &str = "id, uniqueid, starttime_ms, endtime_ms, lockupdatetime_ms, \
     removedate_ms, target_name, target_value, kind_type, kind_name, owner_type, owner_name, \
     cancelable, running, cancel_owner, cancel_reason, cancel_starttime_ms, cancel_acktime_ms, \
     cancel_asked, cancel_canceled, startcustomdata, endcustomdata, othercustomdata, error, log";

#[derive(Clone)]
pub struct SqliteEventRepository {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteEventRepository {
    pub fn open(path: &str) -> Result<Self, EventError> {
        let conn = Connection::open(path)
            .map_err(|e| EventError::Storage(format!("open sqlite event store: {}", e)))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| EventError::Storage(format!("set journal_mode: {}", e)))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| EventError::Storage(format!("set synchronous: {}", e)))?;
        let repo = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        repo.ensure_schema()?;
        Ok(repo)
    }

    fn ensure_schema(&self) -> Result<(), EventError> {
        let conn = self.lock_conn()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS events_schema_migrations (
                version INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                applied_at_ms INTEGER NOT NULL
            );
            ",
        )
        .map_err(|e| EventError::Storage(format!("ensure migration table: {}", e)))?;
        let current: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM events_schema_migrations",
                [],
                |row| row.get(0),
            )
            .map_err(|e| EventError::Storage(format!("read schema version: {}", e)))?;
        if current > SCHEMA_VERSION {
            return Err(EventError::Storage(format!(
                "events schema version {} is newer than supported {}",
                current, SCHEMA_VERSION
            )));
        }
        if current < 1 {
            conn.execute_batch(
                "
                CREATE TABLE IF NOT EXISTS events (
                    id TEXT PRIMARY KEY,
                    uniqueid TEXT NOT NULL,
                    starttime_ms INTEGER NOT NULL,
                    endtime_ms INTEGER NULL,
                    lockupdatetime_ms INTEGER NOT NULL,
                    removedate_ms INTEGER NULL,
                    target_name TEXT NOT NULL,
                    target_value TEXT NOT NULL,
                    kind_type TEXT NOT NULL,
                    kind_name TEXT NOT NULL,
                    owner_type TEXT NOT NULL,
                    owner_name TEXT NOT NULL,
                    cancelable INTEGER NOT NULL DEFAULT 0,
                    running INTEGER NOT NULL DEFAULT 0,
                    cancel_owner TEXT NOT NULL DEFAULT '',
                    cancel_reason TEXT NOT NULL DEFAULT '',
                    cancel_starttime_ms INTEGER NULL,
                    cancel_acktime_ms INTEGER NULL,
                    cancel_asked INTEGER NOT NULL DEFAULT 0,
                    cancel_canceled INTEGER NOT NULL DEFAULT 0,
                    startcustomdata TEXT NULL,
                    endcustomdata TEXT NULL,
                    othercustomdata TEXT NULL,
                    error TEXT NOT NULL DEFAULT '',
                    log TEXT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_events_uniqueid ON events(uniqueid);
                CREATE INDEX IF NOT EXISTS idx_events_target_start
                    ON events(target_name, target_value, starttime_ms);
                ",
            )
            .map_err(|e| EventError::Storage(format!("apply events schema v1: {}", e)))?;
            conn.execute(
                "INSERT INTO events_schema_migrations (version, name, applied_at_ms)
                 VALUES (1, 'baseline_events_table', ?1)",
                params![dt_to_ms(Utc::now())],
            )
            .map_err(|e| EventError::Storage(format!("record events schema v1: {}", e)))?;
        }
        Ok(())
    }

    fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>, EventError> {
        self.conn
            .lock()
            .map_err(|_| EventError::Storage("sqlite event store lock poisoned".to_string()))
    }
}

fn dt_to_ms(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

fn ms_to_dt(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Field-path → column mapping shared by queries, updates and sorts.
fn column_for(field: &str) -> Result<&'static str, EventError> {
    let column = match field {
        "_id" | "id" => "id",
        "uniqueid" => "uniqueid",
        "starttime" => "starttime_ms",
        "endtime" => "endtime_ms",
        "lockupdatetime" => "lockupdatetime_ms",
        "removedate" => "removedate_ms",
        "target.name" => "target_name",
        "target.value" => "target_value",
        "kind.type" => "kind_type",
        "kind.name" => "kind_name",
        "owner.type" => "owner_type",
        "owner.name" => "owner_name",
        "cancelable" => "cancelable",
        "running" => "running",
        "cancelinfo.owner" => "cancel_owner",
        "cancelinfo.reason" => "cancel_reason",
        "cancelinfo.starttime" => "cancel_starttime_ms",
        "cancelinfo.acktime" => "cancel_acktime_ms",
        "cancelinfo.asked" => "cancel_asked",
        "cancelinfo.canceled" => "cancel_canceled",
        "startcustomdata" => "startcustomdata",
        "endcustomdata" => "endcustomdata",
        "othercustomdata" => "othercustomdata",
        "error" => "error",
        "log" => "log",
        other => {
            return Err(EventError::Storage(format!(
                "unknown event field path: {}",
                other
            )))
        }
    };
    Ok(column)
}

fn field_to_sql(value: &FieldValue) -> Result<SqlValue, EventError> {
    Ok(match value {
        FieldValue::Str(s) => SqlValue::Text(s.clone()),
        FieldValue::Bool(b) => SqlValue::Integer(*b as i64),
        FieldValue::Int(i) => SqlValue::Integer(*i),
        FieldValue::Time(t) => SqlValue::Integer(dt_to_ms(*t)),
        FieldValue::Json(v) => SqlValue::Text(
            serde_json::to_string(v)
                .map_err(|e| EventError::Storage(format!("encode custom data: {}", e)))?,
        ),
        FieldValue::Null => SqlValue::Null,
    })
}

fn render_where(query: &Query) -> Result<(String, Vec<SqlValue>), EventError> {
    let mut sql = String::new();
    let mut args = Vec::new();
    for (field, condition) in query.clauses() {
        if !sql.is_empty() {
            sql.push_str(" AND ");
        }
        let column = column_for(field)?;
        match condition {
            Condition::Eq(FieldValue::Null) => {
                sql.push_str(column);
                sql.push_str(" IS NULL");
            }
            Condition::Eq(value) => {
                sql.push_str(column);
                sql.push_str(" = ?");
                args.push(field_to_sql(value)?);
            }
            Condition::Gt(value) => {
                sql.push_str(column);
                sql.push_str(" > ?");
                args.push(field_to_sql(value)?);
            }
            Condition::Gte(value) => {
                sql.push_str(column);
                sql.push_str(" >= ?");
                args.push(field_to_sql(value)?);
            }
            Condition::Lte(value) => {
                sql.push_str(column);
                sql.push_str(" <= ?");
                args.push(field_to_sql(value)?);
            }
            Condition::In(values) => {
                if values.is_empty() {
                    // An empty id set matches nothing.
                    sql.push_str("1 = 0");
                } else {
                    sql.push_str(column);
                    sql.push_str(" IN (");
                    for (i, value) in values.iter().enumerate() {
                        if i > 0 {
                            sql.push_str(", ");
                        }
                        sql.push('?');
                        args.push(field_to_sql(value)?);
                    }
                    sql.push(')');
                }
            }
            Condition::Exists(true) => {
                sql.push_str(column);
                sql.push_str(" IS NOT NULL");
            }
            Condition::Exists(false) => {
                sql.push_str(column);
                sql.push_str(" IS NULL");
            }
        }
    }
    if sql.is_empty() {
        sql.push_str("1 = 1");
    }
    Ok((sql, args))
}

fn render_set(update: &UpdateSet) -> Result<(String, Vec<SqlValue>), EventError> {
    let mut sql = String::new();
    let mut args = Vec::new();
    for (field, value) in update.sets() {
        if !sql.is_empty() {
            sql.push_str(", ");
        }
        sql.push_str(column_for(field)?);
        match value {
            FieldValue::Null => sql.push_str(" = NULL"),
            other => {
                sql.push_str(" = ?");
                args.push(field_to_sql(other)?);
            }
        }
    }
    if sql.is_empty() {
        return Err(EventError::Storage("empty update set".to_string()));
    }
    Ok((sql, args))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> Result<EventRecord, rusqlite::Error> {
    let id_key: String = row.get(0)?;
    let id = EventId::from_storage_key(&id_key).map_err(|e| invalid_row(0, &e.to_string()))?;
    let kind_type: String = row.get(8)?;
    let kind_type = KindType::parse(&kind_type)
        .ok_or_else(|| invalid_row(8, &format!("unknown kind type {:?}", kind_type)))?;
    let owner_type: String = row.get(10)?;
    let owner_type = OwnerType::parse(&owner_type)
        .ok_or_else(|| invalid_row(10, &format!("unknown owner type {:?}", owner_type)))?;
    Ok(EventRecord {
        id,
        unique_id: row.get(1)?,
        start_time: ms_to_dt(row.get(2)?),
        end_time: row.get::<_, Option<i64>>(3)?.map(ms_to_dt),
        lock_update_time: ms_to_dt(row.get(4)?),
        remove_date: row.get::<_, Option<i64>>(5)?.map(ms_to_dt),
        target: Target::new(row.get::<_, String>(6)?, row.get::<_, String>(7)?),
        kind: Kind {
            kind_type,
            name: row.get(9)?,
        },
        owner: Owner {
            owner_type,
            name: row.get(11)?,
        },
        cancelable: row.get(12)?,
        running: row.get(13)?,
        cancel_info: CancelInfo {
            owner: row.get(14)?,
            reason: row.get(15)?,
            start_time: row.get::<_, Option<i64>>(16)?.map(ms_to_dt),
            ack_time: row.get::<_, Option<i64>>(17)?.map(ms_to_dt),
            asked: row.get(18)?,
            canceled: row.get(19)?,
        },
        start_custom_data: decode_json_column(row, 20)?,
        end_custom_data: decode_json_column(row, 21)?,
        other_custom_data: decode_json_column(row, 22)?,
        error: row.get(23)?,
        log: row.get(24)?,
    })
}

fn decode_json_column(
    row: &rusqlite::Row<'_>,
    index: usize,
) -> Result<Option<serde_json::Value>, rusqlite::Error> {
    let raw: Option<String> = row.get(index)?;
    match raw {
        None => Ok(None),
        Some(text) => serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| invalid_row(index, &format!("decode custom data: {}", e))),
    }
}

fn invalid_row(index: usize, message: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        message.to_string().into(),
    )
}

fn encode_json_column(value: &Option<serde_json::Value>) -> Result<Option<String>, EventError> {
    value
        .as_ref()
        .map(|v| {
            serde_json::to_string(v)
                .map_err(|e| EventError::Storage(format!("encode custom data: {}", e)))
        })
        .transpose()
}

impl EventRepository for SqliteEventRepository {
    fn insert(&self, record: &EventRecord) -> Result<(), EventError> {
        let conn = self.lock_conn()?;
        let id_key = record.id.storage_key();
        let result = conn.execute(
            &format!(
                "INSERT INTO events ({}) VALUES \
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, \
                 ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25)",
                EVENT_COLUMNS
            ),
            params![
                id_key,
                record.unique_id,
                dt_to_ms(record.start_time),
                record.end_time.map(dt_to_ms),
                dt_to_ms(record.lock_update_time),
                record.remove_date.map(dt_to_ms),
                record.target.name,
                record.target.value,
                record.kind.kind_type.as_str(),
                record.kind.name,
                record.owner.owner_type.as_str(),
                record.owner.name,
                record.cancelable,
                record.running,
                record.cancel_info.owner,
                record.cancel_info.reason,
                record.cancel_info.start_time.map(dt_to_ms),
                record.cancel_info.ack_time.map(dt_to_ms),
                record.cancel_info.asked,
                record.cancel_info.canceled,
                encode_json_column(&record.start_custom_data)?,
                encode_json_column(&record.end_custom_data)?,
                encode_json_column(&record.other_custom_data)?,
                record.error,
                record.log,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(EventError::DuplicateKey(id_key))
            }
            Err(e) => Err(EventError::Storage(format!("insert event: {}", e))),
        }
    }

    fn find_by_id(&self, id: &EventId) -> Result<EventRecord, EventError> {
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
            params![id.storage_key()],
            row_to_record,
        )
        .optional()
        .map_err(|e| EventError::Storage(format!("find event by id: {}", e)))?
        .ok_or(EventError::NotFound)
    }

    fn find_one(&self, query: &Query) -> Result<EventRecord, EventError> {
        let (where_sql, args) = render_where(query)?;
        let conn = self.lock_conn()?;
        conn.query_row(
            &format!(
                "SELECT {} FROM events WHERE {} LIMIT 1",
                EVENT_COLUMNS, where_sql
            ),
            rusqlite::params_from_iter(args),
            row_to_record,
        )
        .optional()
        .map_err(|e| EventError::Storage(format!("find event: {}", e)))?
        .ok_or(EventError::NotFound)
    }

    fn find_and_modify(
        &self,
        query: &Query,
        update: &UpdateSet,
    ) -> Result<EventRecord, EventError> {
        let (where_sql, where_args) = render_where(query)?;
        let (set_sql, set_args) = render_set(update)?;
        let mut conn = self.lock_conn()?;
        let tx = conn
            .transaction()
            .map_err(|e| EventError::Storage(format!("begin find-and-modify tx: {}", e)))?;
        let matched: Option<String> = tx
            .query_row(
                &format!("SELECT id FROM events WHERE {} LIMIT 1", where_sql),
                rusqlite::params_from_iter(where_args),
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| EventError::Storage(format!("match find-and-modify: {}", e)))?;
        let Some(id_key) = matched else {
            return Err(EventError::NotFound);
        };
        let mut args = set_args;
        args.push(SqlValue::Text(id_key.clone()));
        tx.execute(
            &format!("UPDATE events SET {} WHERE id = ?", set_sql),
            rusqlite::params_from_iter(args),
        )
        .map_err(|e| EventError::Storage(format!("apply find-and-modify: {}", e)))?;
        let record = tx
            .query_row(
                &format!("SELECT {} FROM events WHERE id = ?1", EVENT_COLUMNS),
                params![id_key],
                row_to_record,
            )
            .map_err(|e| EventError::Storage(format!("reread find-and-modify: {}", e)))?;
        tx.commit()
            .map_err(|e| EventError::Storage(format!("commit find-and-modify: {}", e)))?;
        Ok(record)
    }

    fn update_one(&self, id: &EventId, update: &UpdateSet) -> Result<(), EventError> {
        let (set_sql, set_args) = render_set(update)?;
        let conn = self.lock_conn()?;
        let mut args = set_args;
        args.push(SqlValue::Text(id.storage_key()));
        let updated = conn
            .execute(
                &format!("UPDATE events SET {} WHERE id = ?", set_sql),
                rusqlite::params_from_iter(args),
            )
            .map_err(|e| EventError::Storage(format!("update event: {}", e)))?;
        if updated == 0 {
            return Err(EventError::NotFound);
        }
        Ok(())
    }

    fn update_many(&self, query: &Query, update: &UpdateSet) -> Result<u64, EventError> {
        let (where_sql, where_args) = render_where(query)?;
        let (set_sql, set_args) = render_set(update)?;
        let conn = self.lock_conn()?;
        let mut args = set_args;
        args.extend(where_args);
        let updated = conn
            .execute(
                &format!("UPDATE events SET {} WHERE {}", set_sql, where_sql),
                rusqlite::params_from_iter(args),
            )
            .map_err(|e| EventError::Storage(format!("update events: {}", e)))?;
        Ok(updated as u64)
    }

    fn remove_by_id(&self, id: &EventId) -> Result<(), EventError> {
        let conn = self.lock_conn()?;
        let removed = conn
            .execute(
                "DELETE FROM events WHERE id = ?1",
                params![id.storage_key()],
            )
            .map_err(|e| EventError::Storage(format!("remove event: {}", e)))?;
        if removed == 0 {
            return Err(EventError::NotFound);
        }
        Ok(())
    }

    fn count(&self, query: &Query) -> Result<usize, EventError> {
        let (where_sql, args) = render_where(query)?;
        let conn = self.lock_conn()?;
        let count: i64 = conn
            .query_row(
                &format!("SELECT COUNT(*) FROM events WHERE {}", where_sql),
                rusqlite::params_from_iter(args),
                |row| row.get(0),
            )
            .map_err(|e| EventError::Storage(format!("count events: {}", e)))?;
        Ok(count as usize)
    }

    fn list(
        &self,
        query: &Query,
        sort: &Sort,
        limit: usize,
        skip: usize,
    ) -> Result<Vec<EventRecord>, EventError> {
        let (where_sql, args) = render_where(query)?;
        let order_column = column_for(&sort.field)?;
        let direction = if sort.descending { "DESC" } else { "ASC" };
        let limit_sql = if limit > 0 { limit as i64 } else { -1 };
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM events WHERE {} ORDER BY {} {} LIMIT {} OFFSET {}",
                EVENT_COLUMNS, where_sql, order_column, direction, limit_sql, skip
            ))
            .map_err(|e| EventError::Storage(format!("prepare list events: {}", e)))?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), row_to_record)
            .map_err(|e| EventError::Storage(format!("query list events: {}", e)))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| EventError::Storage(format!("scan list events: {}", e)))?);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use chrono::Duration;

    use super::*;
    use crate::identity::{Kind, Owner, OwnerType};

    fn temp_sqlite_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("oplock-{}-{}.db", name, uuid::Uuid::new_v4()))
    }

    fn open_repo(name: &str) -> (SqliteEventRepository, PathBuf) {
        let path = temp_sqlite_path(name);
        let repo =
            SqliteEventRepository::open(&path.to_string_lossy()).expect("open sqlite event store");
        (repo, path)
    }

    fn record(target: Target, unique_id: &str, start: DateTime<Utc>) -> EventRecord {
        EventRecord {
            id: EventId::Target(target.clone()),
            unique_id: unique_id.to_string(),
            start_time: start,
            end_time: None,
            target,
            kind: Kind::permission("app.update"),
            owner: Owner::new(OwnerType::User, "alice"),
            cancelable: false,
            running: true,
            lock_update_time: start,
            start_custom_data: None,
            end_custom_data: None,
            other_custom_data: None,
            error: String::new(),
            log: None,
            cancel_info: CancelInfo::default(),
            remove_date: None,
        }
    }

    #[test]
    fn insert_and_find_round_trip() {
        let (repo, path) = open_repo("roundtrip");
        let mut evt = record(Target::new("app", "web"), "u-1", Utc::now());
        evt.start_custom_data = Some(serde_json::json!({"image": "v2"}));
        repo.insert(&evt).expect("insert event");

        let found = repo.find_by_id(&evt.id).expect("find live event");
        assert_eq!(found.unique_id, "u-1");
        assert_eq!(found.target, Target::new("app", "web"));
        assert_eq!(found.id, EventId::Target(Target::new("app", "web")));
        assert_eq!(
            found.start_custom_data,
            Some(serde_json::json!({"image": "v2"}))
        );
        assert!(found.running);
        assert_eq!(found.end_time, None);
        assert_eq!(found.log, None);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn duplicate_insert_reports_duplicate_key() {
        let (repo, path) = open_repo("duplicate");
        let evt = record(Target::new("app", "web"), "u-1", Utc::now());
        repo.insert(&evt).expect("first insert");

        let mut second = record(Target::new("app", "web"), "u-2", Utc::now());
        second.owner = Owner::new(OwnerType::User, "bob");
        let err = repo.insert(&second).expect_err("conflicting insert");
        assert!(matches!(err, EventError::DuplicateKey(_)));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn find_one_by_uniqueid() {
        let (repo, path) = open_repo("find-one");
        let evt = record(Target::new("app", "web"), "u-9", Utc::now());
        repo.insert(&evt).expect("insert event");

        let mut query = Query::new();
        query.push(
            "uniqueid",
            Condition::Eq(FieldValue::Str("u-9".to_string())),
        );
        let found = repo.find_one(&query).expect("find by unique id");
        assert_eq!(found.unique_id, "u-9");

        query.set(
            "uniqueid",
            Condition::Eq(FieldValue::Str("missing".to_string())),
        );
        assert!(matches!(
            repo.find_one(&query),
            Err(EventError::NotFound)
        ));

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn find_and_modify_honors_guard_clause() {
        let (repo, path) = open_repo("fam-guard");
        let evt = record(Target::new("app", "web"), "u-1", Utc::now());
        repo.insert(&evt).expect("insert event");

        // The guard requires cancelinfo.asked, which is still false.
        let mut guarded = Query::by_id(&evt.id);
        guarded.push("cancelinfo.asked", Condition::Eq(FieldValue::Bool(true)));
        let update = UpdateSet::new().set("cancelinfo.canceled", FieldValue::Bool(true));
        assert!(matches!(
            repo.find_and_modify(&guarded, &update),
            Err(EventError::NotFound)
        ));

        let ask = UpdateSet::new().set("cancelinfo.asked", FieldValue::Bool(true));
        repo.update_one(&evt.id, &ask).expect("mark asked");
        let modified = repo
            .find_and_modify(&guarded, &update)
            .expect("guard now matches");
        assert!(modified.cancel_info.asked);
        assert!(modified.cancel_info.canceled);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn update_many_and_exists_filter() {
        let (repo, path) = open_repo("update-many");
        let start = Utc::now();
        repo.insert(&record(Target::new("app", "a"), "u-1", start))
            .expect("insert first");
        let mut historical = record(Target::new("app", "a"), "u-2", start - Duration::minutes(5));
        historical.id = EventId::Unique("u-2".to_string());
        historical.running = false;
        repo.insert(&historical).expect("insert second");

        let mut by_target = Query::new();
        by_target.push(
            "target.name",
            Condition::Eq(FieldValue::Str("app".to_string())),
        );
        by_target.push(
            "target.value",
            Condition::Eq(FieldValue::Str("a".to_string())),
        );
        by_target.push("removedate", Condition::Exists(false));
        let marked = repo
            .update_many(
                &by_target,
                &UpdateSet::new().set("removedate", FieldValue::Time(Utc::now())),
            )
            .expect("mark removed");
        assert_eq!(marked, 2);

        // A second pass matches nothing: removedate is now set everywhere.
        let marked_again = repo
            .update_many(
                &by_target,
                &UpdateSet::new().set("removedate", FieldValue::Time(Utc::now())),
            )
            .expect("mark removed again");
        assert_eq!(marked_again, 0);

        let mut removed = Query::new();
        removed.push("removedate", Condition::Exists(true));
        assert_eq!(repo.count(&removed).expect("count removed"), 2);

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn list_applies_sort_limit_and_skip() {
        let (repo, path) = open_repo("list");
        let base = Utc::now();
        for i in 0..5 {
            let mut evt = record(
                Target::new("app", format!("svc-{}", i)),
                &format!("u-{}", i),
                base + Duration::seconds(i),
            );
            evt.id = EventId::Unique(format!("u-{}", i));
            evt.running = false;
            repo.insert(&evt).expect("insert event");
        }

        let all = repo
            .list(&Query::new(), &Sort::default(), 0, 0)
            .expect("list all");
        assert_eq!(all.len(), 5);
        assert_eq!(all[0].unique_id, "u-4");

        let page = repo
            .list(&Query::new(), &Sort::default(), 2, 1)
            .expect("list page");
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].unique_id, "u-3");
        assert_eq!(page[1].unique_id, "u-2");

        let ascending = repo
            .list(&Query::new(), &Sort::parse("starttime"), 1, 0)
            .expect("list ascending");
        assert_eq!(ascending[0].unique_id, "u-0");

        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn remove_by_id_and_not_found() {
        let (repo, path) = open_repo("remove");
        let evt = record(Target::new("app", "web"), "u-1", Utc::now());
        repo.insert(&evt).expect("insert event");
        repo.remove_by_id(&evt.id).expect("remove event");
        assert!(matches!(
            repo.remove_by_id(&evt.id),
            Err(EventError::NotFound)
        ));
        assert!(matches!(
            repo.find_by_id(&evt.id),
            Err(EventError::NotFound)
        ));

        let _ = std::fs::remove_file(path);
    }
}
