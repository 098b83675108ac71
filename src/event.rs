//! The persisted event record and the live handle an operation holds on it.
//!
//! While an operation runs, the event row is keyed by its target and acts as
//! the cluster-wide lock for it; at completion the row is replaced by a
//! historical twin keyed by the event's own unique id. [EventId] models that
//! polymorphic primary key.

use std::fmt;
use std::io::{self, Write};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::EventError;
use crate::identity::{Kind, Owner, PermissionScheme, Target, Token};
use crate::lock_updater::LockUpdater;
use crate::repository::{Condition, EventRepository, FieldValue, Query, UpdateSet};

/// Primary key of a persisted event: the target while live, the event's own
/// unique id once historical. On read the composite form is tried first,
/// falling back to the opaque one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EventId {
    Target(Target),
    Unique(String),
}

impl EventId {
    /// Canonical key string stored as the document id. Field order of the
    /// composite form is stable (`name` before `value`).
    pub fn storage_key(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_storage_key(key: &str) -> Result<Self, EventError> {
        serde_json::from_str(key)
            .map_err(|e| EventError::Storage(format!("decode event id {:?}: {}", key, e)))
    }
}

/// Two-phase cancellation state. `asked` is set by [Event::try_cancel],
/// `canceled` by [Event::ack_cancel]; `canceled` implies `asked`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelInfo {
    pub owner: String,
    pub start_time: Option<DateTime<Utc>>,
    pub ack_time: Option<DateTime<Utc>>,
    pub reason: String,
    pub asked: bool,
    pub canceled: bool,
}

/// Persisted attributes of an event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub unique_id: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub target: Target,
    pub kind: Kind,
    pub owner: Owner,
    pub cancelable: bool,
    pub running: bool,
    pub lock_update_time: DateTime<Utc>,
    pub start_custom_data: Option<Value>,
    pub end_custom_data: Option<Value>,
    pub other_custom_data: Option<Value>,
    pub error: String,
    pub log: Option<String>,
    pub cancel_info: CancelInfo,
    pub remove_date: Option<DateTime<Utc>>,
}

impl fmt::Display for EventRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) running {:?} start by {} at {}",
            self.target.name,
            self.target.value,
            self.kind.name,
            self.owner,
            self.start_time.to_rfc3339(),
        )
    }
}

/// Options for opening an event.
///
/// Regular events require an identity token (or a fully specified raw owner)
/// and a permission scheme; internal events require an internal kind tag and
/// forbid both.
pub struct Opts<'a> {
    pub target: Target,
    pub kind: Option<&'a dyn PermissionScheme>,
    pub internal_kind: Option<String>,
    pub owner: Option<&'a dyn Token>,
    pub raw_owner: Option<Owner>,
    pub cancelable: bool,
    pub custom_data: Option<Value>,
}

impl<'a> Opts<'a> {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            kind: None,
            internal_kind: None,
            owner: None,
            raw_owner: None,
            cancelable: false,
            custom_data: None,
        }
    }
}

/// Cloneable writer into an event's canonical log buffer.
#[derive(Clone)]
pub struct EventLogSink {
    buffer: Arc<Mutex<String>>,
}

impl Write for EventLogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let text = String::from_utf8_lossy(buf);
        match self.buffer.lock() {
            Ok(mut buffer) => {
                buffer.push_str(&text);
                Ok(buf.len())
            }
            Err(_) => Err(io::Error::new(io::ErrorKind::Other, "log buffer poisoned")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Handle on a held event. Owned by the thread that opened the event; logs,
/// custom data and the cancellation handshake go through it, and it is
/// consumed by [Event::done] / [Event::abort].
pub struct Event {
    record: EventRecord,
    log_buffer: Arc<Mutex<String>>,
    log_writer: Option<Box<dyn Write + Send>>,
    repo: Arc<dyn EventRepository>,
    updater: Arc<LockUpdater>,
}

impl Event {
    pub(crate) fn from_record(
        record: EventRecord,
        repo: Arc<dyn EventRepository>,
        updater: Arc<LockUpdater>,
    ) -> Self {
        Self {
            record,
            log_buffer: Arc::new(Mutex::new(String::new())),
            log_writer: None,
            repo,
            updater,
        }
    }

    pub fn record(&self) -> &EventRecord {
        &self.record
    }

    pub fn unique_id(&self) -> &str {
        &self.record.unique_id
    }

    pub fn target(&self) -> &Target {
        &self.record.target
    }

    pub fn kind(&self) -> &Kind {
        &self.record.kind
    }

    pub fn owner(&self) -> &Owner {
        &self.record.owner
    }

    pub fn is_running(&self) -> bool {
        self.record.running
    }

    pub fn cancel_info(&self) -> &CancelInfo {
        &self.record.cancel_info
    }

    /// Attach an external sink receiving every log line in addition to the
    /// canonical in-memory buffer (e.g. for live streaming).
    pub fn set_log_writer(&mut self, writer: Box<dyn Write + Send>) {
        self.log_writer = Some(writer);
    }

    /// Writer into the canonical log buffer.
    pub fn log_sink(&self) -> EventLogSink {
        EventLogSink {
            buffer: Arc::clone(&self.log_buffer),
        }
    }

    /// Record a log line. The line lands in the in-memory buffer (persisted
    /// at [Event::done]), the attached external sink if any, and the process
    /// logger under a `target(value)[kind]` prefix.
    pub fn logf(&mut self, args: fmt::Arguments<'_>) {
        log::debug!(
            "{}({})[{}] {}",
            self.record.target.name,
            self.record.target.value,
            self.record.kind,
            args
        );
        let line = format!("{}\n", args);
        if let Some(writer) = self.log_writer.as_mut() {
            let _ = writer.write_all(line.as_bytes());
        }
        if let Ok(mut buffer) = self.log_buffer.lock() {
            buffer.push_str(&line);
        }
    }

    /// Ask the operation to cancel. Sets `cancel_info.asked` on the live row
    /// and refreshes this handle with the new state. The owning code must
    /// poll `cancel_info.asked` and acknowledge via [Event::ack_cancel];
    /// there is no forced preemption.
    pub fn try_cancel(&mut self, reason: &str, owner: &str) -> Result<(), EventError> {
        if !self.record.cancelable || !self.record.running {
            return Err(EventError::NotCancelable);
        }
        let query = Query::by_id(&self.record.id);
        let update = UpdateSet::new()
            .set("cancelinfo.owner", FieldValue::Str(owner.to_string()))
            .set("cancelinfo.reason", FieldValue::Str(reason.to_string()))
            .set("cancelinfo.starttime", FieldValue::Time(Utc::now()))
            .set("cancelinfo.acktime", FieldValue::Null)
            .set("cancelinfo.asked", FieldValue::Bool(true))
            .set("cancelinfo.canceled", FieldValue::Bool(false));
        self.record = self.repo.find_and_modify(&query, &update)?;
        Ok(())
    }

    /// Acknowledge a pending cancel request. Requires the live row to carry
    /// `cancel_info.asked`; fails with [EventError::NotFound] otherwise. The
    /// resulting `canceled` flag is consumed by [Event::done] to populate the
    /// error field.
    pub fn ack_cancel(&mut self) -> Result<(), EventError> {
        if !self.record.cancelable || !self.record.running {
            return Err(EventError::NotCancelable);
        }
        let mut query = Query::by_id(&self.record.id);
        query.push("cancelinfo.asked", Condition::Eq(FieldValue::Bool(true)));
        let update = UpdateSet::new()
            .set("cancelinfo.acktime", FieldValue::Time(Utc::now()))
            .set("cancelinfo.canceled", FieldValue::Bool(true));
        self.record = self.repo.find_and_modify(&query, &update)?;
        Ok(())
    }

    /// Write `other_custom_data` on the live row. Does not interact with the
    /// lifecycle; [Event::done] re-reads it before finalizing.
    pub fn set_other_custom_data(&self, data: Value) -> Result<(), EventError> {
        let update = UpdateSet::new().set("othercustomdata", FieldValue::Json(data));
        self.repo.update_one(&self.record.id, &update)
    }

    pub fn start_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        decode_custom(self.record.start_custom_data.as_ref())
    }

    pub fn end_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        decode_custom(self.record.end_custom_data.as_ref())
    }

    pub fn other_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        decode_custom(self.record.other_custom_data.as_ref())
    }

    /// Finalize the event: swap the live row for a historical twin carrying
    /// end time, captured log and error state.
    pub fn done(self, evt_err: Option<&str>) -> Result<(), EventError> {
        self.finish(evt_err, None, false)
    }

    /// Like [Event::done], also persisting `end_custom_data`.
    pub fn done_custom_data(self, evt_err: Option<&str>, data: Value) -> Result<(), EventError> {
        self.finish(evt_err, Some(data), false)
    }

    /// Drop the live row outright, leaving no historical twin. For
    /// operations that never meaningfully began.
    pub fn abort(self) -> Result<(), EventError> {
        self.finish(None, None, true)
    }

    fn finish(
        mut self,
        evt_err: Option<&str>,
        custom_data: Option<Value>,
        abort: bool,
    ) -> Result<(), EventError> {
        // Callers typically invoke done as a guaranteed-cleanup step and
        // ignore the result, so failures are logged here as well.
        let descr = self.record.to_string();
        let result = self.finish_inner(evt_err, custom_data, abort);
        if let Err(err) = &result {
            log::error!("[events] error marking event as done - {}: {}", descr, err);
        }
        result
    }

    fn finish_inner(
        &mut self,
        evt_err: Option<&str>,
        custom_data: Option<Value>,
        abort: bool,
    ) -> Result<(), EventError> {
        self.updater.remove(&self.record.target);
        if abort {
            return self.repo.remove_by_id(&self.record.id);
        }
        if let Some(message) = evt_err {
            self.record.error = message.to_string();
        } else if self.record.cancel_info.canceled {
            self.record.error = "canceled by user request".to_string();
        }
        self.record.end_time = Some(Utc::now());
        self.record.end_custom_data = custom_data;
        self.record.running = false;
        self.record.log = Some(self.log_snapshot());
        // Pick up other_custom_data written concurrently through other handles.
        if let Ok(current) = self.repo.find_by_id(&self.record.id) {
            self.record.other_custom_data = current.other_custom_data;
        }
        let live_id = std::mem::replace(
            &mut self.record.id,
            EventId::Unique(self.record.unique_id.clone()),
        );
        // Insert the historical twin before removing the live row: a crash in
        // between leaves a duplicate rather than losing the audit record.
        self.repo.insert(&self.record)?;
        self.repo.remove_by_id(&live_id)
    }

    fn log_snapshot(&self) -> String {
        match self.log_buffer.lock() {
            Ok(buffer) => buffer.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

fn decode_custom<T: DeserializeOwned>(value: Option<&Value>) -> Result<T, serde_json::Error> {
    serde_json::from_value(value.cloned().unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::OwnerType;

    #[test]
    fn event_id_storage_key_forms() {
        let live = EventId::Target(Target::new("app", "web"));
        assert_eq!(live.storage_key(), r#"{"name":"app","value":"web"}"#);
        let historical = EventId::Unique("abc123".to_string());
        assert_eq!(historical.storage_key(), r#""abc123""#);
    }

    #[test]
    fn event_id_decodes_composite_first_then_opaque() {
        let live = EventId::from_storage_key(r#"{"name":"app","value":"web"}"#)
            .expect("decode composite id");
        assert_eq!(live, EventId::Target(Target::new("app", "web")));
        let historical = EventId::from_storage_key(r#""abc123""#).expect("decode opaque id");
        assert_eq!(historical, EventId::Unique("abc123".to_string()));
        assert!(EventId::from_storage_key("{broken").is_err());
    }

    #[test]
    fn event_record_display() {
        let record = sample_record();
        let text = record.to_string();
        assert!(text.starts_with(r#"app(web) running "app.update" start by user alice at "#));
    }

    #[test]
    fn log_sink_appends_to_buffer() {
        let buffer = Arc::new(Mutex::new(String::new()));
        let mut sink = EventLogSink {
            buffer: Arc::clone(&buffer),
        };
        sink.write_all(b"line one\n").expect("write to sink");
        sink.write_all(b"line two\n").expect("write to sink");
        assert_eq!(&*buffer.lock().expect("buffer lock"), "line one\nline two\n");
    }

    #[test]
    fn custom_data_round_trips_through_value() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Payload {
            image: String,
            steps: u32,
        }
        let mut record = sample_record();
        record.start_custom_data = Some(serde_json::json!({"image": "v2", "steps": 3}));
        let decoded: Payload =
            decode_custom(record.start_custom_data.as_ref()).expect("decode payload");
        assert_eq!(
            decoded,
            Payload {
                image: "v2".to_string(),
                steps: 3
            }
        );
        let missing: Option<Payload> =
            decode_custom(record.end_custom_data.as_ref()).expect("decode absent payload");
        assert_eq!(missing, None);
    }

    fn sample_record() -> EventRecord {
        let now = Utc::now();
        EventRecord {
            id: EventId::Target(Target::new("app", "web")),
            unique_id: "u-1".to_string(),
            start_time: now,
            end_time: None,
            target: Target::new("app", "web"),
            kind: Kind::permission("app.update"),
            owner: Owner::new(OwnerType::User, "alice"),
            cancelable: false,
            running: true,
            lock_update_time: now,
            start_custom_data: None,
            end_custom_data: None,
            other_custom_data: None,
            error: String::new(),
            log: None,
            cancel_info: CancelInfo::default(),
            remove_date: None,
        }
    }
}
