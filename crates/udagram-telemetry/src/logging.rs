//! Warn+ events persisted to SQLite, tagged with the connection and upload
//! they concern. The table is append-only; nothing in the process reads it
//! back, it is there for operators with `sqlite3`.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS warnings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        logged_at TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        connection_id TEXT,
        image_id TEXT,
        object_key TEXT,
        extra TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_warnings_connection ON warnings(connection_id);
    CREATE INDEX IF NOT EXISTS idx_warnings_image ON warnings(image_id);
";

/// Append-only SQLite table of warn+ events.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // A failed write cannot be logged without recursing into this layer.
    fn append(&self, row: &WarnRow) {
        let _ = self.conn.lock().execute(
            "INSERT INTO warnings (logged_at, level, target, message, connection_id, image_id, object_key, extra)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                row.logged_at,
                row.level,
                row.target,
                row.message,
                row.tags.connection_id,
                row.tags.image_id,
                row.tags.object_key,
                row.extra,
            ],
        );
    }
}

struct WarnRow {
    logged_at: String,
    level: &'static str,
    target: String,
    message: String,
    tags: Tags,
    extra: Option<String>,
}

/// Which connection and upload an event belongs to. Stored on spans too, so
/// events inside a broadcast cycle pick up the cycle's image.
#[derive(Clone, Default)]
struct Tags {
    connection_id: Option<String>,
    image_id: Option<String>,
    object_key: Option<String>,
}

impl Tags {
    fn is_empty(&self) -> bool {
        self.connection_id.is_none() && self.image_id.is_none() && self.object_key.is_none()
    }

    fn is_complete(&self) -> bool {
        self.connection_id.is_some() && self.image_id.is_some() && self.object_key.is_some()
    }

    /// Fill unset tags from an enclosing span. Inner values win.
    fn inherit(&mut self, outer: &Tags) {
        for (mine, theirs) in [
            (&mut self.connection_id, &outer.connection_id),
            (&mut self.image_id, &outer.image_id),
            (&mut self.object_key, &outer.object_key),
        ] {
            if mine.is_none() {
                mine.clone_from(theirs);
            }
        }
    }

    fn slot(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            "connection_id" => Some(&mut self.connection_id),
            "image_id" => Some(&mut self.image_id),
            "key" | "object_key" => Some(&mut self.object_key),
            _ => None,
        }
    }
}

#[derive(Default)]
struct Collector {
    message: Option<String>,
    tags: Tags,
    extra: Map<String, Value>,
}

impl Collector {
    fn text(&mut self, name: &str, value: String) {
        if name == "message" {
            self.message = Some(value);
        } else if let Some(slot) = self.tags.slot(name) {
            *slot = Some(value);
        } else {
            self.extra.insert(name.to_owned(), Value::String(value));
        }
    }
}

impl Visit for Collector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.text(field.name(), format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.text(field.name(), value.to_owned());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.extra.insert(field.name().to_owned(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.extra.insert(field.name().to_owned(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.extra.insert(field.name().to_owned(), value.into());
    }
}

/// tracing Layer that hands warn+ events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut collector = Collector::default();
        attrs.record(&mut collector);
        if collector.tags.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(collector.tags);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut collector = Collector::default();
        event.record(&mut collector);

        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if collector.tags.is_complete() {
                    break;
                }
                if let Some(outer) = span.extensions().get::<Tags>() {
                    collector.tags.inherit(outer);
                }
            }
        }

        let extra = (!collector.extra.is_empty())
            .then(|| Value::Object(collector.extra).to_string());

        self.sink.append(&WarnRow {
            logged_at: Utc::now().to_rfc3339(),
            level: level.as_str(),
            target: event.metadata().target().to_owned(),
            message: collector.message.unwrap_or_default(),
            tags: collector.tags,
            extra,
        });
    }
}
