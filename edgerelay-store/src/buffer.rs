//! SQLite-backed local buffer
//!
//! See the crate documentation for the schema and lifecycle.

use crate::error::{StorageError, StorageResult};
use chrono::{DateTime, SecondsFormat, Utc};
use edgerelay_core::{LogContext, Measurement, MeasurementKind, Reading, Value};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashSet;
use std::path::Path;

/// A reading parked in the buffer, with its row identity
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedReading {
    /// Monotonic row id; later appends get larger ids
    pub id: i64,
    pub reading: Reading,
}

/// Durable queue of undelivered readings for one device
pub struct LocalBuffer {
    connection: Connection,
    table: String,
    columns: Vec<Measurement>,
    /// Table exists with every configured column
    ready: bool,
    log: LogContext,
}

impl LocalBuffer {
    /// Open (or create) the database file at `path`
    pub fn open<P: AsRef<Path>>(
        path: P,
        device: &str,
        columns: &[Measurement],
        log: LogContext,
    ) -> StorageResult<Self> {
        let connection = Connection::open(path.as_ref())?;
        connection.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        connection.pragma_update(None, "synchronous", "FULL")?;
        log::debug!(target: log.target(), "opened buffer at {}", path.as_ref().display());
        Ok(Self::with_connection(connection, device, columns, log))
    }

    /// Buffer that lives only as long as the process, for tests and dry runs
    pub fn open_in_memory(
        device: &str,
        columns: &[Measurement],
        log: LogContext,
    ) -> StorageResult<Self> {
        Ok(Self::with_connection(Connection::open_in_memory()?, device, columns, log))
    }

    fn with_connection(
        connection: Connection,
        device: &str,
        columns: &[Measurement],
        log: LogContext,
    ) -> Self {
        let mut columns = columns.to_vec();
        columns.sort_unstable();
        columns.dedup();
        Self {
            connection,
            table: table_name(device),
            columns,
            ready: false,
            log,
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Persist one reading
    ///
    /// Creates the table on first use. Measurements outside the configured
    /// column set are ignored; configured measurements missing from the reading
    /// are stored as NULL.
    pub fn append(&mut self, reading: &Reading) -> StorageResult<()> {
        self.ensure_table()?;

        let mut names = vec![quote("time")];
        let mut values = vec![SqlValue::Text(encode_time(reading.time()))];
        for &measurement in &self.columns {
            names.push(quote(measurement.as_str()));
            values.push(match reading.get(measurement) {
                Some(Value::Numeric(v)) => SqlValue::Real(*v),
                Some(Value::Label(label)) => SqlValue::Text(label.clone()),
                Some(Value::Unavailable) | None => SqlValue::Null,
            });
        }
        let placeholders: Vec<String> = (1..=values.len()).map(|i| format!("?{i}")).collect();

        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote(&self.table),
            names.join(", "),
            placeholders.join(", ")
        );
        self.connection
            .prepare_cached(&sql)?
            .execute(params_from_iter(values))?;

        log::debug!(target: self.log.target(), "buffered reading from {}", reading.time());
        Ok(())
    }

    /// Every buffered reading with its row id, oldest first
    pub fn entries(&self) -> StorageResult<Vec<BufferedReading>> {
        if !self.table_exists()? {
            return Ok(Vec::new());
        }

        let present = self.existing_columns()?;
        let selected: Vec<Measurement> = self
            .columns
            .iter()
            .copied()
            .filter(|m| present.contains(m.as_str()))
            .collect();

        let mut select = vec![quote("id"), quote("time")];
        select.extend(selected.iter().map(|m| quote(m.as_str())));
        let sql = format!(
            "SELECT {} FROM {} ORDER BY id ASC",
            select.join(", "),
            quote(&self.table)
        );

        let mut statement = self.connection.prepare(&sql)?;
        let rows = statement
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let time: String = row.get(1)?;
                let cells = (0..selected.len())
                    .map(|i| row.get::<_, SqlValue>(i + 2))
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok((id, time, cells))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        rows.into_iter()
            .map(|(id, time, cells)| {
                let time = decode_time(&time)
                    .map_err(|reason| StorageError::CorruptRow { id, reason })?;
                let mut reading = Reading::new(time);
                for &measurement in &self.columns {
                    reading.set(measurement, Value::Unavailable);
                }
                for (measurement, cell) in selected.iter().zip(cells) {
                    reading.set(*measurement, decode_value(*measurement, cell));
                }
                Ok(BufferedReading { id, reading })
            })
            .collect()
    }

    /// Every buffered reading, oldest first
    pub fn all(&self) -> StorageResult<Vec<Reading>> {
        Ok(self.entries()?.into_iter().map(|entry| entry.reading).collect())
    }

    /// Number of buffered readings; 0 when the table does not exist
    pub fn count(&self) -> StorageResult<usize> {
        if !self.table_exists()? {
            return Ok(0);
        }
        let sql = format!("SELECT COUNT(*) FROM {}", quote(&self.table));
        let count: i64 = self.connection.query_row(&sql, [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.count()? == 0)
    }

    /// Drop the table with every row
    ///
    /// Only call once everything returned by `all()` has been delivered.
    pub fn clear(&mut self) -> StorageResult<()> {
        self.connection
            .execute_batch(&format!("DROP TABLE IF EXISTS {}", quote(&self.table)))?;
        self.ready = false;
        log::info!(target: self.log.target(), "buffer cleared");
        Ok(())
    }

    fn table_exists(&self) -> StorageResult<bool> {
        Ok(self
            .connection
            .query_row(
                "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
                params![self.table],
                |_| Ok(()),
            )
            .optional()?
            .is_some())
    }

    fn existing_columns(&self) -> StorageResult<HashSet<String>> {
        let mut statement = self
            .connection
            .prepare("SELECT name FROM pragma_table_info(?1)")?;
        let names = statement
            .query_map(params![self.table], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<HashSet<_>>>()?;
        Ok(names)
    }

    fn ensure_table(&mut self) -> StorageResult<()> {
        if self.ready {
            return Ok(());
        }

        let mut definitions = vec![
            format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quote("id")),
            format!("{} TEXT NOT NULL", quote("time")),
        ];
        definitions.extend(self.columns.iter().map(|m| column_definition(*m)));
        self.connection.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            quote(&self.table),
            definitions.join(", ")
        ))?;

        let present = self.existing_columns()?;
        for &measurement in &self.columns {
            if !present.contains(measurement.as_str()) {
                log::info!(
                    target: self.log.target(),
                    "adding column {} to {}",
                    measurement,
                    self.table
                );
                self.connection.execute_batch(&format!(
                    "ALTER TABLE {} ADD COLUMN {}",
                    quote(&self.table),
                    column_definition(measurement)
                ))?;
            }
        }

        self.ready = true;
        Ok(())
    }
}

/// `readings_<device>` with anything outside `[A-Za-z0-9_]` replaced by `_`
fn table_name(device: &str) -> String {
    let sanitized: String = device
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    format!("readings_{sanitized}")
}

fn quote(identifier: &str) -> String {
    format!("\"{identifier}\"")
}

fn column_definition(measurement: Measurement) -> String {
    let affinity = match measurement.kind() {
        MeasurementKind::Numeric => "REAL",
        MeasurementKind::Label => "TEXT",
    };
    format!("{} {}", quote(measurement.as_str()), affinity)
}

fn encode_time(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_time(text: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(text)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp {text:?}: {e}"))
}

fn decode_value(measurement: Measurement, cell: SqlValue) -> Value {
    match (measurement.kind(), cell) {
        (_, SqlValue::Null) => Value::Unavailable,
        (MeasurementKind::Numeric, SqlValue::Real(v)) => Value::Numeric(v),
        (MeasurementKind::Numeric, SqlValue::Integer(v)) => Value::Numeric(v as f64),
        (MeasurementKind::Label, SqlValue::Text(label)) => Value::Label(label),
        (MeasurementKind::Label, SqlValue::Integer(v)) => Value::Label(v.to_string()),
        (MeasurementKind::Label, SqlValue::Real(v)) => Value::Label(v.to_string()),
        (MeasurementKind::Numeric, SqlValue::Text(text)) => {
            text.parse().map(Value::Numeric).unwrap_or(Value::Unavailable)
        }
        (_, SqlValue::Blob(_)) => Value::Unavailable,
    }
}
