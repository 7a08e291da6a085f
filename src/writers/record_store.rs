//! The pluggable record store consumed by database-style writers. A
//! concrete store maps record fields to table columns, inferring the
//! schema from the first record it sees for each table. The writer layer
//! recovers from missing columns by adding them and retrying; duplicate
//! column errors are swallowed.

use super::Writer;
use crate::record::{Fields, Payload, Record, Value};
use std::collections::HashMap;
use tracing::*;

#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum StoreError {
	#[error("table {0:?} does not exist")]
	UndefinedTable(String),
	#[error("column {1:?} does not exist in table {0:?}")]
	UndefinedColumn(String, String),
	#[error("column {1:?} already exists in table {0:?}")]
	DuplicateColumn(String, String),
	#[error("record store is closed")]
	Closed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SeekOrigin {
	Start,
	Current,
	End,
}

/// Table name a record's rows land in: its data_id, or "unknown".
pub fn table_name_for(record: &Record) -> String {
	record
		.data_id
		.clone()
		.filter(|id| !id.is_empty())
		.unwrap_or_else(|| "unknown".to_owned())
}

pub trait RecordStore: Send + Sync {
	fn table_exists(&self, table: &str) -> bool;

	/// Create a table whose columns are inferred from the record's
	/// fields; returns the table name.
	fn create_table_from_record(&mut self, record: &Record) -> Result<String, StoreError>;

	/// Append a record's fields as a row. Fields with no matching column
	/// raise `UndefinedColumn`.
	fn write_record(&mut self, record: &Record) -> Result<(), StoreError>;

	/// Add a column; `DuplicateColumn` if it is already there.
	fn add_column(&mut self, table: &str, column: &str) -> Result<(), StoreError>;

	/// Read up to `count` rows from the table's cursor, advancing it.
	fn read(
		&mut self,
		table: &str,
		fields: Option<&[String]>,
		count: usize,
	) -> Result<Vec<Record>, StoreError>;

	/// Rows in the half-open row range `[start, stop)`.
	fn read_range(
		&mut self,
		table: &str,
		fields: Option<&[String]>,
		start: usize,
		stop: usize,
	) -> Result<Vec<Record>, StoreError>;

	/// Rows whose timestamps fall in the half-open `[start, stop)`.
	fn read_time_range(
		&mut self,
		table: &str,
		fields: Option<&[String]>,
		start: f64,
		stop: f64,
	) -> Result<Vec<Record>, StoreError>;

	fn seek(&mut self, table: &str, offset: i64, origin: SeekOrigin) -> Result<(), StoreError>;

	fn delete_table(&mut self, table: &str) -> Result<(), StoreError>;

	fn close(&mut self);
}

////////////////////////////////////////////////////////////////////////////

#[derive(Default)]
struct MemTable {
	columns: Vec<String>,
	rows: Vec<(f64, Fields)>,
	cursor: usize,
}

impl MemTable {
	fn project(&self, row: &(f64, Fields), fields: Option<&[String]>) -> Record {
		let (timestamp, values) = row;
		let projected: Fields = match fields {
			None => values.clone(),
			Some(wanted) => values
				.iter()
				.filter(|(name, _)| wanted.iter().any(|w| w == *name))
				.map(|(name, value)| (name.clone(), value.clone()))
				.collect(),
		};
		Record {
			data_id: None,
			message_type: None,
			timestamp: *timestamp,
			fields: projected,
			metadata: Default::default(),
		}
	}
}

/// In-memory record store, the reference implementation of the trait.
#[derive(Default)]
pub struct MemoryRecordStore {
	tables: HashMap<String, MemTable>,
	closed: bool,
}

impl MemoryRecordStore {
	pub fn new() -> Self {
		Default::default()
	}

	fn table(&self, table: &str) -> Result<&MemTable, StoreError> {
		if self.closed {
			return Err(StoreError::Closed);
		}
		self.tables
			.get(table)
			.ok_or_else(|| StoreError::UndefinedTable(table.to_owned()))
	}

	fn table_mut(&mut self, table: &str) -> Result<&mut MemTable, StoreError> {
		if self.closed {
			return Err(StoreError::Closed);
		}
		self.tables
			.get_mut(table)
			.ok_or_else(|| StoreError::UndefinedTable(table.to_owned()))
	}
}

impl RecordStore for MemoryRecordStore {
	fn table_exists(&self, table: &str) -> bool {
		self.tables.contains_key(table)
	}

	fn create_table_from_record(&mut self, record: &Record) -> Result<String, StoreError> {
		if self.closed {
			return Err(StoreError::Closed);
		}
		let name = table_name_for(record);
		let columns: Vec<String> = record.fields.keys().cloned().collect();
		info!("Creating table {:?} with {} columns", name, columns.len());
		self.tables.insert(
			name.clone(),
			MemTable {
				columns,
				rows: Vec::new(),
				cursor: 0,
			},
		);
		Ok(name)
	}

	fn write_record(&mut self, record: &Record) -> Result<(), StoreError> {
		let name = table_name_for(record);
		let table = self.table_mut(&name)?;
		for field in record.fields.keys() {
			if !table.columns.contains(field) {
				return Err(StoreError::UndefinedColumn(name, field.clone()));
			}
		}
		table.rows.push((record.timestamp, record.fields.clone()));
		Ok(())
	}

	fn add_column(&mut self, table: &str, column: &str) -> Result<(), StoreError> {
		let name = table.to_owned();
		let table = self.table_mut(&name)?;
		if table.columns.iter().any(|c| c == column) {
			return Err(StoreError::DuplicateColumn(name, column.to_owned()));
		}
		table.columns.push(column.to_owned());
		Ok(())
	}

	fn read(
		&mut self,
		table: &str,
		fields: Option<&[String]>,
		count: usize,
	) -> Result<Vec<Record>, StoreError> {
		let table = self.table_mut(table)?;
		let start = table.cursor.min(table.rows.len());
		let stop = (start + count).min(table.rows.len());
		table.cursor = stop;
		let rows = table.rows[start..stop].to_vec();
		Ok(rows.iter().map(|row| table.project(row, fields)).collect())
	}

	fn read_range(
		&mut self,
		table: &str,
		fields: Option<&[String]>,
		start: usize,
		stop: usize,
	) -> Result<Vec<Record>, StoreError> {
		let table = self.table(table)?;
		let start = start.min(table.rows.len());
		let stop = stop.clamp(start, table.rows.len());
		Ok(table.rows[start..stop]
			.iter()
			.map(|row| table.project(row, fields))
			.collect())
	}

	fn read_time_range(
		&mut self,
		table: &str,
		fields: Option<&[String]>,
		start: f64,
		stop: f64,
	) -> Result<Vec<Record>, StoreError> {
		let table = self.table(table)?;
		Ok(table
			.rows
			.iter()
			.filter(|(ts, _)| *ts >= start && *ts < stop)
			.map(|row| table.project(row, fields))
			.collect())
	}

	fn seek(&mut self, table: &str, offset: i64, origin: SeekOrigin) -> Result<(), StoreError> {
		let table = self.table_mut(table)?;
		let len = table.rows.len() as i64;
		let base = match origin {
			SeekOrigin::Start => 0,
			SeekOrigin::Current => table.cursor as i64,
			SeekOrigin::End => len,
		};
		table.cursor = (base + offset).clamp(0, len) as usize;
		Ok(())
	}

	fn delete_table(&mut self, table: &str) -> Result<(), StoreError> {
		if self.tables.remove(table).is_none() {
			return Err(StoreError::UndefinedTable(table.to_owned()));
		}
		Ok(())
	}

	fn close(&mut self) {
		self.closed = true;
	}
}

////////////////////////////////////////////////////////////////////////////

/// Writer adapter over a record store: creates tables on first sight of a
/// data_id, adds columns as new fields appear, retries the write.
pub struct StoreWriter {
	store: Box<dyn RecordStore>,
}

impl StoreWriter {
	pub fn new(store: Box<dyn RecordStore>) -> Self {
		StoreWriter { store }
	}

	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		// The store backend is pluggable; "memory" is the only built-in.
		let backend = kwargs
			.get("backend")
			.and_then(|v| v.as_str())
			.unwrap_or("memory");
		match backend {
			"memory" => Ok(StoreWriter::new(Box::new(MemoryRecordStore::new()))),
			other => anyhow::bail!("unknown record store backend {:?}", other),
		}
	}

	fn store_record(&mut self, record: &Record) -> anyhow::Result<()> {
		let table = table_name_for(record);
		if !self.store.table_exists(&table) {
			self.store.create_table_from_record(record)?;
		}
		// New fields may appear after table creation; alter and retry,
		// bounded by the number of fields that could be missing.
		for _ in 0..=record.fields.len() {
			match self.store.write_record(record) {
				Ok(()) => return Ok(()),
				Err(StoreError::UndefinedColumn(table, column)) => {
					debug!("Adding column {:?} to table {:?}", column, table);
					match self.store.add_column(&table, &column) {
						Ok(()) | Err(StoreError::DuplicateColumn(_, _)) => {}
						Err(e) => return Err(e.into()),
					}
				}
				Err(e) => return Err(e.into()),
			}
		}
		anyhow::bail!("unable to reconcile record fields with table {:?}", table)
	}
}

impl Writer for StoreWriter {
	fn write_single(&mut self, payload: Payload) -> anyhow::Result<()> {
		match payload {
			Payload::Record(record) => self.store_record(&record),
			Payload::Text(text) => {
				// Text records get parsed if they hold canonical JSON.
				match Record::from_json(&text) {
					Ok(record) => self.store_record(&record),
					Err(_) => {
						warn!("StoreWriter can not store non-record text: {:?}", text);
						Ok(())
					}
				}
			}
			Payload::Batch(_) => unreachable!("batches are unrolled by write()"),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn record(data_id: &str, ts: f64, fields: &[(&str, f64)]) -> Record {
		let mut map = Fields::new();
		for (name, value) in fields {
			map.insert((*name).to_owned(), Value::Float(*value));
		}
		Record::new(Some(data_id.to_owned()), None, ts, map)
	}

	#[test]
	fn schema_inferred_from_first_record() {
		let mut store = MemoryRecordStore::new();
		let r = record("gyr1", 1.0, &[("Heading", 235.9)]);
		let table = store.create_table_from_record(&r).unwrap();
		assert_eq!(table, "gyr1");
		assert!(store.table_exists("gyr1"));
		store.write_record(&r).unwrap();
	}

	#[test]
	fn missing_column_is_a_typed_error() {
		let mut store = MemoryRecordStore::new();
		store
			.create_table_from_record(&record("gyr1", 1.0, &[("Heading", 1.0)]))
			.unwrap();
		let result = store.write_record(&record("gyr1", 2.0, &[("Pitch", 0.5)]));
		assert_eq!(
			result,
			Err(StoreError::UndefinedColumn("gyr1".to_owned(), "Pitch".to_owned()))
		);
		store.add_column("gyr1", "Pitch").unwrap();
		assert_eq!(
			store.add_column("gyr1", "Pitch"),
			Err(StoreError::DuplicateColumn("gyr1".to_owned(), "Pitch".to_owned()))
		);
	}

	#[test]
	fn read_advances_cursor_and_seek_rewinds() {
		let mut store = MemoryRecordStore::new();
		store
			.create_table_from_record(&record("t", 1.0, &[("v", 1.0)]))
			.unwrap();
		for i in 0..5 {
			store
				.write_record(&record("t", i as f64 + 1.0, &[("v", i as f64)]))
				.unwrap();
		}
		let first = store.read("t", None, 2).unwrap();
		assert_eq!(first.len(), 2);
		let next = store.read("t", None, 10).unwrap();
		assert_eq!(next.len(), 3);
		store.seek("t", 0, SeekOrigin::Start).unwrap();
		assert_eq!(store.read("t", None, 10).unwrap().len(), 5);
		store.seek("t", -2, SeekOrigin::End).unwrap();
		assert_eq!(store.read("t", None, 10).unwrap().len(), 2);
	}

	#[test]
	fn read_range_is_half_open() {
		let mut store = MemoryRecordStore::new();
		store
			.create_table_from_record(&record("t", 1.0, &[("v", 1.0)]))
			.unwrap();
		for i in 0..10 {
			store
				.write_record(&record("t", i as f64, &[("v", i as f64)]))
				.unwrap();
		}
		let rows = store.read_range("t", None, 2, 5).unwrap();
		assert_eq!(rows.len(), 3);
		assert_eq!(rows[0].fields.get("v"), Some(&Value::Float(2.0)));
		assert_eq!(rows[2].fields.get("v"), Some(&Value::Float(4.0)));
	}

	#[test]
	fn read_time_range_filters_timestamps() {
		let mut store = MemoryRecordStore::new();
		store
			.create_table_from_record(&record("t", 1.0, &[("v", 1.0)]))
			.unwrap();
		for i in 0..10 {
			store
				.write_record(&record("t", 100.0 + i as f64, &[("v", i as f64)]))
				.unwrap();
		}
		let rows = store.read_time_range("t", None, 102.0, 105.0).unwrap();
		assert_eq!(rows.len(), 3);
		assert_eq!(rows[0].timestamp, 102.0);
	}

	#[test]
	fn projection_selects_fields() {
		let mut store = MemoryRecordStore::new();
		let r = record("t", 1.0, &[("a", 1.0), ("b", 2.0)]);
		store.create_table_from_record(&r).unwrap();
		store.write_record(&r).unwrap();
		let rows = store
			.read_range("t", Some(&["a".to_owned()]), 0, 10)
			.unwrap();
		assert!(rows[0].fields.contains_key("a"));
		assert!(!rows[0].fields.contains_key("b"));
	}

	#[test]
	fn missing_table_reads_are_typed_errors() {
		let mut store = MemoryRecordStore::new();
		assert!(matches!(
			store.read("nope", None, 1),
			Err(StoreError::UndefinedTable(_))
		));
		assert!(matches!(
			store.delete_table("nope"),
			Err(StoreError::UndefinedTable(_))
		));
	}

	#[test]
	fn store_writer_alters_and_retries() {
		let mut writer = StoreWriter::new(Box::new(MemoryRecordStore::new()));
		writer
			.write(Payload::Record(record("gyr1", 1.0, &[("Heading", 1.0)])))
			.unwrap();
		// A record with a brand-new field triggers add-column-and-retry.
		writer
			.write(Payload::Record(record(
				"gyr1",
				2.0,
				&[("Heading", 2.0), ("Pitch", 0.5)],
			)))
			.unwrap();
		let rows = writer.store.read_range("gyr1", None, 0, 10).unwrap();
		assert_eq!(rows.len(), 2);
		assert_eq!(rows[1].fields.get("Pitch"), Some(&Value::Float(0.5)));
	}

	#[test]
	fn closed_store_rejects_writes() {
		let mut store = MemoryRecordStore::new();
		store
			.create_table_from_record(&record("t", 1.0, &[("v", 1.0)]))
			.unwrap();
		store.close();
		assert_eq!(
			store.write_record(&record("t", 1.0, &[("v", 1.0)])),
			Err(StoreError::Closed)
		);
	}
}
