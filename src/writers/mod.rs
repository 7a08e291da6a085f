//! Writers: the sink end of a pipeline. A writer consumes payloads;
//! batches are unrolled element-wise by the default entry point.

pub mod file_writer;
pub mod logfile_writer;
pub mod record_store;

use crate::record::Payload;
use anyhow::bail;

pub trait Writer: Send + Sync {
	/// Write a single (non-batch) payload.
	fn write_single(&mut self, payload: Payload) -> anyhow::Result<()>;

	/// Entry point: unrolls batches in order.
	fn write(&mut self, payload: Payload) -> anyhow::Result<()> {
		match payload {
			Payload::Batch(items) => {
				for item in items {
					self.write(item)?;
				}
				Ok(())
			}
			other => self.write_single(other),
		}
	}
}

/// Instantiate a writer from a `{class, kwargs}` spec.
pub fn build(spec: &serde_json::Value) -> anyhow::Result<Box<dyn Writer>> {
	let class = match spec.get("class").and_then(|v| v.as_str()) {
		Some(class) => class,
		None => bail!("writer spec is missing a \"class\" name: {}", spec),
	};
	let kwargs = match spec.get("kwargs") {
		None | Some(serde_json::Value::Null) => serde_json::json!({}),
		Some(kwargs) => kwargs.clone(),
	};

	let writer: Box<dyn Writer> = match class {
		"FileWriter" | "TextFileWriter" => {
			Box::new(file_writer::FileWriter::from_config(&kwargs)?)
		}
		"LogfileWriter" => Box::new(logfile_writer::LogfileWriter::from_config(&kwargs)?),
		"DatabaseWriter" | "RecordStoreWriter" => {
			Box::new(record_store::StoreWriter::from_config(&kwargs)?)
		}
		unknown => bail!("unknown writer class {:?}", unknown),
	};
	Ok(writer)
}
