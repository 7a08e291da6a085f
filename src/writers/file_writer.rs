//! Write records to a file or stdout, optionally rolling over to a new
//! time-suffixed file when the formatted suffix changes.

use super::Writer;
use crate::record::Payload;
use crate::timeutil;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::*;

const DEFAULT_SPLIT_FORMAT: &str = "-%Y-%m-%d";

enum Sink {
	Stdout(std::io::Stdout),
	File(std::fs::File),
}

impl Sink {
	fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
		match self {
			Sink::Stdout(out) => out.write_all(bytes),
			Sink::File(file) => file.write_all(bytes),
		}
	}

	fn flush(&mut self) -> std::io::Result<()> {
		match self {
			Sink::Stdout(out) => out.flush(),
			Sink::File(file) => file.flush(),
		}
	}
}

pub struct FileWriter {
	filename: Option<PathBuf>,
	truncate: bool,
	delimiter: Option<String>,
	flush: bool,
	split_by_time: bool,
	time_format: String,
	header: Option<String>,
	file_suffix: Option<String>,
	sink: Option<Sink>,
	/// Debugging hook: when set, used instead of system time to compute
	/// split suffixes. Leave None in real use.
	pub timestamp: Option<f64>,
}

#[derive(serde::Deserialize)]
#[serde(default)]
struct FileWriterConfig {
	filename: Option<String>,
	mode: String,
	delimiter: Option<String>,
	flush: bool,
	split_by_time: bool,
	time_format: String,
	header: Option<String>,
	create_path: bool,
}

impl Default for FileWriterConfig {
	fn default() -> Self {
		FileWriterConfig {
			filename: None,
			mode: "a".to_owned(),
			delimiter: Some("\n".to_owned()),
			flush: true,
			split_by_time: false,
			time_format: DEFAULT_SPLIT_FORMAT.to_owned(),
			header: None,
			create_path: true,
		}
	}
}

impl FileWriter {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: FileWriterConfig = serde_json::from_value(kwargs.clone())?;
		let truncate = match config.mode.as_str() {
			"a" | "ab" => false,
			"w" | "wb" => true,
			other => anyhow::bail!("FileWriter: unsupported file mode {:?}", other),
		};
		if config.split_by_time && config.filename.is_none() {
			anyhow::bail!("FileWriter: filename must be specified if split_by_time is set");
		}
		if let (Some(filename), true) = (&config.filename, config.create_path) {
			if let Some(parent) = Path::new(filename).parent() {
				if !parent.as_os_str().is_empty() {
					std::fs::create_dir_all(parent)?;
				}
			}
		}
		Ok(FileWriter {
			filename: config.filename.map(PathBuf::from),
			truncate,
			delimiter: config.delimiter,
			flush: config.flush,
			split_by_time: config.split_by_time,
			time_format: config.time_format,
			header: config.header,
			file_suffix: None,
			sink: None,
			timestamp: None,
		})
	}

	/// Plain writer to a fixed filename, as used by `LogfileWriter` for
	/// each time bucket.
	pub fn to_path(
		filename: &Path,
		delimiter: Option<String>,
		flush: bool,
		header: Option<String>,
	) -> anyhow::Result<Self> {
		if let Some(parent) = filename.parent() {
			if !parent.as_os_str().is_empty() {
				std::fs::create_dir_all(parent)?;
			}
		}
		Ok(FileWriter {
			filename: Some(filename.to_owned()),
			truncate: false,
			delimiter,
			flush,
			split_by_time: false,
			time_format: DEFAULT_SPLIT_FORMAT.to_owned(),
			header,
			file_suffix: None,
			sink: None,
			timestamp: None,
		})
	}

	fn current_suffix(&self) -> anyhow::Result<String> {
		let ts = self.timestamp.unwrap_or_else(timeutil::now);
		Ok(timeutil::time_str(ts, &self.time_format)?)
	}

	fn open(&mut self, path: &Path) -> anyhow::Result<()> {
		let mut options = OpenOptions::new();
		options.create(true);
		if self.truncate {
			options.write(true).truncate(true);
		} else {
			options.append(true);
		}
		let mut file = options.open(path)?;
		if let Some(header) = &self.header {
			file.write_all(header.as_bytes())?;
			file.write_all(b"\n")?;
		}
		self.sink = Some(Sink::File(file));
		Ok(())
	}

	fn ensure_open(&mut self) -> anyhow::Result<()> {
		let filename = match &self.filename {
			Some(filename) => filename.clone(),
			None => {
				if self.sink.is_none() {
					self.sink = Some(Sink::Stdout(std::io::stdout()));
				}
				return Ok(());
			}
		};

		if self.split_by_time {
			let new_suffix = self.current_suffix()?;
			if self.file_suffix.as_deref() != Some(new_suffix.as_str()) {
				debug!("FileWriter rolling over to suffix {:?}", new_suffix);
				let mut path = filename.into_os_string();
				path.push(&new_suffix);
				self.file_suffix = Some(new_suffix);
				self.open(Path::new(&path))?;
			}
		} else if self.sink.is_none() {
			self.open(&filename)?;
		}
		Ok(())
	}
}

impl Writer for FileWriter {
	fn write_single(&mut self, payload: Payload) -> anyhow::Result<()> {
		let text = match payload {
			Payload::Text(text) => text,
			Payload::Record(record) => record.as_json(),
			Payload::Batch(_) => unreachable!("batches are unrolled by write()"),
		};
		self.ensure_open()?;
		let sink = self.sink.as_mut().expect("sink opened above");
		sink.write_all(text.as_bytes())?;
		if let Some(delimiter) = &self.delimiter {
			sink.write_all(delimiter.as_bytes())?;
		}
		if self.flush {
			sink.flush()?;
		}
		Ok(())
	}
}
