//! Write timestamped records to date-stamped logfiles, rolling over at a
//! configurable split interval. With a regex-keyed filebase mapping, each
//! record is routed to every filebase whose pattern matches it.

use super::file_writer::FileWriter;
use super::Writer;
use crate::record::Payload;
use crate::timeutil;
use chrono::Timelike;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use tracing::*;

const DEFAULT_DATE_FORMAT: &str = "-%Y-%m-%d";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SplitInterval {
	Hours(u32),
	Minutes(u32),
}

impl SplitInterval {
	fn parse(spec: &str) -> anyhow::Result<SplitInterval> {
		let (count, unit) = spec.split_at(spec.len().saturating_sub(1));
		let count: u32 = count
			.parse()
			.map_err(|_| anyhow::anyhow!("split_interval must be an integer followed by 'H' or 'M'"))?;
		if count == 0 {
			anyhow::bail!("split_interval must be positive");
		}
		match unit {
			"H" => Ok(SplitInterval::Hours(count)),
			"M" => Ok(SplitInterval::Minutes(count)),
			_ => anyhow::bail!("split_interval must be an integer followed by 'H' or 'M'"),
		}
	}
}

/// A plain value or a regex-keyed mapping of values, for filebase, header
/// and suffix configuration.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(untagged)]
enum StringOrMap {
	Fixed(String),
	ByPattern(BTreeMap<String, String>),
}

#[derive(serde::Deserialize)]
#[serde(default)]
struct LogfileWriterConfig {
	filebase: Option<StringOrMap>,
	delimiter: Option<String>,
	flush: bool,
	split_interval: Option<String>,
	header: Option<StringOrMap>,
	header_file: Option<StringOrMap>,
	time_format: String,
	date_format: Option<String>,
	suffix: Option<StringOrMap>,
	split_char: String,
	quiet: bool,
}

impl Default for LogfileWriterConfig {
	fn default() -> Self {
		LogfileWriterConfig {
			filebase: None,
			delimiter: Some("\n".to_owned()),
			flush: true,
			split_interval: Some("24H".to_owned()),
			header: None,
			header_file: None,
			time_format: timeutil::TIME_FORMAT.to_owned(),
			date_format: None,
			suffix: None,
			split_char: " ".to_owned(),
			quiet: false,
		}
	}
}

enum Routing {
	Fixed(String),
	ByPattern(Vec<(String, Regex, String)>),
}

pub struct LogfileWriter {
	routing: Routing,
	delimiter: Option<String>,
	flush: bool,
	split_interval: Option<SplitInterval>,
	header: Option<StringOrMap>,
	time_format: String,
	date_format: String,
	suffix: StringOrMap,
	split_char: String,
	quiet: bool,
	current_filename: HashMap<String, String>,
	writers: HashMap<String, FileWriter>,
}

impl LogfileWriter {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: LogfileWriterConfig = serde_json::from_value(kwargs.clone())?;

		let routing = match config.filebase {
			Some(StringOrMap::Fixed(filebase)) => Routing::Fixed(filebase),
			Some(StringOrMap::ByPattern(map)) => {
				let mut patterns = Vec::new();
				for (pattern, filebase) in map {
					let regex = Regex::new(&pattern).map_err(|e| {
						anyhow::anyhow!("invalid filebase pattern {:?}: {}", pattern, e)
					})?;
					patterns.push((pattern, regex, filebase));
				}
				Routing::ByPattern(patterns)
			}
			None => anyhow::bail!("LogfileWriter requires a filebase"),
		};

		let split_interval = match &config.split_interval {
			Some(spec) => Some(SplitInterval::parse(spec)?),
			None => None,
		};
		let date_format = validate_date_format(split_interval, config.date_format)?;
		let header = load_header(config.header, config.header_file)?;

		Ok(LogfileWriter {
			routing,
			delimiter: config.delimiter,
			flush: config.flush,
			split_interval,
			header,
			time_format: config.time_format,
			date_format,
			suffix: config.suffix.unwrap_or_else(|| StringOrMap::Fixed(String::new())),
			split_char: config.split_char,
			quiet: config.quiet,
			current_filename: HashMap::new(),
			writers: HashMap::new(),
		})
	}

	/// Floor the record timestamp to its bucket start and format it with
	/// the configured date format.
	fn bucket_suffix(&self, ts: f64) -> anyhow::Result<String> {
		let interval = match self.split_interval {
			Some(interval) => interval,
			None => return Ok(String::new()),
		};
		let dt = timeutil::datetime_from_timestamp(ts);
		let bucketed = match interval {
			SplitInterval::Hours(n) => {
				let hour = (dt.hour() / n) * n;
				dt.with_hour(hour)
					.and_then(|d| d.with_minute(0))
					.and_then(|d| d.with_second(0))
					.and_then(|d| d.with_nanosecond(0))
			}
			SplitInterval::Minutes(n) => {
				let minute = (dt.minute() / n) * n;
				dt.with_minute(minute)
					.and_then(|d| d.with_second(0))
					.and_then(|d| d.with_nanosecond(0))
			}
		}
		.ok_or_else(|| anyhow::anyhow!("unable to floor timestamp {} to bucket", ts))?;
		Ok(timeutil::time_str(
			bucketed.timestamp() as f64,
			&self.date_format,
		)?)
	}

	fn fetch_suffix(&self, record: &str, pattern: Option<&str>) -> Option<String> {
		match (&self.suffix, pattern) {
			(StringOrMap::Fixed(suffix), _) => Some(suffix.clone()),
			(StringOrMap::ByPattern(map), Some(pattern)) => {
				let found = map.get(pattern).cloned();
				if found.is_none() && !self.quiet {
					warn!("LogfileWriter found no suffix matching pattern {:?}", pattern);
				}
				found
			}
			(StringOrMap::ByPattern(map), None) => {
				for (pattern, suffix) in map {
					if Regex::new(pattern).ok()?.is_match(record) {
						return Some(suffix.clone());
					}
				}
				warn!("LogfileWriter found no suffix match for record {:?}", record);
				None
			}
		}
	}

	fn fetch_header(&self, record: &str, pattern: Option<&str>) -> Option<String> {
		match (&self.header, pattern) {
			(None, _) => None,
			(Some(StringOrMap::Fixed(header)), _) => Some(header.clone()),
			(Some(StringOrMap::ByPattern(map)), Some(pattern)) => map.get(pattern).cloned(),
			(Some(StringOrMap::ByPattern(map)), None) => {
				for (pattern, header) in map {
					if let Ok(regex) = Regex::new(pattern) {
						if regex.is_match(record) {
							return Some(header.clone());
						}
					}
				}
				None
			}
		}
	}

	fn compose_filename(filebase: &str, datetime_str: &str, suffix: &str) -> String {
		// A leading '^' in the formatted datestamp moves it in front of
		// the file name portion of the filebase.
		if let Some(prefix_stamp) = datetime_str.strip_prefix('^') {
			let path = Path::new(filebase);
			let dir = path.parent().map(|p| p.to_string_lossy().into_owned());
			let base = path
				.file_name()
				.map(|b| b.to_string_lossy().into_owned())
				.unwrap_or_default();
			match dir {
				Some(dir) if !dir.is_empty() => {
					format!("{}/{}{}{}", dir, prefix_stamp, base, suffix)
				}
				_ => format!("{}{}{}", prefix_stamp, base, suffix),
			}
		} else {
			format!("{}{}{}", filebase, datetime_str, suffix)
		}
	}

	fn write_filename(
		&mut self,
		record: &str,
		pattern_key: &str,
		pattern: Option<&str>,
		filename: String,
	) -> anyhow::Result<()> {
		if self.current_filename.get(pattern_key) != Some(&filename) {
			let header = self.fetch_header(record, pattern);
			debug!("LogfileWriter opening {:?} for pattern {:?}", filename, pattern_key);
			let writer = FileWriter::to_path(
				Path::new(&filename),
				self.delimiter.clone(),
				self.flush,
				header,
			)?;
			self.current_filename
				.insert(pattern_key.to_owned(), filename);
			self.writers.insert(pattern_key.to_owned(), writer);
		}
		let writer = self
			.writers
			.get_mut(pattern_key)
			.expect("writer inserted above");
		writer.write(Payload::Text(record.to_owned()))
	}

	fn record_timestamp(&self, payload: &Payload) -> Option<(f64, String)> {
		match payload {
			Payload::Record(record) => Some((record.timestamp, record.as_json())),
			Payload::Text(text) => {
				let token = text.split(self.split_char.as_str()).next().unwrap_or("");
				match timeutil::timestamp(token, &self.time_format) {
					Ok(ts) => Some((ts, text.clone())),
					Err(_) => {
						if !self.quiet {
							error!("LogfileWriter.write() - bad timestamp: {:?}", text);
						}
						None
					}
				}
			}
			Payload::Batch(_) => None,
		}
	}
}

impl Writer for LogfileWriter {
	fn write_single(&mut self, payload: Payload) -> anyhow::Result<()> {
		let (ts, record) = match self.record_timestamp(&payload) {
			Some(pair) => pair,
			None => return Ok(()),
		};
		if record.is_empty() {
			return Ok(());
		}
		let datetime_str = self.bucket_suffix(ts)?;

		// Resolve routing into (pattern key, pattern, filename) triples
		// first; the per-pattern writers are touched afterwards.
		let mut destinations: Vec<(String, Option<String>, String)> = Vec::new();
		match &self.routing {
			Routing::Fixed(filebase) => {
				let suffix = match self.fetch_suffix(&record, None) {
					Some(suffix) => suffix,
					None => return Ok(()),
				};
				let filename = Self::compose_filename(filebase, &datetime_str, &suffix);
				destinations.push(("fixed".to_owned(), None, filename));
			}
			Routing::ByPattern(patterns) => {
				for (pattern, regex, filebase) in patterns {
					if !regex.is_match(&record) {
						continue;
					}
					let suffix = match self.fetch_suffix(&record, Some(pattern)) {
						Some(suffix) => suffix,
						None => continue,
					};
					let filename = Self::compose_filename(filebase, &datetime_str, &suffix);
					destinations.push((pattern.clone(), Some(pattern.clone()), filename));
				}
				if destinations.is_empty() {
					if !self.quiet {
						warn!(
							"No patterns matched in LogfileWriter options for record {:?}",
							record
						);
					}
					return Ok(());
				}
			}
		}
		for (pattern_key, pattern, filename) in destinations {
			self.write_filename(&record, &pattern_key, pattern.as_deref(), filename)?;
		}
		Ok(())
	}
}

fn validate_date_format(
	split_interval: Option<SplitInterval>,
	date_format: Option<String>,
) -> anyhow::Result<String> {
	let interval = match split_interval {
		Some(interval) => interval,
		None => return Ok(date_format.unwrap_or_default()),
	};

	let (default_format, required): (String, Vec<&str>) = match interval {
		SplitInterval::Hours(hours) => {
			if hours % 24 == 0 {
				(DEFAULT_DATE_FORMAT.to_owned(), vec!["%Y", "%m", "%d"])
			} else {
				(
					format!("{}T%H00", DEFAULT_DATE_FORMAT),
					vec!["%Y", "%m", "%d", "%H"],
				)
			}
		}
		SplitInterval::Minutes(minutes) => {
			if minutes % 60 == 0 {
				(
					format!("{}T%H00", DEFAULT_DATE_FORMAT),
					vec!["%Y", "%m", "%d", "%H"],
				)
			} else {
				(
					format!("{}T%H%M", DEFAULT_DATE_FORMAT),
					vec!["%Y", "%m", "%d", "%H", "%M"],
				)
			}
		}
	};

	let date_format = match date_format {
		Some(date_format) => date_format,
		None => return Ok(default_format),
	};
	for token in required {
		if !date_format.contains(token) {
			anyhow::bail!(
				"date_format {:?} must include {} for a {:?} split",
				date_format,
				token,
				interval
			);
		}
	}
	Ok(date_format)
}

fn load_header(
	header: Option<StringOrMap>,
	header_file: Option<StringOrMap>,
) -> anyhow::Result<Option<StringOrMap>> {
	if header.is_some() && header_file.is_some() {
		anyhow::bail!("can not specify both header and header_file");
	}
	if header.is_some() {
		return Ok(header);
	}
	let read = |path: &str| -> anyhow::Result<String> {
		Ok(std::fs::read_to_string(path)
			.map_err(|e| anyhow::anyhow!("error reading header_file {:?}: {}", path, e))?
			.trim()
			.to_owned())
	};
	match header_file {
		None => Ok(None),
		Some(StringOrMap::Fixed(path)) => Ok(Some(StringOrMap::Fixed(read(&path)?))),
		Some(StringOrMap::ByPattern(map)) => {
			let mut loaded = BTreeMap::new();
			for (pattern, path) in map {
				loaded.insert(pattern, read(&path)?);
			}
			Ok(Some(StringOrMap::ByPattern(loaded)))
		}
	}
}
