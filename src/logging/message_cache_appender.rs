//! A log4rs appender that keeps the most recent log records in a named
//! in-memory ring. The control plane drains these rings into its message
//! log so console output also lands in `get_message_log`.

use log4rs::append::Append;
use log4rs::config::{Deserialize, Deserializers};
use log4rs::encode::{Encode, EncoderConfig, Write};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use tracing::log::{Level, Record};

#[derive(Clone, Debug, serde::Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageCacheAppenderConfig {
	name: String,
	count: usize,
	encoder: Option<EncoderConfig>,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct MessageCacheAppenderDeserializer;

impl Deserialize for MessageCacheAppenderDeserializer {
	type Trait = dyn Append;

	type Config = MessageCacheAppenderConfig;

	fn deserialize(
		&self,
		config: MessageCacheAppenderConfig,
		deserializers: &Deserializers,
	) -> anyhow::Result<Box<dyn Append>> {
		let cache = Cache::get_or_create(config.name);
		let encoder: Box<dyn Encode> = if let Some(encoder) = config.encoder {
			deserializers.deserialize(&encoder.kind, encoder.config)?
		} else {
			Box::new(log4rs::encode::pattern::PatternEncoder::default())
		};
		Ok(Box::new(MessageCacheAppender {
			cache,
			count: config.count,
			encoder,
		}))
	}
}

#[derive(Debug)]
pub struct MessageCacheAppender {
	cache: Arc<RwLock<VecDeque<CachedLogRecord>>>,
	count: usize,
	encoder: Box<dyn Encode>,
}

impl Append for MessageCacheAppender {
	fn append(&self, record: &Record) -> anyhow::Result<()> {
		let mut message = String::new();
		self.encoder
			.encode(&mut StringEncoder(&mut message), record)?;
		let mut cache = self.cache.write().expect("poisoned lock");
		while cache.len() >= self.count {
			cache.pop_front();
		}
		cache.push_back(CachedLogRecord {
			level: record.level(),
			target: record.target().to_owned(),
			message,
		});
		Ok(())
	}

	fn flush(&self) {}
}

struct StringEncoder<'a>(&'a mut String);

impl<'a> std::io::Write for StringEncoder<'a> {
	fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
		self.0.push_str(&String::from_utf8_lossy(buf));
		Ok(buf.len())
	}

	fn flush(&mut self) -> std::io::Result<()> {
		Ok(())
	}
}

impl<'a> Write for StringEncoder<'a> {}

#[derive(Clone, Debug)]
pub struct CachedLogRecord {
	pub level: Level,
	pub target: String,
	pub message: String,
}

impl CachedLogRecord {
	/// Numeric level in the convention the message log stores: error 40,
	/// warn 30, info 20, debug 10, trace 0.
	pub fn numeric_level(&self) -> i32 {
		match self.level {
			Level::Error => 40,
			Level::Warn => 30,
			Level::Info => 20,
			Level::Debug => 10,
			Level::Trace => 0,
		}
	}
}

#[derive(Default)]
pub struct Cache {
	map: RwLock<HashMap<String, Arc<RwLock<VecDeque<CachedLogRecord>>>>>,
}

lazy_static::lazy_static! {
	static ref CACHE_MAP: Cache = Cache::default();
}

impl Cache {
	pub fn get_or_create(name: String) -> Arc<RwLock<VecDeque<CachedLogRecord>>> {
		let mut cache_map = CACHE_MAP.map.write().expect("poisoned lock");
		cache_map
			.entry(name)
			.or_insert_with(|| Arc::new(RwLock::new(VecDeque::new())))
			.clone()
	}

	/// Remove and return everything currently cached under `name`.
	pub fn drain(name: &str) -> Vec<CachedLogRecord> {
		let cache = {
			let cache_map = CACHE_MAP.map.read().expect("poisoned lock");
			match cache_map.get(name) {
				Some(cache) => cache.clone(),
				None => return vec![],
			}
		};
		let mut cache = cache.write().expect("poisoned lock");
		cache.drain(..).collect()
	}
}
