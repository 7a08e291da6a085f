//! Readers: the source end of a pipeline. Readers are async; a read
//! returning None means the source is exhausted.

use crate::record::Payload;
use anyhow::{bail, Context};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::*;

#[async_trait::async_trait]
pub trait Reader: Send + Sync {
	/// Next record from the source; None on end of input.
	async fn read(&mut self) -> anyhow::Result<Option<Payload>>;
}

/// Instantiate a reader from a `{class, kwargs}` spec.
pub fn build(spec: &serde_json::Value) -> anyhow::Result<Box<dyn Reader>> {
	let class = match spec.get("class").and_then(|v| v.as_str()) {
		Some(class) => class,
		None => bail!("reader spec is missing a \"class\" name: {}", spec),
	};
	let kwargs = match spec.get("kwargs") {
		None | Some(serde_json::Value::Null) => serde_json::json!({}),
		Some(kwargs) => kwargs.clone(),
	};

	let reader: Box<dyn Reader> = match class {
		"TextFileReader" | "LogfileReader" => {
			Box::new(TextFileReader::from_config(&kwargs)?)
		}
		"UDPReader" => Box::new(UdpReader::from_config(&kwargs)?),
		unknown => bail!("unknown reader class {:?}", unknown),
	};
	Ok(reader)
}

////////////////////////////////////////////////////////////////////////////
/// Read a text file line by line; with `tail` set, wait for more input at
/// end of file instead of finishing.
pub struct TextFileReader {
	filename: PathBuf,
	tail: bool,
	interval: Duration,
	lines: Option<tokio::io::Lines<tokio::io::BufReader<tokio::fs::File>>>,
}

#[derive(serde::Deserialize)]
struct TextFileReaderConfig {
	filename: String,
	#[serde(default)]
	tail: bool,
	#[serde(default = "default_tail_interval")]
	interval: f64,
}

fn default_tail_interval() -> f64 {
	0.1
}

impl TextFileReader {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: TextFileReaderConfig = serde_json::from_value(kwargs.clone())?;
		Ok(TextFileReader {
			filename: PathBuf::from(config.filename),
			tail: config.tail,
			interval: Duration::from_secs_f64(config.interval),
			lines: None,
		})
	}

	async fn ensure_open(&mut self) -> anyhow::Result<()> {
		if self.lines.is_none() {
			let file = tokio::fs::File::open(&self.filename)
				.await
				.with_context(|| format!("unable to open {:?}", self.filename))?;
			use tokio::io::AsyncBufReadExt;
			self.lines = Some(tokio::io::BufReader::new(file).lines());
		}
		Ok(())
	}
}

#[async_trait::async_trait]
impl Reader for TextFileReader {
	async fn read(&mut self) -> anyhow::Result<Option<Payload>> {
		self.ensure_open().await?;
		loop {
			let lines = self.lines.as_mut().expect("opened above");
			match lines.next_line().await? {
				Some(line) => return Ok(Some(Payload::Text(line))),
				None => {
					if !self.tail {
						debug!("TextFileReader reached end of {:?}", self.filename);
						return Ok(None);
					}
					tokio::time::sleep(self.interval).await;
				}
			}
		}
	}
}

////////////////////////////////////////////////////////////////////////////
/// Read whitespace-delimited datagrams from a UDP port.
pub struct UdpReader {
	bind_addr: String,
	socket: Option<tokio::net::UdpSocket>,
}

#[derive(serde::Deserialize)]
struct UdpReaderConfig {
	port: u16,
	#[serde(default = "default_interface")]
	interface: String,
}

fn default_interface() -> String {
	"0.0.0.0".to_owned()
}

impl UdpReader {
	pub fn from_config(kwargs: &serde_json::Value) -> anyhow::Result<Self> {
		let config: UdpReaderConfig = serde_json::from_value(kwargs.clone())?;
		Ok(UdpReader {
			bind_addr: format!("{}:{}", config.interface, config.port),
			socket: None,
		})
	}

	pub async fn bind(&mut self) -> anyhow::Result<SocketAddr> {
		if self.socket.is_none() {
			let socket = tokio::net::UdpSocket::bind(&self.bind_addr)
				.await
				.with_context(|| format!("unable to bind UDP socket {}", self.bind_addr))?;
			info!("UDPReader listening on {}", socket.local_addr()?);
			self.socket = Some(socket);
		}
		Ok(self.socket.as_ref().expect("bound above").local_addr()?)
	}
}

#[async_trait::async_trait]
impl Reader for UdpReader {
	async fn read(&mut self) -> anyhow::Result<Option<Payload>> {
		self.bind().await?;
		let socket = self.socket.as_ref().expect("bound above");
		let mut buffer = vec![0u8; 65536];
		let (len, _addr) = socket.recv_from(&mut buffer).await?;
		let text = String::from_utf8_lossy(&buffer[..len])
			.trim_end_matches(['\r', '\n'].as_ref())
			.to_owned();
		Ok(Some(Payload::Text(text)))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::io::Write;

	#[tokio::test]
	async fn text_file_reader_yields_lines_then_none() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("input.txt");
		let mut file = std::fs::File::create(&path).unwrap();
		writeln!(file, "line one").unwrap();
		writeln!(file, "line two").unwrap();

		let mut reader = TextFileReader::from_config(&serde_json::json!({
			"filename": path.to_str().unwrap()
		}))
		.unwrap();
		assert_eq!(
			reader.read().await.unwrap(),
			Some(Payload::Text("line one".to_owned()))
		);
		assert_eq!(
			reader.read().await.unwrap(),
			Some(Payload::Text("line two".to_owned()))
		);
		assert_eq!(reader.read().await.unwrap(), None);
	}

	#[tokio::test]
	async fn missing_file_is_an_error() {
		let mut reader = TextFileReader::from_config(&serde_json::json!({
			"filename": "/nonexistent/input.txt"
		}))
		.unwrap();
		assert!(reader.read().await.is_err());
	}

	#[tokio::test]
	async fn udp_reader_receives_datagrams() {
		let mut reader = UdpReader::from_config(&serde_json::json!({
			"port": 0,
			"interface": "127.0.0.1"
		}))
		.unwrap();
		let addr = reader.bind().await.unwrap();

		let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
		sender.send_to(b"gyr1 $HEHDT,235.9,T*1b\r\n", addr).unwrap();

		let payload = reader.read().await.unwrap().unwrap();
		assert_eq!(payload, Payload::Text("gyr1 $HEHDT,235.9,T*1b".to_owned()));
	}

	#[test]
	fn factory_rejects_unknown_class() {
		assert!(build(&serde_json::json!({"class": "NoSuchReader"})).is_err());
	}
}
