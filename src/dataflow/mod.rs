//! The pipeline runtime: a DAG of named nodes, each owning a reader,
//! transform or writer plus an inbound queue. Edges are subscriber lists;
//! results are broadcast to every subscriber's queue. Nodes run as
//! cooperative tokio tasks until told to quit.

use crate::readers::Reader;
use crate::record::Payload;
use crate::transforms::Transform;
use crate::writers::Writer;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{broadcast, Notify};
use tracing::*;

/// Back-pressure policy for a node's inbound queue. Unbounded is the
/// default; `Block` applies back-pressure to producers, `DropOldest`
/// prioritizes latency by evicting the head.
#[derive(Clone, Debug, serde::Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum QueuePolicy {
	Unbounded,
	Block { size: usize },
	DropOldest { size: usize },
}

impl Default for QueuePolicy {
	fn default() -> Self {
		QueuePolicy::Unbounded
	}
}

/// Async multi-producer single-consumer queue with a selectable policy.
pub struct NodeQueue {
	inner: Mutex<VecDeque<Payload>>,
	policy: QueuePolicy,
	data_ready: Notify,
	space_ready: Notify,
}

impl NodeQueue {
	pub fn new(policy: QueuePolicy) -> Self {
		NodeQueue {
			inner: Mutex::new(VecDeque::new()),
			policy,
			data_ready: Notify::new(),
			space_ready: Notify::new(),
		}
	}

	pub async fn push(&self, payload: Payload) {
		let mut payload = Some(payload);
		loop {
			{
				let mut queue = self.inner.lock();
				match &self.policy {
					QueuePolicy::Unbounded => {
						queue.push_back(payload.take().expect("payload present"));
					}
					QueuePolicy::Block { size } => {
						if queue.len() < *size {
							queue.push_back(payload.take().expect("payload present"));
						}
					}
					QueuePolicy::DropOldest { size } => {
						if queue.len() >= *size {
							queue.pop_front();
							debug!("NodeQueue dropped oldest entry at capacity {}", size);
						}
						queue.push_back(payload.take().expect("payload present"));
					}
				}
			}
			if payload.is_none() {
				break;
			}
			self.space_ready.notified().await;
		}
		self.data_ready.notify_one();
	}

	pub async fn pop(&self) -> Payload {
		loop {
			if let Some(payload) = self.inner.lock().pop_front() {
				self.space_ready.notify_one();
				return payload;
			}
			self.data_ready.notified().await;
		}
	}

	pub fn len(&self) -> usize {
		self.inner.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.inner.lock().is_empty()
	}
}

/// What a node runs: exactly one of the three pipeline roles.
pub enum Processor {
	Reader(Box<dyn Reader>),
	Transform(Box<dyn Transform>),
	Writer(Box<dyn Writer>),
}

pub struct Node {
	pub name: String,
	processor: Processor,
	pub subscription_list: Vec<String>,
	queue: Arc<NodeQueue>,
	subscribers: Vec<(String, Arc<NodeQueue>)>,
}

impl Node {
	pub fn new(
		name: impl Into<String>,
		processor: Processor,
		subscription_list: Vec<String>,
		policy: QueuePolicy,
	) -> Self {
		Node {
			name: name.into(),
			processor,
			subscription_list,
			queue: Arc::new(NodeQueue::new(policy)),
			subscribers: Vec::new(),
		}
	}

	pub fn queue(&self) -> Arc<NodeQueue> {
		self.queue.clone()
	}

	pub fn add_subscriber(&mut self, name: &str, queue: Arc<NodeQueue>) {
		debug!("Added subscription {} -> {}", self.name, name);
		self.subscribers.push((name.to_owned(), queue));
	}

	async fn send_result_to_subscribers(&self, result: Payload) {
		for (_, queue) in &self.subscribers {
			queue.push(result.clone()).await;
		}
	}

	/// Pull from the inbound queue (or read from the source) and fan
	/// results out, until quit is broadcast or the source is exhausted.
	pub async fn run(mut self, mut quit: broadcast::Receiver<()>) -> anyhow::Result<()> {
		info!("Node {:?} starting", self.name);
		loop {
			if self.subscription_list.is_empty() {
				let reader = match &mut self.processor {
					Processor::Reader(reader) => reader,
					_ => {
						warn!("Node {:?} has no subscriptions and is not a reader", self.name);
						break;
					}
				};
				let result = tokio::select! {
					_ = quit.recv() => break,
					result = reader.read() => result,
				};
				match result {
					Ok(Some(payload)) => self.send_result_to_subscribers(payload).await,
					Ok(None) => {
						info!("Node {:?} source exhausted", self.name);
						break;
					}
					Err(e) => {
						error!("Node {:?} read error: {}", self.name, e);
						break;
					}
				}
			} else {
				let queue = self.queue.clone();
				let payload = tokio::select! {
					_ = quit.recv() => break,
					payload = queue.pop() => payload,
				};
				let result = match &mut self.processor {
					Processor::Transform(transform) => transform.transform(payload),
					Processor::Writer(writer) => {
						if let Err(e) = writer.write(payload) {
							error!("Node {:?} write error: {}", self.name, e);
						}
						None
					}
					Processor::Reader(_) => {
						warn!("Node {:?} is a reader with subscriptions; ignoring input", self.name);
						None
					}
				};
				if let Some(result) = result {
					self.send_result_to_subscribers(result).await;
				}
			}
		}
		info!("Node {:?} exiting run() loop", self.name);
		Ok(())
	}
}

/// Per-node configuration inside a `nodes:` pipeline spec.
#[derive(serde::Deserialize)]
pub struct NodeConfig {
	pub class: String,
	#[serde(default)]
	pub kwargs: serde_json::Value,
	#[serde(default)]
	pub subscription_list: Vec<String>,
	#[serde(default)]
	pub queue: Option<QueuePolicy>,
}

/// Builds and runs a DAG of nodes.
pub struct DataflowRunner {
	nodes: Vec<Node>,
}

impl DataflowRunner {
	pub fn new(nodes: Vec<Node>) -> anyhow::Result<Self> {
		let mut runner = DataflowRunner { nodes };
		runner.wire_subscriptions()?;
		Ok(runner)
	}

	/// Build a runner from a map of `name: {class, kwargs,
	/// subscription_list}` node configs.
	pub fn from_config(config: &serde_json::Value) -> anyhow::Result<Self> {
		let map = config
			.as_object()
			.ok_or_else(|| anyhow::anyhow!("node configuration must be a mapping"))?;
		let mut nodes = Vec::new();
		for (name, node_value) in map {
			let node_config: NodeConfig = serde_json::from_value(node_value.clone())
				.map_err(|e| anyhow::anyhow!("bad definition for node {:?}: {}", name, e))?;
			let spec = serde_json::json!({
				"class": node_config.class,
				"kwargs": node_config.kwargs,
			});
			let processor = build_processor(&node_config.class, &spec)?;
			nodes.push(Node::new(
				name.clone(),
				processor,
				node_config.subscription_list,
				node_config.queue.unwrap_or_default(),
			));
		}
		Self::new(nodes)
	}

	fn wire_subscriptions(&mut self) -> anyhow::Result<()> {
		let queues: HashMap<String, Arc<NodeQueue>> = self
			.nodes
			.iter()
			.map(|node| (node.name.clone(), node.queue()))
			.collect();

		// Invert: each node must register itself with its sources.
		let mut edges: Vec<(String, String, Arc<NodeQueue>)> = Vec::new();
		for node in &self.nodes {
			for source in &node.subscription_list {
				if !queues.contains_key(source) {
					anyhow::bail!(
						"node {:?} subscribes to node {:?}, which does not exist",
						node.name,
						source
					);
				}
				edges.push((
					source.clone(),
					node.name.clone(),
					queues[&node.name].clone(),
				));
			}
		}
		for (source, subscriber, queue) in edges {
			let node = self
				.nodes
				.iter_mut()
				.find(|node| node.name == source)
				.expect("source existence checked above");
			node.add_subscriber(&subscriber, queue);
		}
		Ok(())
	}

	/// Spawn every node. Quit subscriptions are registered here, before
	/// this returns, so a quit broadcast sent any time afterwards is
	/// guaranteed to reach every node.
	pub fn start(self, quit: &broadcast::Sender<()>) -> Vec<tokio::task::JoinHandle<anyhow::Result<()>>> {
		self.nodes
			.into_iter()
			.map(|node| {
				let receiver = quit.subscribe();
				tokio::spawn(node.run(receiver))
			})
			.collect()
	}

	/// Spawn every node and wait for all of them to finish. Callers end
	/// the dataflow by broadcasting on `quit`.
	pub async fn run(self, quit: &broadcast::Sender<()>) -> anyhow::Result<()> {
		let handles = self.start(quit);
		for handle in handles {
			match handle.await {
				Ok(Ok(())) => {}
				Ok(Err(e)) => error!("Dataflow node returned an error: {}", e),
				Err(e) => error!("Dataflow node join error: {}", e),
			}
		}
		Ok(())
	}
}

/// A component class name maps to its factory by role suffix.
pub fn build_processor(class: &str, spec: &serde_json::Value) -> anyhow::Result<Processor> {
	if class.ends_with("Reader") {
		Ok(Processor::Reader(crate::readers::build(spec)?))
	} else if class.ends_with("Transform") {
		Ok(Processor::Transform(crate::transforms::build(spec)?))
	} else if class.ends_with("Writer") {
		Ok(Processor::Writer(crate::writers::build(spec)?))
	} else {
		anyhow::bail!("component class {:?} is not a Reader, Transform or Writer", class)
	}
}
