mod config;
mod control;
mod convert;
mod dataflow;
mod devices;
mod listen;
mod logging;
mod parser;
mod readers;
mod record;
mod system;
mod system_tasks;
mod timeutil;
mod transforms;
mod writers;

use crate::system::System;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	System::run().await
}
