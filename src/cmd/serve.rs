//! HTTP server command: `studio serve`.

use anyhow::Result;

use forge_studio::config::StudioConfig;
use forge_studio::engine::Runtime;
use forge_studio::server::{self, ServerConfig};

pub async fn cmd_serve(config: &StudioConfig, port: u16, dev: bool) -> Result<()> {
    let runtime = Runtime::start(config)?;
    server::start_server(runtime, ServerConfig { port, dev_mode: dev }).await
}
