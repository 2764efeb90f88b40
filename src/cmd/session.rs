//! Session workflow commands: `studio plan|approve|fast|repair|reset`.

use std::io::Write;

use anyhow::{Result, bail};
use console::style;

use forge_studio::config::StudioConfig;
use forge_studio::engine::{EventStream, Runtime, StudioEvent};
use forge_studio::preview::Framework;

fn parse_framework(raw: &str) -> Result<Framework> {
    raw.parse::<Framework>().map_err(anyhow::Error::msg)
}

/// Print events as they arrive. Fails when the stream ends in an error.
async fn render(mut events: EventStream) -> Result<()> {
    let mut mid_line = false;
    while let Some(event) = events.recv().await {
        if mid_line && !matches!(event, StudioEvent::Chunk { .. }) {
            println!();
            mid_line = false;
        }
        match event {
            StudioEvent::Status { message } => {
                println!("{} {}", style("›").cyan(), style(message).dim());
            }
            StudioEvent::Chunk { content } => {
                print!("{}", content);
                std::io::stdout().flush().ok();
                mid_line = !content.ends_with('\n');
            }
            StudioEvent::Changes { files } => {
                println!("{} {}", style("Changed:").green(), files.join(", "));
            }
            StudioEvent::Error { message } => {
                bail!(message);
            }
            StudioEvent::Complete { phase, .. } => {
                match phase {
                    Some(phase) => println!("{} (phase: {})", style("Done").green().bold(), phase),
                    None => println!("{}", style("Done").green().bold()),
                }
                return Ok(());
            }
        }
    }
    bail!("Event stream closed without a result")
}

async fn run_with(config: &StudioConfig, events: impl FnOnce(&Runtime) -> EventStream) -> Result<()> {
    let runtime = Runtime::start(config)?;
    let result = render(events(&runtime)).await;
    runtime.shutdown().await;
    result
}

pub async fn cmd_plan(config: &StudioConfig, session: &str, prompt: &str, framework: &str) -> Result<()> {
    let framework = parse_framework(framework)?;
    run_with(config, |rt| rt.engine().plan_stream(session, prompt, framework)).await?;
    println!();
    println!("Run 'studio approve {}' to implement this plan.", session);
    Ok(())
}

pub async fn cmd_approve(config: &StudioConfig, session: &str) -> Result<()> {
    run_with(config, |rt| rt.engine().approve_and_code_stream(session)).await
}

pub async fn cmd_fast(config: &StudioConfig, session: &str, message: &str, framework: &str) -> Result<()> {
    let framework = parse_framework(framework)?;
    run_with(config, |rt| rt.engine().fast_mode(session, message, framework)).await
}

pub async fn cmd_repair(config: &StudioConfig, session: &str, framework: Option<&str>) -> Result<()> {
    let framework = framework.map(parse_framework).transpose()?;
    let runtime = Runtime::start(config)?;
    let framework = match framework {
        Some(f) => f,
        None => runtime
            .engine()
            .store()
            .get_framework(session)
            .await?
            .unwrap_or_default(),
    };
    let result = render(runtime.engine().repair(session, framework)).await;
    runtime.shutdown().await;
    result
}

pub async fn cmd_reset(config: &StudioConfig, session: &str) -> Result<()> {
    let runtime = Runtime::start(config)?;
    let result = runtime.engine().reset(session).await;
    runtime.shutdown().await;
    let from = result?;
    println!("Session {} reset ({} → idle)", style(session).bold(), from);
    Ok(())
}
