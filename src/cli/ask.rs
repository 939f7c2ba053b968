use anyhow::{Context, Result, bail};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use clap::Args;
use futures::StreamExt;
use std::path::PathBuf;

use super::build_runtime;
use crate::agent::{AgentEvent, DEFAULT_THREAD_ID, TurnRequest};
use crate::config::Config;

#[derive(Args)]
pub struct AskArgs {
    /// The message to send
    pub message: String,

    /// Path to a receipt image to attach
    #[arg(short, long)]
    pub image: Option<PathBuf>,

    /// Conversation thread to continue
    #[arg(short, long, default_value = DEFAULT_THREAD_ID)]
    pub thread: String,
}

/// Read an image file into the data-URI form the model API expects.
fn image_data_uri(path: &PathBuf) -> Result<String> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Reading image at {}", path.display()))?;
    let mime = match path.extension().and_then(|e| e.to_str()) {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "image/png",
    };
    Ok(format!("data:{mime};base64,{}", BASE64.encode(bytes)))
}

pub async fn run(args: AskArgs) -> Result<()> {
    let config = Config::load()?;
    let runtime = build_runtime(&config)?;

    let image = args.image.as_ref().map(image_data_uri).transpose()?;

    let turn = TurnRequest {
        message: args.message,
        image,
        user_id: runtime.user_id.clone(),
        thread_id: args.thread,
    };

    let mut events = std::pin::pin!(runtime.orchestrator.run(turn));
    while let Some(event) = events.next().await {
        match event {
            AgentEvent::Status(_) | AgentEvent::Content(_) => {}
            AgentEvent::Done(text) => {
                println!("{text}");
                return Ok(());
            }
            AgentEvent::Error(text) => bail!("{text}"),
        }
    }

    bail!("Agent ended without a terminal event")
}
