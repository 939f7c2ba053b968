pub mod ask;
pub mod chat;
pub mod serve;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

use crate::agent::{LlmClient, OpenAiCompatClient, Orchestrator, ToolCache, TurnMemory};
use crate::config::Config;
use crate::store::{SqliteStore, TransactionStore};

#[derive(Parser)]
#[command(name = "kasbot", version, about = "Chat-driven personal finance assistant")]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP server
    Serve,
    /// Ask a single question and print the reply
    Ask(ask::AskArgs),
    /// Interactive chat session
    Chat(chat::ChatArgs),
}

/// Everything a terminal session needs, wired from config.
pub(crate) struct Runtime {
    pub orchestrator: Orchestrator,
    pub user_id: String,
}

pub(crate) fn build_runtime(config: &Config) -> Result<Runtime> {
    let store: Arc<dyn TransactionStore> = Arc::new(SqliteStore::open(&config.database_path()?)?);

    let chat_client: Arc<dyn LlmClient> = Arc::new(OpenAiCompatClient::new(
        &config.provider.api_key,
        &config.provider.base_url,
        &config.agent.chat_model,
        config.agent.temperature,
        config.agent.max_tokens,
    ));
    let vision_client: Arc<dyn LlmClient> = Arc::new(OpenAiCompatClient::new(
        &config.provider.api_key,
        &config.provider.base_url,
        &config.agent.vision_model,
        config.agent.temperature,
        config.agent.max_tokens,
    ));

    Ok(Runtime {
        orchestrator: Orchestrator::new(
            chat_client,
            vision_client,
            Arc::new(ToolCache::new(store)),
            Arc::new(TurnMemory::new()),
        ),
        user_id: config.agent.default_user_id.clone(),
    })
}
