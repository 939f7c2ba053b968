use anyhow::Result;
use clap::Args;
use futures::StreamExt;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

use super::build_runtime;
use crate::agent::{AgentEvent, TurnRequest};
use crate::config::Config;

#[derive(Args)]
pub struct ChatArgs {
    /// Conversation thread to continue; a fresh one is created by default
    #[arg(short, long)]
    pub thread: Option<String>,
}

pub async fn run(args: ChatArgs) -> Result<()> {
    let config = Config::load()?;
    let runtime = build_runtime(&config)?;

    let mut thread_id = args
        .thread
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    println!("kasbot - ketik pesan Anda ('/new' untuk percakapan baru, '/quit' untuk keluar)");

    let mut editor = DefaultEditor::new()?;
    loop {
        let line = match editor.readline("> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        editor.add_history_entry(input)?;

        match input {
            "/quit" | "/exit" => break,
            "/new" => {
                thread_id = uuid::Uuid::new_v4().to_string();
                println!("Percakapan baru dimulai.");
                continue;
            }
            _ => {}
        }

        let turn = TurnRequest {
            message: input.to_string(),
            image: None,
            user_id: runtime.user_id.clone(),
            thread_id: thread_id.clone(),
        };

        let mut events = std::pin::pin!(runtime.orchestrator.run(turn));
        while let Some(event) = events.next().await {
            match event {
                AgentEvent::Status(text) => println!("{text}"),
                AgentEvent::Content(_) => {}
                AgentEvent::Done(text) => println!("{text}"),
                AgentEvent::Error(text) => eprintln!("Error: {text}"),
            }
        }
    }

    Ok(())
}
