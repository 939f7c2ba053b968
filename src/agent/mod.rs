//! Agent orchestrator.
//!
//! One chat turn is a cyclic loop between two states: consult the model
//! (`Agent`) and execute whatever tools it asked for (`Tools`), feeding the
//! results back until the model produces a plain answer (`End`). The state
//! space is fixed and small, so the loop is an explicit `match` over an
//! enum rather than a general graph engine. Guards bound the cycle twice:
//! a window-based loop guard catches a model that keeps requesting tools
//! without converging, and a hard step cap catches everything else.

mod extract;
mod memory;
mod prompts;
mod provider;
mod tools;

pub use extract::{ExtractedTransaction, extract_transaction_from_analysis};
pub use memory::TurnMemory;
pub use prompts::{LOOP_GUARD_APOLOGY, MISSING_USER_ID, REUPLOAD_REQUEST};
pub use provider::{
    ChatReply, ContentPart, ImageUrl, LlmClient, Message, MessageContent, OpenAiCompatClient,
    Role, ToolCall, ToolSchema,
};
pub use tools::{Tool, ToolCache, create_tools_for_user, is_write_operation};

use chrono::Utc;
use futures::Stream;
use std::sync::Arc;
use tracing::{debug, warn};

/// Thread identifier used when the caller does not supply one.
pub const DEFAULT_THREAD_ID: &str = "default";

/// Hard cap on orchestrator cycles per turn; the de facto cancellation
/// mechanism.
pub const MAX_STEPS: usize = 15;

const LOOP_GUARD_WINDOW: usize = 6;
const LOOP_GUARD_LIMIT: usize = 3;

const STATUS_PROCESSING_IMAGE: &str = "📷 Processing image with multimodal AI...";
const STATUS_PROCESSING_DATA: &str = "🔧 Processing financial data...";
const STATUS_DATA_PROCESSED: &str = "✅ Data processed";
const STATUS_UPDATING_RECORDS: &str = "📊 Updating financial records...";

/// One chat turn as received from the transport layer.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub message: String,
    /// Base64 data URI of an attached image, if any.
    pub image: Option<String>,
    pub user_id: String,
    pub thread_id: String,
}

/// Progress and terminal events emitted while a turn runs. Exactly one
/// `Done` or `Error` terminates the sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    Status(String),
    Content(String),
    Done(String),
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Agent,
    Tools,
    End,
}

/// Which model variant and system instruction an `Agent` step uses.
/// Selected fresh on every step, never once per turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// Image attached: vision model, extraction instruction, no tools.
    Multimodal,
    /// Bare confirmation after a receipt analysis: execute the create tool
    /// immediately, no questions.
    AutoConfirmAdd,
    /// Default tool-enabled chat.
    Standard,
}

fn select_mode(messages: &[Message], has_image: bool) -> Mode {
    if has_image {
        return Mode::Multimodal;
    }

    let last_is_confirmation = matches!(
        messages.last(),
        Some(m) if m.role == Role::User && prompts::is_confirmation(m.text_content())
    );
    let has_analysis = messages
        .iter()
        .any(|m| m.role == Role::Assistant && prompts::looks_like_analysis(m.text_content()));

    if last_is_confirmation && has_analysis {
        Mode::AutoConfirmAdd
    } else {
        Mode::Standard
    }
}

/// True when the model has requested tools three or more times within the
/// last six messages: it is spinning, not converging.
fn loop_guard_tripped(messages: &[Message]) -> bool {
    let window_start = messages.len().saturating_sub(LOOP_GUARD_WINDOW);
    let tool_requests = messages[window_start..]
        .iter()
        .filter(|m| m.role == Role::Assistant && m.has_tool_calls())
        .count();
    tool_requests >= LOOP_GUARD_LIMIT
}

/// Keep exactly one system message, at the head. Replaces the head when the
/// active instruction differs; every other message is preserved.
fn apply_system_instruction(messages: &mut Vec<Message>, instruction: &str) {
    let head_current = matches!(
        messages.first(),
        Some(m) if m.role == Role::System && m.text_content() == instruction
    );
    if head_current {
        return;
    }
    messages.retain(|m| m.role != Role::System);
    messages.insert(0, Message::system(instruction));
}

pub struct Orchestrator {
    chat_client: Arc<dyn LlmClient>,
    vision_client: Arc<dyn LlmClient>,
    tool_cache: Arc<ToolCache>,
    memory: Arc<TurnMemory>,
}

impl Orchestrator {
    pub fn new(
        chat_client: Arc<dyn LlmClient>,
        vision_client: Arc<dyn LlmClient>,
        tool_cache: Arc<ToolCache>,
        memory: Arc<TurnMemory>,
    ) -> Self {
        Self {
            chat_client,
            vision_client,
            tool_cache,
            memory,
        }
    }

    /// Run one turn, emitting progress events and exactly one terminal
    /// event. The thread's history is loaded first and checkpointed back
    /// when the turn ends.
    pub fn run(&self, request: TurnRequest) -> impl Stream<Item = AgentEvent> + Send + 'static {
        let chat_client = self.chat_client.clone();
        let vision_client = self.vision_client.clone();
        let tool_cache = self.tool_cache.clone();
        let memory = self.memory.clone();

        async_stream::stream! {
            if request.user_id.is_empty() {
                yield AgentEvent::Content(MISSING_USER_ID.to_string());
                yield AgentEvent::Done(MISSING_USER_ID.to_string());
                return;
            }

            // Fresh tool handles for every conversation turn
            tool_cache.invalidate(&request.user_id);

            let mut messages = memory.load(&request.thread_id);
            messages.push(Message::user(request.message.clone()));

            if request.image.is_some() {
                yield AgentEvent::Status(STATUS_PROCESSING_IMAGE.to_string());
            } else {
                yield AgentEvent::Status(STATUS_PROCESSING_DATA.to_string());
            }

            let today = Utc::now().date_naive();
            let mut final_response = String::new();
            let mut processing_tools = false;
            let mut steps_taken = 0usize;
            let mut step = Step::Agent;

            loop {
                match step {
                    Step::Agent => {
                        steps_taken += 1;
                        if steps_taken > MAX_STEPS {
                            memory.save(&request.thread_id, messages);
                            yield AgentEvent::Error(step_limit_message());
                            return;
                        }

                        if loop_guard_tripped(&messages) {
                            warn!(
                                "Loop guard tripped for thread {} after {} steps",
                                request.thread_id, steps_taken
                            );
                            if processing_tools {
                                yield AgentEvent::Status(STATUS_DATA_PROCESSED.to_string());
                            }
                            messages.push(Message::assistant(LOOP_GUARD_APOLOGY));
                            final_response = LOOP_GUARD_APOLOGY.to_string();
                            yield AgentEvent::Content(final_response.clone());
                            step = Step::End;
                            continue;
                        }

                        let mode = select_mode(&messages, request.image.is_some());
                        debug!("Agent step {} mode {:?}", steps_taken, mode);

                        let instruction = match mode {
                            Mode::Multimodal => prompts::vision_system_prompt(today),
                            Mode::AutoConfirmAdd => {
                                prompts::auto_add_system_prompt(&request.user_id, today)
                            }
                            Mode::Standard => {
                                prompts::tool_system_prompt(&request.user_id, today)
                            }
                        };
                        apply_system_instruction(&mut messages, &instruction);

                        // Transient rewrites: the sequence sent to the model
                        // may differ from the persisted history.
                        let mut effective = messages.clone();
                        match mode {
                            Mode::Multimodal => {
                                if let (Some(last), Some(image)) =
                                    (effective.last_mut(), request.image.as_deref())
                                    && last.role == Role::User
                                {
                                    last.content = MessageContent::Parts(vec![
                                        ContentPart::Text {
                                            text: last.text_content().to_string(),
                                        },
                                        ContentPart::ImageUrl {
                                            image_url: ImageUrl {
                                                url: image.to_string(),
                                            },
                                        },
                                    ]);
                                }
                            }
                            Mode::AutoConfirmAdd => {
                                let replacement = match extract_transaction_from_analysis(
                                    &messages, today,
                                ) {
                                    Some(data) => prompts::auto_execute_instruction(
                                        &data.to_tool_parameters(),
                                    ),
                                    None => REUPLOAD_REQUEST.to_string(),
                                };
                                debug!("Confirmation rewritten to: {}", replacement);
                                if let Some(last) = effective.last_mut() {
                                    *last = Message::user(replacement);
                                }
                            }
                            Mode::Standard => {}
                        }

                        let reply = if mode == Mode::Multimodal {
                            vision_client.invoke(&effective, None).await
                        } else {
                            let schemas: Vec<ToolSchema> = tool_cache
                                .tools_for_user(&request.user_id)
                                .iter()
                                .map(|t| t.schema())
                                .collect();
                            chat_client.invoke(&effective, Some(&schemas)).await
                        };

                        match reply {
                            Ok(ChatReply::ToolCalls(calls)) => {
                                if !processing_tools {
                                    yield AgentEvent::Status(STATUS_PROCESSING_DATA.to_string());
                                    processing_tools = true;
                                }
                                debug!(
                                    "Model requested {} tool call(s): {:?}",
                                    calls.len(),
                                    calls.iter().map(|c| c.name.as_str()).collect::<Vec<_>>()
                                );
                                messages.push(Message::assistant_tool_calls(calls));
                                step = Step::Tools;
                            }
                            Ok(ChatReply::Text(text)) => {
                                if processing_tools {
                                    yield AgentEvent::Status(STATUS_DATA_PROCESSED.to_string());
                                }
                                messages.push(Message::assistant(text.clone()));
                                final_response = text.clone();
                                yield AgentEvent::Content(text);
                                step = Step::End;
                            }
                            Err(e) => {
                                // Converted to a terminal assistant message,
                                // never retried within the turn
                                warn!("Model invocation failed: {e:#}");
                                if processing_tools {
                                    yield AgentEvent::Status(STATUS_DATA_PROCESSED.to_string());
                                }
                                let text = format!("Error: {e}");
                                messages.push(Message::assistant(text.clone()));
                                final_response = text.clone();
                                yield AgentEvent::Content(text);
                                step = Step::End;
                            }
                        }
                    }

                    Step::Tools => {
                        steps_taken += 1;
                        if steps_taken > MAX_STEPS {
                            memory.save(&request.thread_id, messages);
                            yield AgentEvent::Error(step_limit_message());
                            return;
                        }

                        let calls: Vec<ToolCall> = messages
                            .last()
                            .and_then(|m| m.tool_calls.clone())
                            .unwrap_or_default();

                        let has_write = calls.iter().any(|c| is_write_operation(&c.name));
                        if has_write {
                            // Drop handles before the batch so nothing stale
                            // is reused mid-flight
                            tool_cache.invalidate(&request.user_id);
                        }

                        let tools = tool_cache.tools_for_user(&request.user_id);

                        // Strictly in request order: a later call may depend
                        // on identifiers assigned by an earlier one
                        for call in calls {
                            yield AgentEvent::Status(STATUS_UPDATING_RECORDS.to_string());

                            let output = match tools.iter().find(|t| t.name() == call.name) {
                                Some(tool) => {
                                    debug!("Executing {} with args: {}", call.name, call.arguments);
                                    tool.execute(&call.arguments)
                                        .await
                                        .unwrap_or_else(|e| format!("Error: {e}"))
                                }
                                None => format!("Error: Unknown tool: {}", call.name),
                            };

                            messages.push(Message::tool_result(call.id, output));
                        }

                        if has_write {
                            // And again afterwards so the next read observes
                            // fresh state
                            tool_cache.invalidate(&request.user_id);
                        }

                        step = Step::Agent;
                    }

                    Step::End => {
                        if final_response.is_empty() {
                            final_response = "Task completed successfully.".to_string();
                        }
                        memory.save(&request.thread_id, messages);
                        yield AgentEvent::Done(final_response);
                        return;
                    }
                }
            }
        }
    }
}

fn step_limit_message() -> String {
    format!("Agent exceeded the maximum of {MAX_STEPS} steps without producing a final reply")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{SqliteStore, TransactionStore};
    use anyhow::Result;
    use async_trait::async_trait;
    use futures::StreamExt;
    use rust_decimal::Decimal;
    use std::collections::VecDeque;
    use std::str::FromStr;
    use std::sync::Mutex;

    /// Scripted model: pops one reply per invocation and records every
    /// message sequence it was given.
    struct ScriptedClient {
        replies: Mutex<VecDeque<ChatReply>>,
        invocations: Mutex<Vec<Vec<Message>>>,
    }

    impl ScriptedClient {
        fn new(replies: Vec<ChatReply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                invocations: Mutex::new(Vec::new()),
            })
        }

        fn invocation_count(&self) -> usize {
            self.invocations.lock().unwrap().len()
        }

        fn invocation(&self, index: usize) -> Vec<Message> {
            self.invocations.lock().unwrap()[index].clone()
        }
    }

    #[async_trait]
    impl LlmClient for ScriptedClient {
        async fn invoke(
            &self,
            messages: &[Message],
            _tools: Option<&[ToolSchema]>,
        ) -> Result<ChatReply> {
            self.invocations.lock().unwrap().push(messages.to_vec());
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| anyhow::anyhow!("ScriptedClient exhausted"))
        }
    }

    /// Model that never converges: every reply requests the same tool call.
    struct AlwaysToolClient {
        calls_per_reply: usize,
        invocations: Mutex<usize>,
    }

    #[async_trait]
    impl LlmClient for AlwaysToolClient {
        async fn invoke(
            &self,
            _messages: &[Message],
            _tools: Option<&[ToolSchema]>,
        ) -> Result<ChatReply> {
            let mut count = self.invocations.lock().unwrap();
            *count += 1;
            let n = *count;
            Ok(ChatReply::ToolCalls(
                (0..self.calls_per_reply)
                    .map(|i| ToolCall {
                        id: format!("call_{n}_{i}"),
                        name: tools::READ_TOOL.to_string(),
                        arguments: "{}".to_string(),
                    })
                    .collect(),
            ))
        }
    }

    struct Fixture {
        orchestrator: Orchestrator,
        store: Arc<SqliteStore>,
        memory: Arc<TurnMemory>,
    }

    fn fixture(chat: Arc<dyn LlmClient>, vision: Arc<dyn LlmClient>) -> Fixture {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let memory = Arc::new(TurnMemory::new());
        let orchestrator = Orchestrator::new(
            chat,
            vision,
            Arc::new(ToolCache::new(store.clone())),
            memory.clone(),
        );
        Fixture {
            orchestrator,
            store,
            memory,
        }
    }

    fn request(message: &str) -> TurnRequest {
        TurnRequest {
            message: message.to_string(),
            image: None,
            user_id: "user-1".to_string(),
            thread_id: DEFAULT_THREAD_ID.to_string(),
        }
    }

    async fn collect(
        orchestrator: &Orchestrator,
        request: TurnRequest,
    ) -> Vec<AgentEvent> {
        orchestrator.run(request).collect().await
    }

    fn terminal_events(events: &[AgentEvent]) -> Vec<&AgentEvent> {
        events
            .iter()
            .filter(|e| matches!(e, AgentEvent::Done(_) | AgentEvent::Error(_)))
            .collect()
    }

    #[tokio::test]
    async fn test_missing_user_id_is_terminal_without_model_calls() {
        let chat = ScriptedClient::new(vec![ChatReply::Text("never".to_string())]);
        let fx = fixture(chat.clone(), chat.clone());

        let mut req = request("halo");
        req.user_id = String::new();
        let events = collect(&fx.orchestrator, req).await;

        assert_eq!(chat.invocation_count(), 0);
        assert_eq!(
            events.last(),
            Some(&AgentEvent::Done(MISSING_USER_ID.to_string()))
        );
        assert_eq!(terminal_events(&events).len(), 1);
    }

    #[tokio::test]
    async fn test_plain_answer_ends_after_one_model_call() {
        let chat = ScriptedClient::new(vec![ChatReply::Text("Halo! Ada yang bisa dibantu?".into())]);
        let fx = fixture(chat.clone(), chat.clone());

        let events = collect(&fx.orchestrator, request("halo")).await;

        assert_eq!(chat.invocation_count(), 1);
        assert!(events.contains(&AgentEvent::Content("Halo! Ada yang bisa dibantu?".into())));
        assert_eq!(
            events.last(),
            Some(&AgentEvent::Done("Halo! Ada yang bisa dibantu?".into()))
        );

        // Exactly one system message, at the head, on the wire
        let sent = chat.invocation(0);
        assert_eq!(sent[0].role, Role::System);
        assert_eq!(sent.iter().filter(|m| m.role == Role::System).count(), 1);
    }

    #[tokio::test]
    async fn test_scenario_a_create_flow_executes_tool_and_replies() {
        let today = Utc::now().date_naive().format("%Y-%m-%d").to_string();
        let args = format!(
            r#"{{"type":"expense","category":"Food & Beverage","amount":50000,"date":"{today}"}}"#
        );
        let chat = ScriptedClient::new(vec![
            ChatReply::ToolCalls(vec![ToolCall {
                id: "call_1".to_string(),
                name: tools::CREATE_TOOL.to_string(),
                arguments: args,
            }]),
            ChatReply::Text("Transaksi makan siang Rp 50.000 sudah dicatat.".to_string()),
        ]);
        let fx = fixture(chat.clone(), chat.clone());

        let events = collect(
            &fx.orchestrator,
            request("Saya makan siang 50000 hari ini kategori makanan"),
        )
        .await;

        // Stored with the exact amount
        let rows = fx
            .store
            .find("user-1", &crate::store::TransactionFilter::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].amount, Decimal::from_str("50000").unwrap());
        assert_eq!(rows[0].category, "Food & Beverage");

        // The tool result went back to the model on the second call
        let second = chat.invocation(1);
        assert!(second.iter().any(|m| {
            m.role == Role::Tool
                && m.text_content()
                    .starts_with("Transaction created successfully with ID: ")
        }));

        assert!(events.contains(&AgentEvent::Status(STATUS_PROCESSING_DATA.to_string())));
        assert!(events.contains(&AgentEvent::Status(STATUS_DATA_PROCESSED.to_string())));
        assert_eq!(
            events.last(),
            Some(&AgentEvent::Done(
                "Transaksi makan siang Rp 50.000 sudah dicatat.".into()
            ))
        );
        assert_eq!(terminal_events(&events).len(), 1);
    }

    #[tokio::test]
    async fn test_scenario_b_confirmation_sends_synthesized_instruction() {
        let chat = ScriptedClient::new(vec![ChatReply::Text("Transaksi dicatat.".into())]);
        let fx = fixture(chat.clone(), chat.clone());

        // A prior turn left a receipt analysis in this thread's history
        fx.memory.save(
            DEFAULT_THREAD_ID,
            vec![
                Message::user("tolong analisis struk ini"),
                Message::assistant(
                    "Berikut adalah detail transaksi yang telah diambil dari struk:\n\n\
                     Jumlah: Rp. 75.000\nKategori: Transportasi\n\n\
                     Ketik \"Tambah\" untuk menambahkan transaksi ini ke database Anda.",
                ),
            ],
        );

        let events = collect(&fx.orchestrator, request("tambah")).await;

        let sent = chat.invocation(0);
        let last = sent.last().unwrap();
        assert_eq!(last.role, Role::User);
        assert!(
            last.text_content()
                .starts_with("Execute create_financial_transaction tool immediately"),
            "{}",
            last.text_content()
        );
        assert!(last.text_content().contains("75000"));
        assert!(last.text_content().contains("Transportasi"));
        assert!(!last.text_content().contains("tambah"));

        // Auto-add directive active in the system head
        assert!(sent[0].text_content().contains("SPECIAL INSTRUCTION"));

        // The persisted history keeps the literal confirmation, not the
        // synthesized instruction
        let saved = fx.memory.load(DEFAULT_THREAD_ID);
        assert!(saved.iter().any(|m| m.role == Role::User && m.text_content() == "tambah"));
        assert_eq!(events.last(), Some(&AgentEvent::Done("Transaksi dicatat.".into())));
    }

    #[tokio::test]
    async fn test_confirmation_without_amount_asks_for_reupload() {
        let chat = ScriptedClient::new(vec![ChatReply::Text("Silakan upload ulang.".into())]);
        let fx = fixture(chat.clone(), chat.clone());

        fx.memory.save(
            DEFAULT_THREAD_ID,
            vec![Message::assistant(
                "Maaf, detail transaksi pada struk tidak terbaca. Silakan coba lagi.",
            )],
        );

        collect(&fx.orchestrator, request("tambah")).await;

        let sent = chat.invocation(0);
        assert_eq!(sent.last().unwrap().text_content(), REUPLOAD_REQUEST);
    }

    #[tokio::test]
    async fn test_multimodal_turn_rewrites_last_message_and_skips_tools() {
        let vision = ScriptedClient::new(vec![ChatReply::Text(
            "Jumlah: Rp. 75.000\nKategori: Transportasi".into(),
        )]);
        let chat = ScriptedClient::new(vec![]);
        let fx = fixture(chat.clone(), vision.clone());

        let mut req = request("analisis struk ini");
        req.image = Some("data:image/png;base64,AAAA".to_string());
        let events = collect(&fx.orchestrator, req).await;

        // The vision model got the combined payload; the chat model was idle
        assert_eq!(chat.invocation_count(), 0);
        assert_eq!(vision.invocation_count(), 1);

        let sent = vision.invocation(0);
        let last = sent.last().unwrap();
        assert!(matches!(&last.content, MessageContent::Parts(parts) if parts.len() == 2));

        // The persisted history keeps the plain text form
        let saved = fx.memory.load(DEFAULT_THREAD_ID);
        assert!(saved.iter().any(|m| {
            m.role == Role::User
                && matches!(m.content, MessageContent::Text(_))
                && m.text_content() == "analisis struk ini"
        }));

        assert!(events.contains(&AgentEvent::Status(STATUS_PROCESSING_IMAGE.to_string())));
        assert_eq!(terminal_events(&events).len(), 1);
    }

    #[tokio::test]
    async fn test_model_failure_becomes_terminal_assistant_message() {
        let chat = ScriptedClient::new(vec![]); // exhausted: first call errors
        let fx = fixture(chat.clone(), chat.clone());

        let events = collect(&fx.orchestrator, request("halo")).await;

        let last = events.last().unwrap();
        let AgentEvent::Done(text) = last else {
            panic!("expected Done, got {last:?}");
        };
        assert!(text.starts_with("Error: "), "{text}");
        assert_eq!(chat.invocation_count(), 1);
        assert_eq!(terminal_events(&events).len(), 1);
    }

    #[tokio::test]
    async fn test_scenario_d_loop_guard_stops_runaway_tool_calls() {
        let chat = Arc::new(AlwaysToolClient {
            calls_per_reply: 1,
            invocations: Mutex::new(0),
        });
        let fx = fixture(chat.clone(), chat.clone());

        let events = collect(&fx.orchestrator, request("berapa pengeluaran saya?")).await;

        // Three tool batches ran, then the guard cut in before a fourth
        assert_eq!(*chat.invocations.lock().unwrap(), 3);
        assert_eq!(
            events.last(),
            Some(&AgentEvent::Done(LOOP_GUARD_APOLOGY.to_string()))
        );
        assert_eq!(terminal_events(&events).len(), 1);

        // The apology is part of the thread history
        let saved = fx.memory.load(DEFAULT_THREAD_ID);
        assert_eq!(
            saved.last().map(|m| m.text_content().to_string()),
            Some(LOOP_GUARD_APOLOGY.to_string())
        );
    }

    #[tokio::test]
    async fn test_step_cap_terminates_when_guard_cannot_see_the_pattern() {
        // Three calls per batch push older assistant messages out of the
        // guard window, so only the hard step cap can end the turn
        let chat = Arc::new(AlwaysToolClient {
            calls_per_reply: 3,
            invocations: Mutex::new(0),
        });
        let fx = fixture(chat.clone(), chat.clone());

        let events = collect(&fx.orchestrator, request("halo")).await;

        let last = events.last().unwrap();
        assert!(matches!(last, AgentEvent::Error(_)), "{last:?}");
        assert_eq!(terminal_events(&events).len(), 1);
        assert!(*chat.invocations.lock().unwrap() <= MAX_STEPS);
    }

    #[tokio::test]
    async fn test_turn_memory_resumes_across_runs() {
        let chat = ScriptedClient::new(vec![
            ChatReply::Text("Pertama".into()),
            ChatReply::Text("Kedua".into()),
        ]);
        let fx = fixture(chat.clone(), chat.clone());

        collect(&fx.orchestrator, request("satu")).await;
        collect(&fx.orchestrator, request("dua")).await;

        // The second invocation carried the whole first exchange
        let second = chat.invocation(1);
        let texts: Vec<&str> = second.iter().map(|m| m.text_content()).collect();
        assert!(texts.contains(&"satu"));
        assert!(texts.contains(&"Pertama"));
        assert!(texts.contains(&"dua"));

        // Threads are isolated
        assert!(fx.memory.load("other-thread").is_empty());
    }

    #[test]
    fn test_mode_selection_is_pure() {
        let analysis = Message::assistant("Jumlah: Rp. 75.000\nKetik \"Tambah\" untuk menambahkan");

        // Image wins over everything
        assert_eq!(
            select_mode(&[Message::user("tambah")], true),
            Mode::Multimodal
        );

        // Confirmation + prior analysis
        assert_eq!(
            select_mode(&[analysis.clone(), Message::user(" Tambah ")], false),
            Mode::AutoConfirmAdd
        );

        // Confirmation without analysis stays standard
        assert_eq!(
            select_mode(&[Message::user("tambah")], false),
            Mode::Standard
        );

        // Analysis without confirmation stays standard
        assert_eq!(
            select_mode(&[analysis.clone(), Message::user("berapa total?")], false),
            Mode::Standard
        );

        // The confirmation must be the latest message
        assert_eq!(
            select_mode(
                &[Message::user("tambah"), analysis, Message::assistant("ok")],
                false
            ),
            Mode::Standard
        );
    }

    #[test]
    fn test_system_head_is_replaced_not_duplicated() {
        let mut messages = vec![Message::user("halo")];

        apply_system_instruction(&mut messages, "instruksi A");
        assert_eq!(messages[0].role, Role::System);
        assert_eq!(messages[0].text_content(), "instruksi A");
        assert_eq!(messages.len(), 2);

        // Same instruction: untouched
        apply_system_instruction(&mut messages, "instruksi A");
        assert_eq!(messages.len(), 2);

        // Different instruction: replaced in place, history preserved
        messages.push(Message::assistant("hai"));
        apply_system_instruction(&mut messages, "instruksi B");
        assert_eq!(messages.len(), 3);
        assert_eq!(messages[0].text_content(), "instruksi B");
        assert_eq!(messages.iter().filter(|m| m.role == Role::System).count(), 1);
        assert_eq!(messages[1].text_content(), "halo");
    }

    #[test]
    fn test_loop_guard_window_semantics() {
        let tool_request = || {
            Message::assistant_tool_calls(vec![ToolCall {
                id: "c".to_string(),
                name: tools::READ_TOOL.to_string(),
                arguments: "{}".to_string(),
            }])
        };
        let result = || Message::tool_result("c", "No transactions found matching your criteria.");

        // Two requests in the window: fine
        let messages = vec![
            Message::user("u"),
            tool_request(),
            result(),
            tool_request(),
            result(),
        ];
        assert!(!loop_guard_tripped(&messages));

        // Third request within the last six: tripped
        let messages = vec![
            Message::user("u"),
            tool_request(),
            result(),
            tool_request(),
            result(),
            tool_request(),
            result(),
        ];
        assert!(loop_guard_tripped(&messages));

        // Old requests that fell out of the window no longer count
        let mut messages = vec![
            tool_request(),
            result(),
            tool_request(),
            result(),
            tool_request(),
            result(),
        ];
        messages.extend([
            Message::assistant("done"),
            Message::user("next"),
            Message::assistant("sure"),
            Message::user("more"),
        ]);
        assert!(!loop_guard_tripped(&messages));
    }
}
