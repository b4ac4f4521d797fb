//! The interactive chat loop: reads input, dispatches slash commands, runs
//! turns against the engine, and renders events as they stream.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use base64::Engine as _;
use console::style;
use tokio_util::sync::CancellationToken;

use troupe::engine::{EventSink, TurnEngine, TurnOutcome};
use troupe::errors::Error;
use troupe::mcp::supervisor::McpSupervisor;
use troupe::models::message::{Message, MessageContent};
use troupe::providers::base::ThinkingLevel;

use crate::commands::{self, Command};
use crate::render;

pub struct Session {
    engine: TurnEngine,
    supervisor: Option<Arc<McpSupervisor>>,
    plain: bool,
    /// File parts staged by `/file`, attached to the next message.
    pending_parts: Vec<MessageContent>,
    last_response: String,
}

impl Session {
    pub fn new(engine: TurnEngine, supervisor: Option<Arc<McpSupervisor>>, plain: bool) -> Self {
        Self {
            engine,
            supervisor,
            plain,
            pending_parts: Vec::new(),
            last_response: String::new(),
        }
    }

    pub async fn start(&mut self) -> Result<()> {
        self.print_banner().await;
        let mut editor = rustyline::DefaultEditor::new()?;

        loop {
            let prompt = match self.engine.manager().current_name() {
                Some(agent) => format!("{agent} ▸ "),
                None => "▸ ".to_string(),
            };
            let line = match editor.readline(&prompt) {
                Ok(line) => line,
                Err(rustyline::error::ReadlineError::Interrupted) => continue,
                Err(rustyline::error::ReadlineError::Eof) => break,
                Err(e) => {
                    eprintln!("input error: {e}");
                    break;
                }
            };

            match commands::parse(&line) {
                Ok(Command::Exit) => break,
                Ok(Command::Message(text)) => {
                    let _ = editor.add_history_entry(&text);
                    self.send_message(text).await;
                }
                Ok(command) => {
                    if let Err(e) = self.handle_control(command).await {
                        println!("{}", e.user_message());
                    }
                }
                Err(usage) => println!("{usage}"),
            }
        }

        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown_all().await;
        }
        println!(
            "Conversation recorded as {}",
            self.engine.conversation().id
        );
        Ok(())
    }

    async fn print_banner(&self) {
        let model = self.engine.manager().models().get_current();
        println!(
            "troupe — agent: {}, model: {} ({})",
            self.engine.manager().current_name().unwrap_or("none"),
            model.id,
            model.provider
        );
        if let Some(supervisor) = &self.supervisor {
            for (server, connected) in supervisor.statuses().await {
                let status = if connected { "connected" } else { "disconnected" };
                println!("mcp: {server} {status}");
            }
        }
        println!("Type /help for commands.");
    }

    async fn send_message(&mut self, text: String) {
        let mut message = Message::user();
        for part in self.pending_parts.drain(..) {
            message = message.with_content(part);
        }
        message = message.with_text(text);

        let (sink, rx) = EventSink::channel();
        let renderer = tokio::spawn(render::render_events(rx, self.plain));
        let token = CancellationToken::new();

        let result = {
            let turn = self.engine.run_turn(message, &sink, token.clone());
            tokio::pin!(turn);
            loop {
                tokio::select! {
                    result = &mut turn => break result,
                    _ = tokio::signal::ctrl_c() => token.cancel(),
                }
            }
        };
        drop(sink);
        let rendered = renderer.await.unwrap_or_default();
        if !rendered.is_empty() {
            self.last_response = rendered;
        }

        match result {
            Ok(TurnOutcome::Completed) => {}
            Ok(TurnOutcome::Cancelled) => {
                println!(
                    "\n{}",
                    "Interrupted: the conversation was reset to before this message."
                );
            }
            Err(e) => println!("\n{}", e.user_message()),
        }
    }

    async fn handle_control(&mut self, command: Command) -> Result<(), Error> {
        match command {
            Command::Clear => {
                self.engine.clear()?;
                println!("Started a fresh conversation.");
            }
            Command::Copy => {
                if self.last_response.is_empty() {
                    println!("No assistant response yet.");
                } else {
                    println!("{}", self.last_response);
                }
            }
            Command::File(path) => match self.stage_file(&path) {
                Ok(note) => println!("{note}"),
                Err(hint) => println!("{hint}"),
            },
            Command::Model(None) => self.list_models(),
            Command::Model(Some(id)) => {
                self.engine.manager_mut()?.switch_model(&id)?;
                let model = self.engine.manager().models().get_current();
                println!("Switched to {} ({})", model.id, model.provider);
            }
            Command::Agent(None) => self.list_agents(),
            Command::Agent(Some(name)) => {
                self.engine.manager_mut()?.select(&name)?;
                println!("Switched to agent {name}");
            }
            Command::Jump(turn) => {
                self.engine.jump(turn)?;
                println!(
                    "Rewound to turn {turn}; {} turns remain.",
                    self.engine.conversation().turn_log.len()
                );
            }
            Command::Think(raw) => match ThinkingLevel::parse(&raw) {
                Some(level) => {
                    if self.engine.manager_mut()?.set_thinking(level) {
                        println!("Thinking set to {raw}");
                    } else {
                        println!("The current provider does not support this thinking mode.");
                    }
                }
                None => println!("usage: /think <budget|low|medium|high|0|none>"),
            },
            Command::List => {
                let metas = self.engine.store().list()?;
                if metas.is_empty() {
                    println!("No stored conversations.");
                }
                for meta in metas {
                    println!(
                        "{}  {}  {}",
                        meta.id,
                        meta.updated_at.format("%Y-%m-%d %H:%M"),
                        meta.title
                    );
                }
            }
            Command::Load(id) => {
                self.engine.load_conversation(&id)?;
                println!(
                    "Loaded '{}' ({} turns).",
                    self.engine.conversation().title,
                    self.engine.conversation().turn_log.len()
                );
            }
            Command::Debug => {
                let dump = serde_json::json!({
                    "conversation": self.engine.conversation(),
                    "live_histories": self.engine.manager().histories(),
                });
                println!("{}", serde_json::to_string_pretty(&dump).unwrap_or_default());
            }
            Command::Help => println!("{}", commands::HELP),
            Command::Exit | Command::Message(_) => unreachable!("handled by the caller"),
        }
        Ok(())
    }

    fn list_models(&self) {
        let models = self.engine.manager().models();
        let current = models.get_current();
        for model in models.list() {
            let marker = if model.id == current.id { "→" } else { " " };
            println!(
                "{marker} {}  {} ({})",
                model.id, model.display_name, model.provider
            );
        }
    }

    fn list_agents(&self) {
        let current = self.engine.manager().current_name().map(str::to_string);
        for agent in self.engine.manager().roster() {
            let marker = if Some(&agent.name) == current.as_ref() {
                "→"
            } else {
                " "
            };
            println!("{marker} {}: {}", agent.name, agent.description);
        }
    }

    /// Stage a file as message content for the next turn. PDFs and images
    /// travel as base64 parts; anything readable as UTF-8 is inlined as text.
    fn stage_file(&mut self, path: &Path) -> Result<String, String> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.display().to_string());
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let image_mime = match extension.as_str() {
            "png" => Some("image/png"),
            "jpg" | "jpeg" => Some("image/jpeg"),
            "gif" => Some("image/gif"),
            "webp" => Some("image/webp"),
            _ => None,
        };

        if extension == "pdf" {
            let bytes = std::fs::read(path).map_err(|e| format!("cannot read {name}: {e}"))?;
            let data = base64::engine::general_purpose::STANDARD.encode(bytes);
            self.pending_parts
                .push(MessageContent::document(data, "application/pdf", &name));
            return Ok(format!("Attached PDF {name} to your next message."));
        }
        if let Some(mime) = image_mime {
            let bytes = std::fs::read(path).map_err(|e| format!("cannot read {name}: {e}"))?;
            let data = base64::engine::general_purpose::STANDARD.encode(bytes);
            self.pending_parts.push(MessageContent::image(data, mime));
            return Ok(format!("Attached image {name} to your next message."));
        }
        match std::fs::read_to_string(path) {
            Ok(content) => {
                self.pending_parts.push(MessageContent::text(format!(
                    "Content of {name}:\n\n{content}"
                )));
                Ok(format!("Attached {name} to your next message."))
            }
            Err(_) => Err(format!(
                "unsupported file type — try PDF or plain text ({})",
                style(name).dim()
            )),
        }
    }
}
