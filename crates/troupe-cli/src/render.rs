//! Streams turn events to the terminal as they arrive.

use std::io::Write;

use console::style;
use tokio::sync::mpsc;
use troupe::engine::UiEvent;
use troupe::providers::base::StreamEvent;

/// Consume a turn's events, printing incrementally. Returns the assistant
/// text accumulated over the turn (for `/copy`).
pub async fn render_events(mut rx: mpsc::Receiver<UiEvent>, plain: bool) -> String {
    let mut response = String::new();
    let mut thinking_open = false;

    while let Some(event) = rx.recv().await {
        match event {
            UiEvent::Stream { event, .. } => match event {
                StreamEvent::TextDelta { text } => {
                    if thinking_open {
                        println!();
                        thinking_open = false;
                    }
                    response.push_str(&text);
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
                StreamEvent::ThinkingDelta { text } => {
                    thinking_open = true;
                    if plain {
                        print!("{text}");
                    } else {
                        print!("{}", style(text).dim());
                    }
                    let _ = std::io::stdout().flush();
                }
                StreamEvent::ToolCallStart { name, .. } => {
                    if plain {
                        println!("\n─── {name} ───");
                    } else {
                        println!("\n─── {} ───", style(name).magenta());
                    }
                }
                StreamEvent::UsageUpdate { usage } => {
                    if let (Some(input), Some(output)) = (usage.input_tokens, usage.output_tokens)
                    {
                        let cost = usage
                            .cost
                            .map(|c| format!(" (${c:.4})"))
                            .unwrap_or_default();
                        let line = format!("tokens: {input} in / {output} out{cost}");
                        if plain {
                            eprintln!("{line}");
                        } else {
                            eprintln!("{}", style(line).dim());
                        }
                    }
                }
                _ => {}
            },
            UiEvent::ToolResult {
                name,
                content,
                is_error,
                ..
            } => {
                let summary = if content.chars().count() > 200 {
                    let cut: String = content.chars().take(200).collect();
                    format!("{cut}…")
                } else {
                    content
                };
                if is_error {
                    if plain {
                        println!("{name} failed: {summary}");
                    } else {
                        println!("{} {}", style(format!("{name} failed:")).red(), summary);
                    }
                } else if plain {
                    println!("{summary}");
                } else {
                    println!("{}", style(summary).dim());
                }
            }
            UiEvent::AgentChanged { agent } => {
                if plain {
                    println!("\n→ transferred to {agent}");
                } else {
                    println!("\n→ transferred to {}", style(agent).cyan().bold());
                }
            }
            UiEvent::TurnCompleted { .. } => {
                println!();
            }
        }
    }

    response
}
