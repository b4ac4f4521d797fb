//! In-conversation command parsing. Every `/` command produces a
//! deterministic control action, kept separate from LLM traffic.

use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Exit,
    Clear,
    Copy,
    File(PathBuf),
    /// `/model` lists, `/model <id>` switches.
    Model(Option<String>),
    /// `/agent` lists, `/agent <name>` switches.
    Agent(Option<String>),
    Jump(usize),
    Think(String),
    List,
    Load(String),
    Debug,
    Help,
    /// Anything that is not a command goes to the current agent.
    Message(String),
}

pub fn parse(input: &str) -> Result<Command, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty input".to_string());
    }
    if trimmed.eq_ignore_ascii_case("exit") || trimmed.eq_ignore_ascii_case("quit") {
        return Ok(Command::Exit);
    }
    if !trimmed.starts_with('/') {
        return Ok(Command::Message(trimmed.to_string()));
    }

    let mut parts = trimmed.splitn(2, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let argument = parts.next().map(str::trim).filter(|s| !s.is_empty());

    match command {
        "/exit" | "/quit" => Ok(Command::Exit),
        "/clear" => Ok(Command::Clear),
        "/copy" => Ok(Command::Copy),
        "/file" => argument
            .map(|p| Command::File(PathBuf::from(shellexpand_home(p))))
            .ok_or_else(|| "usage: /file <path>".to_string()),
        "/model" => Ok(Command::Model(argument.map(String::from))),
        "/agent" => Ok(Command::Agent(argument.map(String::from))),
        "/jump" => argument
            .and_then(|a| a.parse::<usize>().ok())
            .map(Command::Jump)
            .ok_or_else(|| "usage: /jump <turn>".to_string()),
        "/think" => argument
            .map(|a| Command::Think(a.to_string()))
            .ok_or_else(|| "usage: /think <budget|low|medium|high|0|none>".to_string()),
        "/list" => Ok(Command::List),
        "/load" => argument
            .map(|a| Command::Load(a.to_string()))
            .ok_or_else(|| "usage: /load <conversation-id>".to_string()),
        "/debug" => Ok(Command::Debug),
        "/help" | "/?" => Ok(Command::Help),
        other => Err(format!("unknown command: {other} (try /help)")),
    }
}

fn shellexpand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().to_string();
        }
    }
    path.to_string()
}

pub const HELP: &str = "\
Commands:
  /clear            start a fresh conversation
  /copy             show the latest assistant response
  /file <path>      attach a file to your next message (PDF, image, or text)
  /model [id]       list models, or switch to one
  /agent [name]     list agents, or switch to one
  /jump <turn>      rewind the conversation to the end of a turn
  /think <n|level>  set thinking budget/effort (0 or none disables)
  /list             list stored conversations
  /load <id>        load a stored conversation
  /debug            dump the current conversation state
  /help             show this help
  exit | quit       leave the session
  Ctrl+C            cancel the in-flight turn";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_message() {
        assert_eq!(
            parse("hello there").unwrap(),
            Command::Message("hello there".to_string())
        );
    }

    #[test]
    fn test_exit_variants() {
        assert_eq!(parse("exit").unwrap(), Command::Exit);
        assert_eq!(parse("QUIT").unwrap(), Command::Exit);
        assert_eq!(parse("/exit").unwrap(), Command::Exit);
    }

    #[test]
    fn test_model_with_and_without_argument() {
        assert_eq!(parse("/model").unwrap(), Command::Model(None));
        assert_eq!(
            parse("/model gpt-4o").unwrap(),
            Command::Model(Some("gpt-4o".to_string()))
        );
    }

    #[test]
    fn test_jump_requires_number() {
        assert_eq!(parse("/jump 2").unwrap(), Command::Jump(2));
        assert!(parse("/jump").is_err());
        assert!(parse("/jump two").is_err());
    }

    #[test]
    fn test_think_argument_passthrough() {
        assert_eq!(
            parse("/think 2048").unwrap(),
            Command::Think("2048".to_string())
        );
        assert_eq!(
            parse("/think none").unwrap(),
            Command::Think("none".to_string())
        );
    }

    #[test]
    fn test_unknown_command() {
        assert!(parse("/frobnicate").is_err());
    }
}
