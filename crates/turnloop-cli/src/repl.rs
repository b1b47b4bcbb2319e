//! Interactive REPL for chat interface
//!
//! One session per REPL run, with readline history and slash commands.

use std::path::{Path, PathBuf};

use anyhow::Result;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use turnloop_core::{AgentLoop, ContentBlock, Role, Turn, TurnContent};

use crate::commands::{build_agent, format_tool, load_config, new_session_key, outcome_note};

// ANSI colors
const GREEN: &str = "\x1b[92m";
const BLUE: &str = "\x1b[94m";
const YELLOW: &str = "\x1b[93m";
const CYAN: &str = "\x1b[96m";
const DIM: &str = "\x1b[2m";
const BOLD: &str = "\x1b[1m";
const RESET: &str = "\x1b[0m";

/// REPL state
struct ReplState {
    agent: AgentLoop,
    session: String,
    model: String,
}

/// What a slash command asks the loop to do next
#[derive(Debug, PartialEq, Eq)]
enum SlashAction {
    Continue,
    Exit,
}

/// Run the interactive REPL
pub async fn run(config_path: Option<&Path>, session: Option<String>) -> Result<()> {
    let config = load_config(config_path)?;
    let mut state = ReplState {
        agent: build_agent(&config)?,
        session: session.unwrap_or_else(new_session_key),
        model: config.model.model.clone(),
    };

    let history_path = input_history_path();
    let mut rl = DefaultEditor::new()?;
    if let Some(path) = &history_path {
        let _ = rl.load_history(path);
    }

    print_welcome(&state);

    loop {
        let prompt = format!("{}turnloop>{} ", CYAN, RESET);

        match rl.readline(&prompt) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                if line.starts_with('/') {
                    match handle_slash_command(&mut state, line).await {
                        Ok(SlashAction::Exit) => break,
                        Ok(SlashAction::Continue) => continue,
                        Err(e) => {
                            eprintln!("{}Error:{} {:#}", YELLOW, RESET, e);
                            continue;
                        }
                    }
                }

                if let Err(e) = send_message(&state, line).await {
                    eprintln!("{}Error:{} {:#}", YELLOW, RESET, e);
                }
            }
            Err(ReadlineError::Interrupted) => {
                println!("{}^C{}", DIM, RESET);
                continue;
            }
            Err(ReadlineError::Eof) => {
                println!("{}Goodbye!{}", DIM, RESET);
                break;
            }
            Err(e) => {
                eprintln!("{}Error:{} {}", YELLOW, RESET, e);
                break;
            }
        }
    }

    if let Some(path) = &history_path {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = rl.save_history(path);
    }

    Ok(())
}

fn input_history_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("turnloop").join("history.txt"))
}

fn print_welcome(state: &ReplState) {
    println!();
    println!("{}{}turnloop{} chat", BOLD, GREEN, RESET);
    println!("{}Model:{} {}{}{}", DIM, RESET, BLUE, state.model, RESET);
    println!("{}Session:{} {}", DIM, RESET, state.session);
    println!("Type {}/help{} for commands", CYAN, RESET);
    println!();
}

async fn send_message(state: &ReplState, input: &str) -> Result<()> {
    let reply = state.agent.process_message(&state.session, input).await?;

    println!();
    println!("{}", reply.text);
    if reply.tool_calls > 0 {
        println!(
            "{}[{} tool call(s), {} model call(s)]{}",
            DIM, reply.tool_calls, reply.iterations, RESET
        );
    }
    if let Some(note) = outcome_note(&reply.outcome) {
        println!("{}Note:{} {}", YELLOW, RESET, note);
    }
    println!();
    Ok(())
}

/// Handle slash commands
async fn handle_slash_command(state: &mut ReplState, input: &str) -> Result<SlashAction> {
    let cmd = input.split_whitespace().next().unwrap_or("").to_lowercase();

    match cmd.as_str() {
        "/help" | "/h" | "/?" => print_help(),
        "/exit" | "/quit" | "/q" => {
            println!("{}Goodbye!{}", DIM, RESET);
            return Ok(SlashAction::Exit);
        }
        "/history" => {
            let turns = state.agent.history(&state.session).await?;
            if turns.is_empty() {
                println!("{}No messages yet{}", DIM, RESET);
            }
            for turn in &turns {
                println!("{}", format_turn(turn));
            }
        }
        "/clear" => {
            state.agent.clear_session(&state.session).await?;
            state.session = new_session_key();
            println!("{}Conversation cleared{}", DIM, RESET);
        }
        "/metrics" => {
            let snapshot = state.agent.metrics_snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        "/tools" => {
            for def in state.agent.registry().list_definitions() {
                print!("{}", format_tool(&def));
            }
        }
        _ => {
            println!(
                "{}Unknown command:{} {} (try /help)",
                YELLOW, RESET, cmd
            );
        }
    }
    Ok(SlashAction::Continue)
}

fn print_help() {
    println!("{}Commands:{}", BOLD, RESET);
    println!("  {}/help{}      Show this help", CYAN, RESET);
    println!("  {}/history{}   Show the conversation so far", CYAN, RESET);
    println!("  {}/clear{}     Start a fresh conversation", CYAN, RESET);
    println!("  {}/metrics{}   Show counters, gauges and rate limit state", CYAN, RESET);
    println!("  {}/tools{}     List available tools", CYAN, RESET);
    println!("  {}/exit{}      Leave the REPL", CYAN, RESET);
}

/// One-line-per-block rendering of a turn
fn format_turn(turn: &Turn) -> String {
    let label = match (turn.role, turn.is_tool_results()) {
        (Role::User, true) => "tool",
        (Role::User, false) => "you",
        (Role::Assistant, _) => "assistant",
    };

    let body = match &turn.content {
        TurnContent::Text(text) => text.clone(),
        TurnContent::Blocks(blocks) => blocks
            .iter()
            .map(format_block)
            .collect::<Vec<_>>()
            .join("\n  "),
    };
    format!("{}{}:{} {}", BOLD, label, RESET, body)
}

fn format_block(block: &ContentBlock) -> String {
    match block {
        ContentBlock::Text { text } => text.clone(),
        ContentBlock::ToolUse { name, input, .. } => format!("-> {}({})", name, input),
        ContentBlock::ToolResult {
            content, is_error, ..
        } => {
            let preview: String = content.chars().take(200).collect();
            if *is_error {
                format!("<- error: {}", preview)
            } else {
                format!("<- {}", preview)
            }
        }
        ContentBlock::Unsupported => "[unsupported block]".to_string(),
    }
}
