use std::error::Error;
use std::io::Write;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::warn;

use crate::agent::memory::MemoryStats;
use crate::agent::orchestrator::QueryOrchestrator;
use crate::agent::session::Session;
use crate::agent::state::{QueryResponse, Role, UserContext};
use crate::auth::{authenticate, AuthError, MAX_LOGIN_ATTEMPTS};
use crate::config::AppConfig;
use crate::web::templates::{init_templates, render_help, render_welcome, EXIT_WORDS};

const RULE: &str = "======================================================================";

#[derive(Debug, Clone, PartialEq)]
pub enum ChatCommand {
    Empty,
    Quit,
    ChangeRole,
    Help,
    Stats,
    Reset,
    Ask(String),
}

impl ChatCommand {
    pub fn parse(input: &str) -> Self {
        let trimmed = input.trim();
        let lowered = trimmed.to_lowercase();
        match lowered.as_str() {
            "" => ChatCommand::Empty,
            "change role" => ChatCommand::ChangeRole,
            "help" => ChatCommand::Help,
            "stats" => ChatCommand::Stats,
            "reset" => ChatCommand::Reset,
            word if EXIT_WORDS.contains(&word) => ChatCommand::Quit,
            _ => ChatCommand::Ask(trimmed.to_string()),
        }
    }
}

/// Interactive terminal session over stdin/stdout.
pub async fn run(config: &AppConfig, orchestrator: QueryOrchestrator) -> Result<(), Box<dyn Error + Send + Sync>> {
    let templates = init_templates()?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("\n{}\nProperty Management Assistant\n{}\n", RULE, RULE);
    println!("NOTE: All users have READ-ONLY access. No data modifications allowed.");

    let Some(user) = sign_in(&mut lines, config).await? else {
        return Ok(());
    };
    let mut session = Session::new(user, config.agent.max_history);
    print_banner(&render_welcome(&templates, &session.user));

    loop {
        let Some(input) = prompt(&mut lines, "You: ").await? else {
            println!("\nGoodbye!");
            break;
        };

        match ChatCommand::parse(&input) {
            ChatCommand::Empty => continue,
            ChatCommand::Quit => {
                println!("\nGoodbye!");
                break;
            }
            ChatCommand::ChangeRole => {
                println!("\nSwitching roles...");
                let Some(user) = sign_in(&mut lines, config).await? else {
                    break;
                };
                session.change_role(user);
                print_banner(&render_welcome(&templates, &session.user));
            }
            ChatCommand::Help => println!("\n{}", render_help(&templates, session.user.role)),
            ChatCommand::Stats => {
                println!("\n{}", format_stats(&session.memory.stats()));
                let recent = session.memory.recent_summary(3);
                if !recent.is_empty() {
                    println!("{}", recent);
                }
                println!();
            }
            ChatCommand::Reset => {
                session.reset();
                println!("Conversation cleared.\n");
            }
            ChatCommand::Ask(question) => {
                let response = orchestrator.process(&mut session, &question).await;
                println!("Agent: {}\n", format_response(&response, config.agent.debug_mode));
            }
        }
    }

    Ok(())
}

async fn prompt<R: AsyncBufRead + Unpin>(lines: &mut Lines<R>, text: &str) -> std::io::Result<Option<String>> {
    print!("{}", text);
    std::io::stdout().flush()?;
    lines.next_line().await
}

async fn sign_in<R: AsyncBufRead + Unpin>(
    lines: &mut Lines<R>,
    config: &AppConfig,
) -> std::io::Result<Option<UserContext>> {
    println!("\nAvailable roles:");
    println!("  1. admin   - Full access: all properties + detailed data");
    println!("  2. owner   - Limited access: only YOUR properties");
    println!("  3. viewer  - Summary access: aggregated data only\n");

    let role = loop {
        let Some(choice) = prompt(lines, "Select role (1-3): ").await? else {
            return Ok(None);
        };
        match choice.parse::<Role>() {
            Ok(role) => break role,
            Err(_) => println!("[X] Invalid selection. Please choose 1, 2, or 3."),
        }
    };

    let owner_id = if role == Role::Owner {
        loop {
            let Some(choice) = prompt(lines, "Owner number (e.g. 2 for LLC2): ").await? else {
                return Ok(None);
            };
            match choice.trim().trim_start_matches(|c: char| c.is_ascii_alphabetic()).parse::<i64>() {
                Ok(id) if id > 0 => break Some(id),
                _ => println!("[X] Invalid owner number."),
            }
        }
    } else {
        None
    };

    for attempt in 1..=MAX_LOGIN_ATTEMPTS {
        let Some(password) = prompt(lines, "Enter password: ").await? else {
            return Ok(None);
        };
        match authenticate(role, owner_id, &password, &config.auth) {
            Ok(user) => {
                println!("[OK] Authenticated as: {}", user.display_name());
                return Ok(Some(user));
            }
            Err(AuthError::InvalidContext(e)) => {
                println!("[X] {}", e);
                return Ok(None);
            }
            Err(AuthError::InvalidCredentials) if attempt < MAX_LOGIN_ATTEMPTS => {
                println!("[X] Incorrect password. Please try again.");
            }
            Err(AuthError::InvalidCredentials) => {}
        }
    }

    warn!("Too many failed login attempts for role {}", role);
    println!("[X] Too many failed login attempts.");
    Ok(None)
}

fn print_banner(welcome: &str) {
    println!("\n{}\n{}\n{}", RULE, welcome.trim_end(), RULE);
    println!("Ready to answer your questions!");
    println!("Type 'quit' or 'exit' to end the session");
    println!("Type 'help' for example questions");
    println!("Type 'change role' to switch to a different role");
    println!("{}\n", RULE);
}

pub fn format_response(response: &QueryResponse, debug: bool) -> String {
    let mut out = response.answer.clone();
    if !response.success && debug {
        if let Some(details) = &response.technical_details {
            out.push_str(&format!("\n[DEBUG] {}", details));
        }
    }
    if debug {
        if let Some(sql) = &response.sql {
            out.push_str(&format!("\n[SQL] {}", sql));
        }
    }
    out
}

pub fn format_stats(stats: &MemoryStats) -> String {
    let mut lines = vec![format!("Conversation memory: {} turns", stats.turn_count)];
    let context = &stats.context_snapshot;
    for (label, value) in [
        ("Owner", &context.owner),
        ("Location", &context.location),
        ("Topic", &context.topic),
        ("Property type", &context.property_type),
        ("Most common topic", &stats.most_common_topic),
        ("Most common location", &stats.most_common_location),
    ] {
        if let Some(value) = value {
            lines.push(format!("  {}: {}", label, value));
        }
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::memory::ConversationMemory;
    use crate::agent::memory::ConversationTurn;
    use crate::agent::state::Outcome;

    #[test]
    fn parses_commands_case_insensitively() {
        assert_eq!(ChatCommand::parse("  "), ChatCommand::Empty);
        assert_eq!(ChatCommand::parse("EXIT"), ChatCommand::Quit);
        assert_eq!(ChatCommand::parse("bye"), ChatCommand::Quit);
        assert_eq!(ChatCommand::parse("Change Role"), ChatCommand::ChangeRole);
        assert_eq!(ChatCommand::parse("stats"), ChatCommand::Stats);
        assert_eq!(
            ChatCommand::parse(" How many properties do I have? "),
            ChatCommand::Ask("How many properties do I have?".to_string())
        );
    }

    #[test]
    fn debug_output_includes_details() {
        let response = QueryResponse {
            answer: "I'm having trouble connecting to my AI service.".to_string(),
            sql: None,
            success: false,
            outcome: Outcome::OracleUnavailable,
            confidence: 0.0,
            warning: None,
            retry_count: 0,
            error_log: vec!["NETWORK".to_string()],
            technical_details: Some("LLM connection error: refused".to_string()),
        };
        assert!(!format_response(&response, false).contains("[DEBUG]"));
        assert!(format_response(&response, true).ends_with("[DEBUG] LLM connection error: refused"));
    }

    #[test]
    fn stats_list_known_context() {
        let mut memory = ConversationMemory::default();
        memory.record(ConversationTurn::new("How many properties does LLC2 have in Texas?", None, None, "3"));
        let text = format_stats(&memory.stats());
        assert!(text.starts_with("Conversation memory: 1 turns"));
        assert!(text.contains("  Owner: LLC2"));
        assert!(text.contains("  Location: Texas"));
    }
}
