use anyhow::Result;
use clap::{Parser, Subcommand};
use deskpilot::bus::BusEvent;
use deskpilot::config::config;
use deskpilot::interact::{InteractionAnswer, InteractionKind};
use deskpilot::logging;
use deskpilot::multiplexer::SessionMultiplexer;
use deskpilot::provider::HttpProvider;
use deskpilot::tool::Registry;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser, Debug)]
#[command(name = "deskpilot")]
#[command(version = env!("DESKPILOT_VERSION"))]
#[command(about = "Desktop assistant orchestration engine")]
struct Args {
    /// Model override (otherwise from config.toml)
    #[arg(short, long, global = true)]
    model: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single message and exit
    Run {
        /// The message to send
        message: String,
    },

    /// Interactive prompt loop
    Repl,
}

#[tokio::main]
async fn main() -> Result<()> {
    logging::init();
    logging::cleanup_old_logs();

    let args = Args::parse();
    let cfg = config();

    let mut provider_cfg = cfg.provider.clone();
    if let Some(model) = args.model {
        provider_cfg.model = model;
    }

    let provider = Arc::new(HttpProvider::new(&provider_cfg, &cfg.retry));
    let registry = Registry::new();
    let mux = Arc::new(SessionMultiplexer::new(provider, registry));

    match args.command {
        Some(Command::Run { message }) => run_once(mux, &message).await,
        Some(Command::Repl) | None => repl(mux).await,
    }
}

async fn run_once(mux: Arc<SessionMultiplexer>, message: &str) -> Result<()> {
    let session_id = mux.open_session(None);
    spawn_event_printer(Arc::clone(&mux));

    let result = mux.run_turn(&session_id, message).await?;
    println!("{}", result.text);
    if let Some(usage) = result.usage {
        eprintln!(
            "[tokens] prompt: {} completion: {} ({:.0}% of window)",
            usage.prompt_tokens, usage.completion_tokens, usage.usage_percent
        );
    }
    Ok(())
}

async fn repl(mux: Arc<SessionMultiplexer>) -> Result<()> {
    println!("deskpilot {}", env!("DESKPILOT_VERSION"));
    println!("Type your message, or 'quit' to exit.");
    println!();

    let session_id = mux.open_session(None);
    mux.set_displayed_session(Some(&session_id));
    spawn_event_printer(Arc::clone(&mux));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("> ");
        std::io::stdout().flush()?;

        let Some(line) = lines.next_line().await? else {
            break;
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "quit" || input == "exit" {
            break;
        }

        match mux.run_turn(&session_id, input).await {
            Ok(result) => {
                println!();
                if let Some(usage) = result.usage {
                    eprintln!(
                        "[tokens] prompt: {} completion: {}",
                        usage.prompt_tokens, usage.completion_tokens
                    );
                }
            }
            Err(e) => {
                eprintln!("\nError: {}\n", e);
            }
        }
    }

    Ok(())
}

/// Print engine events to the terminal and answer interaction modals from
/// stdin. A real host renders these; this is the minimal textual surface.
fn spawn_event_printer(mux: Arc<SessionMultiplexer>) {
    let mut events = mux.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                BusEvent::AssistantDelta { text, .. } => {
                    print!("{}", text);
                    let _ = std::io::stdout().flush();
                }
                BusEvent::ToolCallStarted { tool_name, .. } => {
                    println!("\n[{}]", tool_name);
                }
                BusEvent::ToolCallFinished {
                    tool_name,
                    error: Some(error),
                    ..
                } => {
                    println!("[{} failed: {}]", tool_name, error);
                }
                BusEvent::InteractionRequested {
                    session_id,
                    request_id,
                    kind,
                    payload,
                } => {
                    let answer = prompt_for_answer(kind, &payload).await;
                    if let Err(e) = mux.respond(&session_id, &request_id, answer) {
                        eprintln!("Failed to deliver answer: {}", e);
                    }
                }
                BusEvent::AutoCompactSuggested { session_id } => {
                    eprintln!("[context threshold crossed for {}]", session_id);
                }
                BusEvent::TurnFailed { message, .. } => {
                    eprintln!("\n{}", message);
                }
                _ => {}
            }
        }
    });
}

async fn prompt_for_answer(kind: InteractionKind, payload: &serde_json::Value) -> InteractionAnswer {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    match kind {
        InteractionKind::Ask => {
            let question = payload
                .get("question")
                .and_then(|q| q.as_str())
                .unwrap_or("(question)");
            print!("\n[ask] {}\n? ", question);
            let _ = std::io::stdout().flush();
            let text = lines
                .next_line()
                .await
                .ok()
                .flatten()
                .unwrap_or_default();
            InteractionAnswer::Text { text }
        }
        InteractionKind::Approval => {
            let tool = payload.get("tool").and_then(|t| t.as_str()).unwrap_or("?");
            print!("\n[approve] run {}? [y/N] ", tool);
            let _ = std::io::stdout().flush();
            let line = lines
                .next_line()
                .await
                .ok()
                .flatten()
                .unwrap_or_default();
            if line.trim().eq_ignore_ascii_case("y") {
                InteractionAnswer::Approved
            } else {
                InteractionAnswer::Denied { reason: None }
            }
        }
    }
}
