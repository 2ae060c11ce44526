use chatflow::config::{token_from_env, Args};
use chatflow::logging::{init_tracing, setup_panic_hook};
use chatflow::*;

use clap::Parser;
use colored::*;
use futures_util::StreamExt;
use std::future::Future;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::WatchStream;

type Orchestrator = StreamOrchestrator<Arc<HttpClient>>;

/// Prints only what the view gained since the last update.
#[derive(Default)]
struct DeltaPrinter {
    content: usize,
    reasoning: usize,
    steps: usize,
    in_reasoning: bool,
}

impl DeltaPrinter {
    fn render(&mut self, view: &StreamingView) {
        if !view.is_streaming {
            return;
        }
        let mut out = std::io::stdout();

        for step in view.process_steps.iter().skip(self.steps) {
            let _ = writeln!(out, "\n{} {}", "▸".cyan(), step.title.cyan());
        }
        self.steps = self.steps.max(view.process_steps.len());

        if let Some(fresh) = view.streaming_reasoning.get(self.reasoning..) {
            if !fresh.is_empty() {
                self.in_reasoning = true;
                let _ = write!(out, "{}", fresh.dimmed());
                self.reasoning = view.streaming_reasoning.len();
            }
        }

        if let Some(fresh) = view.streaming_content.get(self.content..) {
            if !fresh.is_empty() {
                if self.in_reasoning {
                    let _ = writeln!(out);
                    self.in_reasoning = false;
                }
                let _ = write!(out, "{}", fresh);
                self.content = view.streaming_content.len();
            }
        }
        let _ = out.flush();
    }

    /// Flushes whatever the last coalesced update did not show.
    fn finish(&mut self, message: &AssistantMessage) {
        if let Some(rest) = message.content.get(self.content..) {
            print!("{}", rest);
        }
        println!();
        *self = Self::default();
    }
}

async fn drive<F>(orchestrator: &Orchestrator, turn: F)
where
    F: Future<Output = Result<SendOutcome>>,
{
    tokio::pin!(turn);
    let mut updates = WatchStream::new(orchestrator.subscribe());
    let mut printer = DeltaPrinter::default();

    let result = loop {
        tokio::select! {
            result = &mut turn => break result,
            Some(view) = updates.next() => printer.render(&view),
            _ = tokio::signal::ctrl_c() => {
                if orchestrator.stop_streaming() {
                    tracing::info!("[CLI] Stop requested");
                }
            }
        }
    };

    match result {
        Ok(SendOutcome {
            message: Some(message),
            ..
        }) => printer.finish(&message),
        Ok(SendOutcome { message: None, .. }) => {
            println!("{}", "(stopped)".yellow());
        }
        Err(e) => {
            // The failed reply, if any, is already in history.
            println!();
            eprintln!("{} {}", "error:".red().bold(), e.inner);
        }
    }
}

async fn list_conversations(orchestrator: &Orchestrator) {
    match orchestrator.transport().list().await {
        Ok(conversations) if conversations.is_empty() => println!("No conversations yet."),
        Ok(conversations) => {
            let current = orchestrator.conversation_id();
            for c in conversations {
                let marker = if current.as_ref() == Some(&c.id) { "*" } else { " " };
                println!("{} {}  {}", marker, c.id.short().bold(), c.title);
            }
        }
        Err(e) => eprintln!("{} {}", "error:".red().bold(), e.inner),
    }
}

async fn open_conversation(orchestrator: &Orchestrator, id: ConversationId) -> Result<usize> {
    let detail = orchestrator.transport().get(&id).await?;
    let history = detail.into_history();
    let count = history.len();
    orchestrator.load_conversation(id, history)?;
    Ok(count)
}

fn last_reply_id(orchestrator: &Orchestrator) -> Option<MessageId> {
    orchestrator.history().last().map(|m| m.id().clone())
}

fn print_prompt() {
    print!("{} ", ">".green().bold());
    let _ = std::io::stdout().flush();
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let _guard = init_tracing(&args.log_dir, args.log_json);
    setup_panic_hook();

    let client = match args.build_http_client() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to build HTTP client: {}", e.inner);
            std::process::exit(1);
        }
    };
    let http = Arc::new(HttpClient::new(client, args.base_url.clone(), token_from_env()));
    let orchestrator: Orchestrator = StreamOrchestrator::new(http, args.settings());

    tracing::info!(
        "[CLI] Starting chatflow against {} (model: {})",
        args.base_url,
        args.model
    );

    if let Some(id) = args.conversation_id() {
        match open_conversation(&orchestrator, id.clone()).await {
            Ok(count) => println!("Resumed conversation {} ({} messages).", id.short(), count),
            Err(e) => {
                eprintln!("Failed to load conversation {}: {}", id, e.inner);
                std::process::exit(1);
            }
        }
    }

    println!(
        "{}",
        "Type a message. /new, /regen, /list, /open <id>, /quit. Ctrl-C stops a reply.".dimmed()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print_prompt();
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::error!("[CLI] Failed to read stdin: {}", e);
                break;
            }
        };

        let input = line.trim();
        match input {
            "" => continue,
            "/quit" | "/exit" => break,
            "/new" => match orchestrator.start_new_conversation() {
                Ok(()) => println!("{}", "Started a new conversation.".dimmed()),
                Err(e) => eprintln!("{} {}", "error:".red().bold(), e.inner),
            },
            "/list" => list_conversations(&orchestrator).await,
            "/regen" => match last_reply_id(&orchestrator) {
                Some(id) => drive(&orchestrator, orchestrator.regenerate(&id)).await,
                None => println!("Nothing to regenerate."),
            },
            _ if input.starts_with("/open ") => {
                let id = ConversationId::from(input["/open ".len()..].trim());
                match open_conversation(&orchestrator, id.clone()).await {
                    Ok(count) => println!("Opened {} ({} messages).", id.short(), count),
                    Err(e) => eprintln!("{} {}", "error:".red().bold(), e.inner),
                }
            }
            text => drive(&orchestrator, orchestrator.send_message(text)).await,
        }
    }
}
