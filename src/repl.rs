//! Interactive terminal chat.

use std::future::Future;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::app::App;
use crate::models::{Message, Role};
use crate::services::assembler::Snapshot;
use crate::services::attachments;
use crate::services::markdown;
use crate::services::policy::{format_clock, format_countdown, ModelChange, PolicyError, QuotaStatus};
use crate::services::session::{ChatError, ChatSession, StopHandle, TurnReport};

type Input = Lines<BufReader<Stdin>>;

const HELP: &str = "\
Commands:
  /regen            regenerate the last reply
  /stop             stop the reply being generated (or Ctrl-C)
  /model <id>       switch model
  /models           list models
  /status           daily allowance, cooldown and premium time
  /image <path>     attach an image to the next message
  /voice <path>     transcribe a recording and send it
  /clear            clear this chat
  /new              start a new conversation
  /history          list saved conversations
  /open <id>        open a saved conversation
  /delete <id>      delete a saved conversation
  /delmsg <n>       delete message number n
  /quit             leave";

#[derive(Debug, Clone, PartialEq, Eq)]
enum ReplCommand {
    Say(String),
    Regenerate,
    Stop,
    Model(String),
    Models,
    Status,
    Image(PathBuf),
    Voice(PathBuf),
    Clear,
    New,
    History,
    Open(String),
    Delete(String),
    DeleteMessage(usize),
    Help,
    Quit,
    Invalid(String),
}

impl ReplCommand {
    fn parse(line: &str) -> Self {
        let line = line.trim();
        let Some(rest) = line.strip_prefix('/') else {
            return ReplCommand::Say(line.to_string());
        };
        let (name, arg) = match rest.split_once(char::is_whitespace) {
            Some((name, arg)) => (name, arg.trim()),
            None => (rest, ""),
        };

        let needs_arg = |cmd: fn(String) -> ReplCommand| {
            if arg.is_empty() {
                ReplCommand::Invalid(format!("/{name} needs an argument"))
            } else {
                cmd(arg.to_string())
            }
        };

        match name {
            "regen" => ReplCommand::Regenerate,
            "stop" => ReplCommand::Stop,
            "model" => needs_arg(ReplCommand::Model),
            "models" => ReplCommand::Models,
            "status" => ReplCommand::Status,
            "image" => needs_arg(|a| ReplCommand::Image(PathBuf::from(a))),
            "voice" => needs_arg(|a| ReplCommand::Voice(PathBuf::from(a))),
            "clear" => ReplCommand::Clear,
            "new" => ReplCommand::New,
            "history" => ReplCommand::History,
            "open" => needs_arg(ReplCommand::Open),
            "delete" => needs_arg(ReplCommand::Delete),
            "delmsg" => match arg.parse::<usize>() {
                Ok(n) if n > 0 => ReplCommand::DeleteMessage(n),
                _ => ReplCommand::Invalid("/delmsg needs a message number".to_string()),
            },
            "help" => ReplCommand::Help,
            "quit" | "exit" => ReplCommand::Quit,
            other => ReplCommand::Invalid(format!("Unknown command: /{other}")),
        }
    }
}

/// Turns successive snapshots of one streaming reply into the text that has
/// not been printed yet.
#[derive(Debug, Default)]
struct StreamPrinter {
    message_id: Option<String>,
    printed: usize,
}

impl StreamPrinter {
    fn delta(&mut self, snapshot: &[Message]) -> Option<String> {
        let last = snapshot.last()?;
        if last.role != Role::Assistant || !last.streaming {
            return None;
        }
        if self.message_id.as_deref() != Some(last.id.as_str()) {
            self.message_id = Some(last.id.clone());
            self.printed = 0;
        }
        self.take_unprinted(&last.content)
    }

    fn take_unprinted(&mut self, content: &str) -> Option<String> {
        let fresh: String = content.chars().skip(self.printed).collect();
        if fresh.is_empty() {
            return None;
        }
        self.printed += fresh.chars().count();
        Some(fresh)
    }

    /// Whatever of the final reply was not streamed, then its images and
    /// sources.
    fn finish(&mut self, reply: &Message) -> String {
        if self.message_id.as_deref() != Some(reply.id.as_str()) {
            self.printed = 0;
        }
        let mut out = self.take_unprinted(&reply.content).unwrap_or_default();
        out.push('\n');
        for url in &reply.generated_images {
            out.push_str(&format!("  [image] {}\n", describe_image(url)));
        }
        if !reply.citations.is_empty() {
            out.push_str("  Sources:\n");
            for (i, c) in reply.citations.iter().enumerate() {
                out.push_str(&format!("   {}. {} <{}>\n", i + 1, c.title, c.link));
            }
        }
        out
    }
}

fn describe_image(url: &str) -> String {
    if url.starts_with("data:") {
        let kind = url
            .trim_start_matches("data:")
            .split(';')
            .next()
            .unwrap_or("image");
        format!("{} ({} KB inline)", kind, url.len() / 1024)
    } else {
        url.to_string()
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

fn print_transcript(messages: &[Message]) {
    for (i, msg) in messages.iter().enumerate() {
        let who = match msg.role {
            Role::User => "you",
            Role::Assistant => "deta",
        };
        println!("[{}] {}:", i + 1, who);
        for line in markdown::to_plain_text(&msg.content).lines() {
            println!("    {line}");
        }
        for _ in &msg.images {
            println!("    [attached image]");
        }
        for url in &msg.generated_images {
            println!("    [image] {}", describe_image(url));
        }
    }
}

pub async fn run(app: &App, ephemeral: bool, open: Option<String>) -> Result<()> {
    let store = app.local_store(ephemeral)?;
    let mut session = app.chat_session(store);

    let who = match app.identity().auth() {
        Some(auth) => auth.email.clone().unwrap_or_else(|| auth.user_id.clone()),
        None => "guest".to_string(),
    };
    println!("Deta chat ({who}). Type /help for commands.");

    if let Some(id) = open {
        if session.load_conversation(&id).await {
            print_transcript(session.messages());
        } else {
            println!("Conversation not found: {id}");
        }
    }

    let mut input: Input = BufReader::new(tokio::io::stdin()).lines();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut pending_images: Vec<String> = Vec::new();

    prompt();
    loop {
        let line = tokio::select! {
            line = input.next_line() => match line? {
                Some(line) => line,
                None => break,
            },
            _ = ticker.tick() => {
                if let Some(notice) = session.tick().await {
                    println!("\n{notice}");
                    prompt();
                }
                continue;
            }
            _ = tokio::signal::ctrl_c() => break,
        };

        match ReplCommand::parse(&line) {
            ReplCommand::Say(text) => {
                if text.is_empty() && pending_images.is_empty() {
                    prompt();
                    continue;
                }
                let images = std::mem::take(&mut pending_images);
                send(&mut session, &mut input, &text, images).await;
            }
            ReplCommand::Regenerate => {
                let stop = session.stop_handle();
                let updates = session.subscribe();
                let (result, mut printer) =
                    drive_turn(session.regenerate(), updates, &stop, &mut input).await;
                report(result, &mut printer);
            }
            ReplCommand::Stop => println!("Nothing is being generated."),
            ReplCommand::Model(model) => change_model(&mut session, &mut input, &model).await,
            ReplCommand::Models => list_models(&session).await,
            ReplCommand::Status => show_status(&session).await,
            ReplCommand::Image(path) => match attachments::read_image(&path, None).await {
                Ok(uri) => {
                    pending_images.push(uri);
                    println!("Attached {} ({} pending)", path.display(), pending_images.len());
                }
                Err(e) => println!("! {e:#}"),
            },
            ReplCommand::Voice(path) => match app.transcribe(&path).await {
                Ok(text) => {
                    println!("you (voice): {text}");
                    let images = std::mem::take(&mut pending_images);
                    send(&mut session, &mut input, &text, images).await;
                }
                Err(e) => println!("! {e:#}"),
            },
            ReplCommand::Clear => {
                session.clear().await;
                println!("Chat cleared.");
            }
            ReplCommand::New => {
                session.new_conversation();
                println!("New conversation.");
            }
            ReplCommand::History => {
                if !session.is_authenticated() {
                    println!("Sign in to keep a history.");
                } else {
                    let conversations = session.list_conversations().await;
                    if conversations.is_empty() {
                        println!("No saved conversations.");
                    }
                    for c in conversations {
                        let marker = if session.conversation_id() == Some(c.id.as_str()) {
                            "*"
                        } else {
                            " "
                        };
                        println!(
                            "{marker} {}  {}  {}",
                            c.id,
                            c.updated_at.format("%Y-%m-%d %H:%M"),
                            c.title
                        );
                    }
                }
            }
            ReplCommand::Open(id) => {
                if session.load_conversation(&id).await {
                    print_transcript(session.messages());
                } else {
                    println!("Could not open {id}.");
                }
            }
            ReplCommand::Delete(id) => {
                if session.delete_conversation(&id).await {
                    println!("Deleted {id}.");
                } else {
                    println!("Sign in to manage conversations.");
                }
            }
            ReplCommand::DeleteMessage(n) => {
                let id = session.messages().get(n - 1).map(|m| m.id.clone());
                let deleted = match id {
                    Some(id) => session.delete_message(&id).await,
                    None => false,
                };
                if deleted {
                    println!("Deleted message {n}.");
                } else {
                    println!("No message {n}.");
                }
            }
            ReplCommand::Help => println!("{HELP}"),
            ReplCommand::Quit => break,
            ReplCommand::Invalid(msg) => println!("{msg}"),
        }
        prompt();
    }

    println!();
    Ok(())
}

async fn send(session: &mut ChatSession, input: &mut Input, text: &str, images: Vec<String>) {
    let stop = session.stop_handle();
    let updates = session.subscribe();
    let (result, mut printer) = drive_turn(session.submit(text, images), updates, &stop, input).await;
    report(result, &mut printer);
}

/// Run one turn to completion, printing fragments as they arrive. `/stop`
/// typed on its own line or Ctrl-C cancels the turn.
async fn drive_turn<F>(
    turn: F,
    mut updates: watch::Receiver<Snapshot>,
    stop: &StopHandle,
    input: &mut Input,
) -> (F::Output, StreamPrinter)
where
    F: Future,
{
    tokio::pin!(turn);
    let mut printer = StreamPrinter::default();
    let mut watching = true;
    let mut reading = true;

    loop {
        tokio::select! {
            output = &mut turn => return (output, printer),
            changed = updates.changed(), if watching => {
                if changed.is_err() {
                    watching = false;
                    continue;
                }
                let snapshot = updates.borrow_and_update().clone();
                if let Some(text) = printer.delta(&snapshot) {
                    print!("{text}");
                    let _ = std::io::stdout().flush();
                }
            }
            _ = tokio::signal::ctrl_c() => {
                stop.stop();
            }
            line = input.next_line(), if reading => match line {
                Ok(Some(line)) if ReplCommand::parse(&line) == ReplCommand::Stop => {
                    stop.stop();
                }
                Ok(Some(_)) => println!("\n(still answering; /stop to cancel)"),
                _ => reading = false,
            },
        }
    }
}

fn report(result: Result<TurnReport, ChatError>, printer: &mut StreamPrinter) {
    match result {
        Ok(report) => match report.result {
            Ok(reply) => {
                print!("{}", printer.finish(&reply));
                if report.premium_window_started {
                    println!("({} time started for today)", report.model);
                }
            }
            Err(failure) => println!("\n! {failure}"),
        },
        Err(e) => println!("! {e}"),
    }
}

async fn change_model(session: &mut ChatSession, input: &mut Input, model: &str) {
    match session.change_model(model).await {
        Ok(ModelChange::Unchanged) => println!("Already using {model}."),
        Ok(ModelChange::Changed {
            from,
            to,
            premium_window_started,
        }) => {
            println!("Switched from {from} to {to}.");
            if premium_window_started {
                println!("({to} time started for today)");
            }
        }
        Err(ChatError::Policy(PolicyError::ModelUnavailable { model })) => {
            println!("{model} is not available yet. Enter an e-mail to join the waitlist, or leave empty:");
            let Ok(Some(email)) = input.next_line().await else {
                return;
            };
            let email = email.trim();
            if email.is_empty() {
                return;
            }
            match session.policy().join_waitlist(&model, email).await {
                Ok(true) => println!("You're on the {model} waitlist."),
                Ok(false) => println!("{email} is already on the {model} waitlist."),
                Err(e) => println!("! {e}"),
            }
        }
        Err(e) => println!("! {e}"),
    }
}

async fn list_models(session: &ChatSession) {
    let policy = session.policy();
    let active = policy.active_model().await.ok();
    let catalog = policy.catalog();
    for model in &catalog.models {
        let marker = if active.as_deref() == Some(model.as_str()) { "*" } else { " " };
        let mut tags = Vec::new();
        if catalog.is_premium(model) && !policy.is_authenticated() {
            tags.push("20 min/day");
        }
        if catalog.is_unavailable(model) {
            tags.push("coming soon");
        }
        if tags.is_empty() {
            println!("{marker} {model}");
        } else {
            println!("{marker} {model} ({})", tags.join(", "));
        }
    }
}

async fn show_status(session: &ChatSession) {
    let policy = session.policy();
    if let Ok(model) = policy.active_model().await {
        println!("Model: {model}");
    }
    match policy.quota_status().await {
        Ok(status) => match &status {
            QuotaStatus::Unlimited => println!("Messages: unlimited"),
            QuotaStatus::Limited {
                used,
                limit,
                resets_at,
            } => {
                let until = (*resets_at - chrono::Local::now())
                    .to_std()
                    .unwrap_or_default();
                println!(
                    "Messages: {used}/{limit} today, {} left, resets in {}",
                    status.remaining().unwrap_or(0),
                    format_countdown(until)
                );
            }
        },
        Err(e) => println!("! {e}"),
    }
    if let Ok(Some(left)) = policy.cooldown_remaining().await {
        println!("Model change available in {}", format_countdown(left));
    }
    if let Ok(Some(left)) = policy.premium_remaining().await {
        println!("{} time left today: {}", policy.catalog().premium, format_clock(left));
    }
    if let Some(id) = session.conversation_id() {
        println!("Conversation: {id}");
    }
}
