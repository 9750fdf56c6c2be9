//! Line-based terminal chat on top of [`ChatSession`].
//!
//! Replies are printed as they stream in by watching reducer snapshots.
//! Ctrl-C cancels the running turn; with no turn running it exits.

use crate::config::Config;
use crate::models::Role;
use crate::reducer::Snapshot;
use crate::session::{ChatSession, TurnStatus};
use crate::state::build_transport;
use crate::storage::ChatStore;
use anyhow::Context;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

pub async fn chat_repl(
    config: Config,
    store: Arc<dyn ChatStore>,
    user_id: String,
    resume: Option<String>,
) -> anyhow::Result<()> {
    let settings = config
        .provider_settings()
        .context("Cannot start chat")?;
    let transport = build_transport(&config, settings);

    let session = match resume {
        Some(id) => ChatSession::open(&id, transport, store, config.cancel_policy).await?,
        None => ChatSession::new(user_id, transport, store, config.cancel_policy),
    };
    let mut session = session.with_system_prompt(config.system_prompt.clone());

    for message in session.messages() {
        println!("{}: {}", label(message.role), message.content);
    }

    let canceller = session.canceller();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if !canceller.cancel() {
                std::process::exit(130);
            }
        }
    });

    println!("Type a message. Commands: /rename <title>, /delete, /quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match line.split_once(' ').map_or((line, ""), |(c, rest)| (c, rest)) {
            ("/quit", _) => break,
            ("/delete", _) => match session.delete().await {
                Ok(()) => println!("[conversation deleted]"),
                Err(e) => println!("[delete failed: {}]", e),
            },
            ("/rename", title) => match session.rename(title).await {
                Ok(()) => println!("[renamed]"),
                Err(e) => println!("[rename failed: {}]", e),
            },
            _ => run_turn(&mut session, line).await?,
        }
    }
    Ok(())
}

async fn run_turn(session: &mut ChatSession, line: &str) -> anyhow::Result<()> {
    let mut rx = session.subscribe();
    rx.borrow_and_update();
    let mut printer = ReplyPrinter::default();

    let outcome = {
        let send = session.send(line);
        tokio::pin!(send);
        loop {
            tokio::select! {
                outcome = &mut send => break outcome,
                Ok(()) = rx.changed() => {
                    let snapshot = rx.borrow_and_update().clone();
                    printer.show(&snapshot);
                }
            }
        }
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            println!("[{}]", e);
            return Ok(());
        }
    };
    match &outcome.status {
        TurnStatus::Completed { .. } => {
            printer.show(&session.subscribe().borrow());
            println!();
        }
        TurnStatus::Cancelled => println!("\n[cancelled]"),
        TurnStatus::Failed(_) => {
            if let Some(last) = session.messages().last() {
                println!("\n{}", last.content);
            }
        }
    }
    if let Some(e) = outcome.persist_error {
        println!("[not saved: {}]", e);
    }
    Ok(())
}

// Prints only what was appended to the assistant placeholder since the last snapshot.
#[derive(Default)]
struct ReplyPrinter {
    current_id: Option<String>,
    shown: String,
}

impl ReplyPrinter {
    fn show(&mut self, snapshot: &Snapshot) {
        let Some(last) = snapshot.last() else {
            return;
        };
        if last.role != Role::Assistant {
            return;
        }
        if self.current_id.as_deref() != Some(last.id.as_str()) {
            self.current_id = Some(last.id.clone());
            self.shown.clear();
            print!("{}: ", label(Role::Assistant));
        }
        if let Some(rest) = last.content.strip_prefix(self.shown.as_str()) {
            print!("{}", rest);
            let _ = std::io::stdout().flush();
            self.shown = last.content.clone();
        }
    }
}

fn label(role: Role) -> &'static str {
    match role {
        Role::User => "you",
        Role::Assistant => "assistant",
        Role::System => "system",
    }
}
