use anyhow::Result;
use bitseek_actions::{ActionError, Assistant, Reply, ReplyKind};
use bitseek_session::{CancellationToken, IdleSupervisor, StreamSink};
use std::io::{self, Write};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const HELP: &str = "\
Commands:
  help          show this message
  status        connection and session state
  verbose on|off  log every streamed chunk
  clear         clear the screen
  exit, quit    leave
Anything else is sent to the assistant. Ctrl-C cancels a running request.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplCommand<'a> {
    Empty,
    Help,
    Status,
    Clear,
    Exit,
    Verbose(bool),
    Input(&'a str),
}

impl<'a> ReplCommand<'a> {
    pub fn parse(line: &'a str) -> Self {
        let trimmed = line.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "" => ReplCommand::Empty,
            "help" => ReplCommand::Help,
            "status" => ReplCommand::Status,
            "clear" => ReplCommand::Clear,
            "exit" | "quit" => ReplCommand::Exit,
            "verbose on" => ReplCommand::Verbose(true),
            "verbose off" => ReplCommand::Verbose(false),
            _ => ReplCommand::Input(trimmed),
        }
    }
}

pub struct Repl {
    supervisor: IdleSupervisor,
    assistant: Assistant,
    debug: bool,
}

impl Repl {
    pub fn new(supervisor: IdleSupervisor, assistant: Assistant, debug: bool) -> Self {
        Self {
            supervisor,
            assistant,
            debug,
        }
    }

    pub async fn run(&self) -> Result<()> {
        println!("bitseek assistant. Type `help` for commands.");
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("> ");
            io::stdout().flush()?;
            let line = tokio::select! {
                line = lines.next_line() => line?,
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    break;
                }
            };
            let Some(line) = line else {
                break;
            };
            match ReplCommand::parse(&line) {
                ReplCommand::Empty => {}
                ReplCommand::Help => println!("{HELP}"),
                ReplCommand::Status => self.print_status(),
                ReplCommand::Clear => {
                    print!("\x1b[2J\x1b[H");
                    io::stdout().flush()?;
                }
                ReplCommand::Exit => break,
                ReplCommand::Verbose(verbose) => {
                    self.supervisor.session().set_verbose(verbose);
                    println!("verbose {}", if verbose { "on" } else { "off" });
                }
                ReplCommand::Input(input) => self.ask(input).await?,
            }
        }
        self.shutdown().await;
        info!(event = "repl_exit");
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.supervisor.shutdown().await;
    }

    /// Runs one input, streaming model output as it arrives.
    pub async fn ask(&self, input: &str) -> Result<()> {
        let streamed = Arc::new(StdMutex::new(String::new()));
        let cancel = CancellationToken::new();
        let request = self.assistant.process_input(
            input,
            || {
                if let Ok(mut text) = streamed.lock() {
                    text.clear();
                }
                Some(stdout_sink(streamed.clone()))
            },
            &cancel,
        );
        tokio::pin!(request);

        let result = tokio::select! {
            result = &mut request => result,
            _ = tokio::signal::ctrl_c() => {
                cancel.cancel();
                let result = request.await;
                self.supervisor.session().close().await;
                warn!(event = "request_interrupted");
                result
            }
        };

        let streamed = streamed
            .lock()
            .map(|text| text.clone())
            .unwrap_or_default();
        if !streamed.is_empty() {
            println!();
        }
        match result {
            Ok(reply) => self.print_reply(&reply, &streamed)?,
            Err(ActionError::Aborted) => println!("Request cancelled."),
            Err(err) => println!("{}", err.user_message(self.debug)),
        }
        Ok(())
    }

    fn print_reply(&self, reply: &Reply, streamed: &str) -> Result<()> {
        if !same_text(streamed, &reply.response) {
            println!("{}", reply.response);
        }
        if self.debug {
            if let Some(raw) = &reply.raw_result {
                println!("--- raw result ---\n{}", serde_json::to_string_pretty(raw)?);
            }
        }
        if reply.kind == ReplyKind::Error {
            warn!(event = "reply_error", action = ?reply.action);
        }
        Ok(())
    }

    fn print_status(&self) {
        let status = self.supervisor.session().status();
        println!("connection:         {}", status.state);
        println!("reconnect attempts: {}", status.reconnect_attempts);
        println!("request in flight:  {}", status.pending_exchange);
        println!("heartbeat interval: {} ms", status.heartbeat_interval_ms);
        println!("message timeout:    {} ms", status.message_timeout_ms);
        println!(
            "idle timeout:       {} s",
            self.supervisor.idle_timeout().as_secs()
        );
        println!(
            "last activity:      {}",
            self.supervisor.last_activity().to_rfc3339()
        );
    }
}

fn stdout_sink(streamed: Arc<StdMutex<String>>) -> Box<dyn StreamSink> {
    Box::new(move |chunk: &str| {
        print!("{chunk}");
        let _ = io::stdout().flush();
        if let Ok(mut text) = streamed.lock() {
            text.push_str(chunk);
        }
    })
}

/// Streamed text and the final reply differ only in whitespace when the reply
/// was built from the stream.
fn same_text(streamed: &str, response: &str) -> bool {
    let squash = |text: &str| text.split_whitespace().collect::<String>();
    !streamed.trim().is_empty() && squash(streamed) == squash(response)
}
