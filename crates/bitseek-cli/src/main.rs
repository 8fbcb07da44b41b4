mod config;
mod logging;
mod repl;

use anyhow::{Context, Result};
use bitseek_actions::{
    dispatcher::validate_result, ActionExecutor, Assistant, Generator, HttpActionExecutor,
};
use bitseek_core::{ActionCall, ContractInvocation};
use bitseek_session::{IdleSupervisor, Session};
use clap::{Parser, Subcommand};
use config::{GlobalArgs, RuntimeConfig};
use logging::init_logging;
use repl::Repl;
use std::env;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "bitseek")]
#[command(about = "Streaming chat assistant with blockchain actions", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Interactive assistant (default)
    Chat,
    /// Send one input through the assistant and exit
    Ask {
        #[arg(required = true, num_args = 1..)]
        text: Vec<String>,
    },
    /// Create a new account on the executor
    CreateAccount,
    /// Look up the balance of an address
    Balance { address: String },
    /// Send funds to another address
    Transfer {
        sender_private_key: String,
        recipient: String,
        amount: String,
    },
    /// Invoke a contract function
    CallContract {
        private_key: String,
        package_object_id: String,
        module: String,
        function_name: String,
        args: Vec<String>,
        #[arg(long = "type-arg")]
        type_arguments: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RuntimeConfig::resolve(&cli.global, |key| env::var(key).ok());
    let _log_guard = init_logging(&config);

    match cli.command.unwrap_or(Command::Chat) {
        Command::Chat => {
            let repl = build_repl(&config)?;
            repl.run().await
        }
        Command::Ask { text } => {
            let repl = build_repl(&config)?;
            let result = repl.ask(&text.join(" ")).await;
            repl.shutdown().await;
            result
        }
        Command::CreateAccount => run_direct(&config, ActionCall::CreateAccount).await,
        Command::Balance { address } => {
            run_direct(&config, ActionCall::GetBalance { address }).await
        }
        Command::Transfer {
            sender_private_key,
            recipient,
            amount,
        } => {
            let call = ActionCall::Transfer {
                sender_private_key,
                recipient,
                amount,
            };
            run_direct(&config, call).await
        }
        Command::CallContract {
            private_key,
            package_object_id,
            module,
            function_name,
            args,
            type_arguments,
        } => {
            let call = ActionCall::CallContract(ContractInvocation {
                private_key,
                package_object_id,
                module,
                function_name,
                args,
                type_arguments,
            });
            run_direct(&config, call).await
        }
    }
}

fn build_executor(config: &RuntimeConfig) -> Result<HttpActionExecutor> {
    HttpActionExecutor::new(&config.executor_url, config.dispatch.action_timeout)
        .context("failed to configure the action executor")
}

fn build_repl(config: &RuntimeConfig) -> Result<Repl> {
    let executor = Arc::new(build_executor(config)?);
    let session = Session::new(config.session.clone());
    let supervisor = IdleSupervisor::new(session, config.idle_timeout);
    let generator: Arc<dyn Generator> = Arc::new(supervisor.clone());
    let assistant = Assistant::new(generator, executor, config.dispatch);
    info!(
        event = "assistant_ready",
        url = %config.session.url,
        executor = %config.executor_url
    );
    Ok(Repl::new(supervisor, assistant, config.debug))
}

async fn run_direct(config: &RuntimeConfig, call: ActionCall) -> Result<()> {
    let executor = build_executor(config)?;
    info!(event = "direct_action", action = %call);
    let value = executor
        .execute(&call)
        .await
        .with_context(|| format!("{} failed", call.kind()))?;
    validate_result(&value).with_context(|| format!("{} failed", call.kind()))?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
