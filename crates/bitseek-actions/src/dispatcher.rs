use crate::error::{executor_message, ActionError};
use crate::executor::{ActionExecutor, ExecutorError, ExecutorFailureKind};
use crate::generator::Generator;
use bitseek_core::{ActionCall, ActionKind, ActionParams, ActionValidationError};
use bitseek_session::{retry, RetryPolicy, SessionError, StreamSink};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchConfig {
    pub retry: RetryPolicy,
    pub action_timeout: Duration,
    /// Append raw error detail to user-facing failure text.
    pub debug: bool,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            action_timeout: DEFAULT_ACTION_TIMEOUT,
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyKind {
    Chat,
    Action,
    NeedsInfo,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    pub kind: ReplyKind,
    pub action: Option<ActionKind>,
    pub response: String,
    pub raw_result: Option<Value>,
}

impl Reply {
    pub fn chat(response: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Chat,
            action: None,
            response: response.into(),
            raw_result: None,
        }
    }

    pub fn error(action: Option<ActionKind>, response: impl Into<String>) -> Self {
        Self {
            kind: ReplyKind::Error,
            action,
            response: response.into(),
            raw_result: None,
        }
    }
}

pub struct Dispatcher {
    generator: Arc<dyn Generator>,
    executor: Arc<dyn ActionExecutor>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(
        generator: Arc<dyn Generator>,
        executor: Arc<dyn ActionExecutor>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            generator,
            executor,
            config,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Validates, executes and summarizes one action.
    ///
    /// Executor and summarization failures become replies; only an abort is
    /// returned as an error.
    pub async fn dispatch(
        &self,
        kind: ActionKind,
        params: &ActionParams,
        original_input: &str,
        sink: Option<Box<dyn StreamSink>>,
        cancel: &CancellationToken,
    ) -> Result<Reply, ActionError> {
        let call = match ActionCall::from_params(kind, params) {
            Ok(call) => call,
            Err(err) => {
                info!(
                    event = "action_needs_info",
                    action = %kind,
                    missing = ?err.missing,
                    invalid = ?err.invalid
                );
                return Ok(needs_info_reply(&err));
            }
        };
        info!(event = "action_dispatch", action = %call);

        let value = match self.execute(&call, cancel).await {
            Ok(value) => value,
            Err(err) if err.kind == ExecutorFailureKind::Aborted => {
                return Err(ActionError::Aborted);
            }
            Err(err) => {
                warn!(
                    event = "action_failed",
                    action = %kind,
                    failure = %err.kind,
                    error = %err.message
                );
                return Ok(Reply::error(Some(kind), failure_text(&err, self.config.debug)));
            }
        };

        let pretty = serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string());
        let prompt = summary_prompt(kind, original_input, &pretty);
        let response = match self.generator.generate(&prompt, sink, cancel).await {
            Ok(summary) if !summary.trim().is_empty() => collapse_blank_lines(summary.trim()),
            Ok(_) => fallback_summary(&pretty),
            Err(SessionError::Aborted) => return Err(ActionError::Aborted),
            Err(err) => {
                warn!(event = "action_summary_failed", action = %kind, error = %err);
                fallback_summary(&pretty)
            }
        };
        Ok(Reply {
            kind: ReplyKind::Action,
            action: Some(kind),
            response,
            raw_result: Some(value),
        })
    }

    async fn execute(
        &self,
        call: &ActionCall,
        cancel: &CancellationToken,
    ) -> Result<Value, ExecutorError> {
        let executor = &self.executor;
        let action_timeout = self.config.action_timeout;
        retry(self.config.retry, cancel, |attempt| async move {
            let value = tokio::time::timeout(action_timeout, executor.execute(call))
                .await
                .map_err(|_| {
                    ExecutorError::new(
                        ExecutorFailureKind::Timeout,
                        format!(
                            "attempt {attempt} got no result within {}s",
                            action_timeout.as_secs_f64()
                        ),
                    )
                })??;
            validate_result(&value)?;
            Ok::<Value, ExecutorError>(value)
        })
        .await
    }
}

/// Null results, an `error` field, or a non-success `status` count as failures.
pub fn validate_result(value: &Value) -> Result<(), ExecutorError> {
    match value {
        Value::Null => Err(ExecutorError::new(
            ExecutorFailureKind::InvalidResponse,
            "executor returned no result",
        )),
        Value::Object(map) => {
            if let Some(error) = map.get("error").filter(|error| !error.is_null()) {
                let message = match error {
                    Value::String(message) => message.clone(),
                    other => other.to_string(),
                };
                return Err(ExecutorError::new(ExecutorFailureKind::Operation, message));
            }
            match map.get("status") {
                None | Some(Value::Null) => Ok(()),
                Some(Value::String(status)) if status == "success" => Ok(()),
                Some(other) => Err(ExecutorError::new(
                    ExecutorFailureKind::Operation,
                    format!("executor reported status {other}"),
                )),
            }
        }
        _ => Ok(()),
    }
}

fn needs_info_reply(err: &ActionValidationError) -> Reply {
    let describe = |keys: &[&str]| {
        keys.iter()
            .map(|key| describe_param(key))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let mut requests = Vec::new();
    if !err.missing.is_empty() {
        requests.push(format!("I still need: {}", describe(&err.missing)));
    }
    if !err.invalid.is_empty() {
        requests.push(format!(
            "these must be plain values: {}",
            describe(&err.invalid)
        ));
    }
    Reply {
        kind: ReplyKind::NeedsInfo,
        action: Some(err.kind),
        response: format!("To {} {}.", action_phrase(err.kind), requests.join("; ")),
        raw_result: None,
    }
}

fn describe_param(key: &str) -> &str {
    match key {
        "address" => "the address to look up",
        "senderPrivateKey" => "the sender's private key",
        "recipient" => "the recipient address",
        "amount" => "the amount to send",
        "privateKey" => "the signer's private key",
        "packageObjectId" => "the package object id",
        "module" => "the module name",
        "functionName" => "the function name",
        "args" => "the contract arguments",
        "typeArguments" => "the type arguments",
        other => other,
    }
}

fn action_phrase(kind: ActionKind) -> &'static str {
    match kind {
        ActionKind::CreateAccount => "create an account",
        ActionKind::GetBalance => "check a balance",
        ActionKind::Transfer => "make a transfer",
        ActionKind::CallContract => "call a contract",
    }
}

fn summary_prompt(kind: ActionKind, original_input: &str, pretty_result: &str) -> String {
    let focus = match kind {
        ActionKind::CreateAccount => {
            "Confirm the account was created and give its address. Remind the user to keep the \
             private key and mnemonic safe, and suggest next steps such as checking the balance."
        }
        ActionKind::GetBalance => {
            "State the queried address and its balance, including the unit if it is known."
        }
        ActionKind::Transfer => {
            "Say whether the transfer succeeded, the amount, the recipient and the transaction \
             id if there is one."
        }
        ActionKind::CallContract => {
            "Say whether the contract call succeeded, the transaction id and any returned value."
        }
    };
    format!(
        "The user asked: \"{original_input}\"\n\n\
         The {} operation returned:\n{pretty_result}\n\n\
         {focus}\n\
         Answer in the user's language, in plain friendly sentences, without showing raw JSON.",
        kind.as_str()
    )
}

fn fallback_summary(pretty_result: &str) -> String {
    format!("Operation completed.\n{pretty_result}")
}

fn failure_text(err: &ExecutorError, debug: bool) -> String {
    let base = executor_message(err);
    if debug {
        format!("{base}\nDetails: {err}")
    } else {
        base
    }
}

fn collapse_blank_lines(text: &str) -> String {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"\n{3,}").expect("valid regex"))
        .replace_all(text, "\n\n")
        .into_owned()
}
