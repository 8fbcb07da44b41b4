use async_trait::async_trait;
use bitseek_core::{ActionCall, ContractInvocation};
use bitseek_session::Aborted;
use serde_json::{json, Value};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

pub const DEFAULT_EXECUTOR_URL: &str = "http://localhost:3000";
pub const DEFAULT_EXECUTOR_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorFailureKind {
    Connectivity,
    Timeout,
    Operation,
    InvalidResponse,
    InvalidConfig,
    Aborted,
}

impl ExecutorFailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorFailureKind::Connectivity => "connectivity",
            ExecutorFailureKind::Timeout => "timeout",
            ExecutorFailureKind::Operation => "operation",
            ExecutorFailureKind::InvalidResponse => "invalid_response",
            ExecutorFailureKind::InvalidConfig => "invalid_config",
            ExecutorFailureKind::Aborted => "aborted",
        }
    }
}

impl fmt::Display for ExecutorFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct ExecutorError {
    pub kind: ExecutorFailureKind,
    pub message: String,
}

impl ExecutorError {
    pub fn new(kind: ExecutorFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<Aborted> for ExecutorError {
    fn from(_: Aborted) -> Self {
        ExecutorError::new(ExecutorFailureKind::Aborted, "operation aborted")
    }
}

/// Remote procedure surface performing the ledger operations.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn create_account(&self) -> Result<Value, ExecutorError>;

    async fn get_balance(&self, address: &str) -> Result<Value, ExecutorError>;

    async fn transfer(
        &self,
        sender_private_key: &str,
        recipient: &str,
        amount: &str,
    ) -> Result<Value, ExecutorError>;

    async fn call_contract(&self, call: &ContractInvocation) -> Result<Value, ExecutorError>;

    async fn execute(&self, call: &ActionCall) -> Result<Value, ExecutorError> {
        match call {
            ActionCall::CreateAccount => self.create_account().await,
            ActionCall::GetBalance { address } => self.get_balance(address).await,
            ActionCall::Transfer {
                sender_private_key,
                recipient,
                amount,
            } => self.transfer(sender_private_key, recipient, amount).await,
            ActionCall::CallContract(call) => self.call_contract(call).await,
        }
    }
}

/// JSON-over-HTTP executor client.
#[derive(Debug, Clone)]
pub struct HttpActionExecutor {
    client: reqwest::Client,
    base: Url,
}

impl HttpActionExecutor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ExecutorError> {
        let base = Url::parse(base_url).map_err(|err| {
            ExecutorError::new(
                ExecutorFailureKind::InvalidConfig,
                format!("invalid executor url {base_url}: {err}"),
            )
        })?;
        if base.cannot_be_a_base() {
            return Err(ExecutorError::new(
                ExecutorFailureKind::InvalidConfig,
                format!("executor url cannot be a base: {base_url}"),
            ));
        }
        let client = reqwest::Client::builder()
            .connect_timeout(timeout.min(MAX_CONNECT_TIMEOUT))
            .timeout(timeout)
            .build()
            .map_err(|err| ExecutorError::new(ExecutorFailureKind::InvalidConfig, err.to_string()))?;
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ExecutorError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| {
                ExecutorError::new(ExecutorFailureKind::InvalidConfig, "executor url has no path")
            })?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn get(&self, segments: &[&str]) -> Result<Value, ExecutorError> {
        let url = self.endpoint(segments)?;
        debug!(event = "executor_request", method = "GET", path = url.path());
        let response = self.client.get(url).send().await.map_err(request_error)?;
        read_response(response).await
    }

    async fn post(&self, segments: &[&str], body: &Value) -> Result<Value, ExecutorError> {
        let url = self.endpoint(segments)?;
        debug!(event = "executor_request", method = "POST", path = url.path());
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(request_error)?;
        read_response(response).await
    }
}

#[async_trait]
impl ActionExecutor for HttpActionExecutor {
    async fn create_account(&self) -> Result<Value, ExecutorError> {
        self.get(&["account", "create"]).await
    }

    async fn get_balance(&self, address: &str) -> Result<Value, ExecutorError> {
        self.get(&["balance", address]).await
    }

    async fn transfer(
        &self,
        sender_private_key: &str,
        recipient: &str,
        amount: &str,
    ) -> Result<Value, ExecutorError> {
        let body = json!({
            "senderPrivateKey": sender_private_key,
            "recipient": recipient,
            "amount": amount,
        });
        self.post(&["transfer"], &body).await
    }

    async fn call_contract(&self, call: &ContractInvocation) -> Result<Value, ExecutorError> {
        let body = json!({
            "privateKey": call.private_key,
            "packageObjectId": call.package_object_id,
            "module": call.module,
            "functionName": call.function_name,
            "args": call.args,
            "typeArguments": call.type_arguments,
        });
        self.post(&["contract", "call"], &body).await
    }
}

fn request_error(err: reqwest::Error) -> ExecutorError {
    let kind = if err.is_timeout() {
        ExecutorFailureKind::Timeout
    } else if err.is_connect() {
        ExecutorFailureKind::Connectivity
    } else {
        ExecutorFailureKind::Operation
    };
    ExecutorError::new(kind, err.to_string())
}

async fn read_response(response: reqwest::Response) -> Result<Value, ExecutorError> {
    let status = response.status();
    let text = response.text().await.map_err(request_error)?;
    if !status.is_success() {
        let message = serde_json::from_str::<Value>(&text)
            .ok()
            .and_then(|body| body.get("error").map(render_error))
            .unwrap_or_else(|| format!("executor returned HTTP {status}"));
        return Err(ExecutorError::new(ExecutorFailureKind::Operation, message));
    }
    serde_json::from_str(&text).map_err(|err| {
        ExecutorError::new(
            ExecutorFailureKind::InvalidResponse,
            format!("executor body is not JSON: {err}"),
        )
    })
}

fn render_error(value: &Value) -> String {
    match value {
        Value::String(message) => message.clone(),
        other => other.to_string(),
    }
}
