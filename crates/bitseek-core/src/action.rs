use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_CONFIDENCE: f64 = 0.8;

pub type ActionParams = Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum ActionKind {
    CreateAccount,
    GetBalance,
    Transfer,
    CallContract,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::CreateAccount,
        ActionKind::GetBalance,
        ActionKind::Transfer,
        ActionKind::CallContract,
    ];

    /// Wire name used in classification judgments.
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::CreateAccount => "createAccount",
            ActionKind::GetBalance => "getBalance",
            ActionKind::Transfer => "transfer",
            ActionKind::CallContract => "callContract",
        }
    }

    pub fn required_params(self) -> &'static [&'static str] {
        match self {
            ActionKind::CreateAccount => &[],
            ActionKind::GetBalance => &["address"],
            ActionKind::Transfer => &["senderPrivateKey", "recipient", "amount"],
            ActionKind::CallContract => &["privateKey", "packageObjectId", "module", "functionName"],
        }
    }

    /// Optional parameters holding lists of plain values.
    pub fn list_params(self) -> &'static [&'static str] {
        match self {
            ActionKind::CallContract => &["args", "typeArguments"],
            _ => &[],
        }
    }

    /// Required parameters that are absent, blank or zero in `params`.
    pub fn missing_params(self, params: &ActionParams) -> Vec<&'static str> {
        self.required_params()
            .iter()
            .copied()
            .filter(|key| param_string(params, key).is_none())
            .collect()
    }

    /// List parameters present in `params` that hold anything but plain values.
    pub fn invalid_params(self, params: &ActionParams) -> Vec<&'static str> {
        self.list_params()
            .iter()
            .copied()
            .filter(|key| param_list(params, key).is_none())
            .collect()
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized: String = input
            .trim()
            .chars()
            .filter(|ch| *ch != '-' && *ch != '_')
            .collect::<String>()
            .to_lowercase();
        match normalized.as_str() {
            "createaccount" => Ok(ActionKind::CreateAccount),
            "getbalance" | "balance" => Ok(ActionKind::GetBalance),
            "transfer" => Ok(ActionKind::Transfer),
            "callcontract" => Ok(ActionKind::CallContract),
            _ => Err(format!("Unknown action: {}", input.trim())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    NotAction {
        confidence: f64,
    },
    Action {
        kind: ActionKind,
        params: ActionParams,
        confidence: f64,
    },
}

impl Classification {
    pub fn confidence(&self) -> f64 {
        match self {
            Classification::NotAction { confidence } => *confidence,
            Classification::Action { confidence, .. } => *confidence,
        }
    }

    pub fn kind(&self) -> Option<ActionKind> {
        match self {
            Classification::NotAction { .. } => None,
            Classification::Action { kind, .. } => Some(*kind),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} has unusable parameters: {}", missing.iter().chain(invalid).copied().collect::<Vec<_>>().join(", "))]
pub struct ActionValidationError {
    pub kind: ActionKind,
    pub missing: Vec<&'static str>,
    pub invalid: Vec<&'static str>,
}

/// A validated action, ready to hand to an executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionCall {
    CreateAccount,
    GetBalance {
        address: String,
    },
    Transfer {
        sender_private_key: String,
        recipient: String,
        amount: String,
    },
    CallContract(ContractInvocation),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContractInvocation {
    pub private_key: String,
    pub package_object_id: String,
    pub module: String,
    pub function_name: String,
    pub args: Vec<String>,
    pub type_arguments: Vec<String>,
}

impl ActionCall {
    pub fn from_params(
        kind: ActionKind,
        params: &ActionParams,
    ) -> Result<Self, ActionValidationError> {
        let missing = kind.missing_params(params);
        let invalid = kind.invalid_params(params);
        if !missing.is_empty() || !invalid.is_empty() {
            return Err(ActionValidationError {
                kind,
                missing,
                invalid,
            });
        }
        let field = |key: &str| param_string(params, key).unwrap_or_default();
        let call = match kind {
            ActionKind::CreateAccount => ActionCall::CreateAccount,
            ActionKind::GetBalance => ActionCall::GetBalance {
                address: field("address"),
            },
            ActionKind::Transfer => ActionCall::Transfer {
                sender_private_key: field("senderPrivateKey"),
                recipient: field("recipient"),
                amount: field("amount"),
            },
            ActionKind::CallContract => ActionCall::CallContract(ContractInvocation {
                private_key: field("privateKey"),
                package_object_id: field("packageObjectId"),
                module: field("module"),
                function_name: field("functionName"),
                args: param_list(params, "args").unwrap_or_default(),
                type_arguments: param_list(params, "typeArguments").unwrap_or_default(),
            }),
        };
        Ok(call)
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            ActionCall::CreateAccount => ActionKind::CreateAccount,
            ActionCall::GetBalance { .. } => ActionKind::GetBalance,
            ActionCall::Transfer { .. } => ActionKind::Transfer,
            ActionCall::CallContract(_) => ActionKind::CallContract,
        }
    }
}

// Keys never appear in the rendered form; it goes to logs.
impl fmt::Display for ActionCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionCall::CreateAccount => f.write_str("createAccount"),
            ActionCall::GetBalance { address } => write!(f, "getBalance address={address}"),
            ActionCall::Transfer {
                recipient, amount, ..
            } => write!(f, "transfer recipient={recipient} amount={amount}"),
            ActionCall::CallContract(call) => write!(
                f,
                "callContract {}::{}::{}",
                call.package_object_id, call.module, call.function_name
            ),
        }
    }
}

fn param_string(params: &ActionParams, key: &str) -> Option<String> {
    match params.get(key)? {
        Value::String(value) if !value.trim().is_empty() => Some(value.trim().to_string()),
        Value::Number(value) if value.as_f64() != Some(0.0) => Some(value.to_string()),
        _ => None,
    }
}

/// `None` when the value cannot be passed as a list of plain strings.
fn param_list(params: &ActionParams, key: &str) -> Option<Vec<String>> {
    match params.get(key) {
        None | Some(Value::Null) => Some(Vec::new()),
        Some(Value::Array(items)) => items.iter().map(plain_value).collect(),
        Some(Value::String(value)) if value.trim().is_empty() => Some(Vec::new()),
        Some(value) => plain_value(value).map(|value| vec![value]),
    }
}

fn plain_value(value: &Value) -> Option<String> {
    match value {
        Value::String(value) => Some(value.clone()),
        Value::Number(value) => Some(value.to_string()),
        Value::Bool(value) => Some(value.to_string()),
        _ => None,
    }
}
