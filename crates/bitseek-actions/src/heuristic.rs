use bitseek_core::{ActionKind, ActionParams, Classification};
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

pub const HEURISTIC_CONFIDENCE: f64 = 0.5;

fn address_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"0x[0-9a-fA-F]{40,}").expect("valid regex"))
}

fn number_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d+(?:\.\d+)?").expect("valid regex"))
}

/// Keyword classifier used when the model judgment cannot be decoded.
pub fn classify(input: &str) -> Classification {
    let lower = input.to_lowercase();
    let has = |needle: &str| lower.contains(needle);

    let kind = if (has("create") && has("account")) || (has("创建") && (has("账户") || has("账号")))
    {
        Some(ActionKind::CreateAccount)
    } else if has("balance") || has("余额") {
        Some(ActionKind::GetBalance)
    } else if has("transfer") || has("转账") {
        Some(ActionKind::Transfer)
    } else if has("contract") || has("合约") {
        Some(ActionKind::CallContract)
    } else {
        None
    };

    let Some(kind) = kind else {
        return Classification::NotAction {
            confidence: HEURISTIC_CONFIDENCE,
        };
    };
    Classification::Action {
        kind,
        params: extract_params(kind, input),
        confidence: HEURISTIC_CONFIDENCE,
    }
}

fn extract_params(kind: ActionKind, input: &str) -> ActionParams {
    let mut params = ActionParams::new();
    let addresses: Vec<&str> = address_pattern()
        .find_iter(input)
        .map(|found| found.as_str())
        .collect();
    match kind {
        ActionKind::GetBalance => {
            if let Some(address) = addresses.first() {
                params.insert("address".to_string(), Value::from(*address));
            }
        }
        ActionKind::Transfer => {
            let without_addresses = address_pattern().replace_all(input, " ");
            if let Some(amount) = number_pattern().find(&without_addresses) {
                params.insert("amount".to_string(), Value::from(amount.as_str()));
            }
            // Only a second address names the recipient.
            if let Some(recipient) = addresses.get(1) {
                params.insert("recipient".to_string(), Value::from(*recipient));
            }
        }
        ActionKind::CreateAccount | ActionKind::CallContract => {}
    }
    params
}
