use crate::error::ActionError;
use crate::generator::Generator;
use bitseek_core::{ActionKind, ActionParams, Classification, DEFAULT_CONFIDENCE};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub const MAX_JSON_SCAN_BYTES: usize = 8 * 1024;

pub fn judgment_prompt(input: &str) -> String {
    format!(
        r#"You decide whether a user request needs a blockchain operation.

User input: "{input}"

Supported operations:
1. createAccount - create a new account or wallet
2. getBalance - look up the balance of an address
3. transfer - send funds to another address
4. callContract - invoke a smart contract function

Rules:
- account, wallet or 账户/账号 creation requests are createAccount
- balance checks or 余额 questions are getBalance
- sending, paying or 转账 requests are transfer
- running or calling a contract (合约) is callContract
- anything else (chat, questions, support) is not an operation

Put every value you can read from the input into params, using the keys
address, senderPrivateKey, recipient, amount, privateKey, packageObjectId,
module, functionName, args, typeArguments.

Answer with JSON only, in exactly this shape:
{{"isMCP": true, "operation": "createAccount", "params": {{}}, "confidence": 0.9}}
or, for a non-operation:
{{"isMCP": false, "confidence": 0.9}}"#
    )
}

/// Returns the first parseable JSON object in `text`.
///
/// Starting at the first `{`, prefixes ending in `}` are tried in order of
/// length; the search gives up after `MAX_JSON_SCAN_BYTES`.
pub fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let tail = &text[start..];
    for (idx, ch) in tail.char_indices() {
        if idx >= MAX_JSON_SCAN_BYTES {
            break;
        }
        if ch != '}' {
            continue;
        }
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&tail[..=idx]) {
            return Some(value);
        }
    }
    None
}

pub fn parse_judgment(text: &str) -> Result<Classification, ActionError> {
    let Some(Value::Object(judgment)) = extract_json_object(text) else {
        return Err(ActionError::ClassificationFormat(
            "no JSON object in judgment".to_string(),
        ));
    };
    let is_action = judgment
        .get("isMCP")
        .and_then(Value::as_bool)
        .ok_or_else(|| ActionError::ClassificationFormat("isMCP is missing".to_string()))?;
    let confidence = judgment
        .get("confidence")
        .and_then(Value::as_f64)
        .unwrap_or(DEFAULT_CONFIDENCE);
    if !is_action {
        return Ok(Classification::NotAction { confidence });
    }
    let operation = judgment
        .get("operation")
        .and_then(Value::as_str)
        .ok_or_else(|| ActionError::ClassificationFormat("operation is missing".to_string()))?;
    let kind: ActionKind = operation.parse().map_err(ActionError::ClassificationFormat)?;
    let params = match judgment.get("params") {
        Some(Value::Object(params)) => params.clone(),
        _ => ActionParams::new(),
    };
    Ok(Classification::Action {
        kind,
        params,
        confidence,
    })
}

/// Asks the model for a judgment on `input` and decodes it.
pub async fn classify(
    generator: &dyn Generator,
    input: &str,
    cancel: &CancellationToken,
) -> Result<Classification, ActionError> {
    let response = generator
        .generate(&judgment_prompt(input), None, cancel)
        .await?;
    let classification = parse_judgment(&response)?;
    debug!(
        event = "classification",
        action = ?classification.kind(),
        confidence = classification.confidence()
    );
    Ok(classification)
}
