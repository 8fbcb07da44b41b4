use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MODEL: &str = "deepseek-ai/DeepSeek-R1-Distill-Llama-70B";
pub const DEFAULT_SESSION_MAX_LENGTH: u32 = 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    OpenInferenceSession { model: String, max_length: u32 },
    Generate(GeneratePayload),
    Ping,
}

impl OutboundFrame {
    pub fn open_session(model: impl Into<String>, max_length: u32) -> Self {
        OutboundFrame::OpenInferenceSession {
            model: model.into(),
            max_length,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeneratePayload {
    pub inputs: String,
    pub max_new_tokens: u32,
    pub max_length: u32,
    pub do_sample: u8,
    pub temperature: f64,
    pub top_p: f64,
    pub stop_sequence: String,
    pub extra_stop_sequences: Vec<String>,
}

/// Sampling parameters sent with every `generate` frame.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: u32,
    pub max_length: u32,
    pub do_sample: u8,
    pub temperature: f64,
    pub top_p: f64,
    pub stop_sequence: String,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 1,
            max_length: 2048,
            do_sample: 1,
            temperature: 0.7,
            top_p: 1.1,
            stop_sequence: "###".to_string(),
        }
    }
}

impl GenerationParams {
    pub fn frame(&self, inputs: impl Into<String>, extra_stop_sequences: &[String]) -> OutboundFrame {
        OutboundFrame::Generate(GeneratePayload {
            inputs: inputs.into(),
            max_new_tokens: self.max_new_tokens,
            max_length: self.max_length,
            do_sample: self.do_sample,
            temperature: self.temperature,
            top_p: self.top_p,
            stop_sequence: self.stop_sequence.clone(),
            extra_stop_sequences: extra_stop_sequences.to_vec(),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Chunk { text: String, stop: bool },
    Error { message: String },
    HeartbeatAck,
    Ack,
    Other { kind: Option<String> },
}

impl InboundFrame {
    pub fn kind_name(&self) -> &'static str {
        match self {
            InboundFrame::Chunk { .. } => "chunk",
            InboundFrame::Error { .. } => "error",
            InboundFrame::HeartbeatAck => "heartbeat_ack",
            InboundFrame::Ack => "ack",
            InboundFrame::Other { .. } => "other",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame(frame: &OutboundFrame) -> Result<String, FrameError> {
    serde_json::to_string(frame).map_err(|err| FrameError::Encode(err.to_string()))
}

pub fn decode_frame(text: &str, max_frame_bytes: usize) -> Result<InboundFrame, FrameError> {
    if text.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: text.len(),
            max: max_frame_bytes,
        });
    }
    let value: Value =
        serde_json::from_str(text).map_err(|err| FrameError::Decode(err.to_string()))?;
    let Value::Object(map) = value else {
        return Err(FrameError::Decode("expected a JSON object".to_string()));
    };
    Ok(classify_object(&map))
}

fn classify_object(map: &Map<String, Value>) -> InboundFrame {
    if let Some(outputs) = map.get("outputs").filter(|value| !value.is_null()) {
        let text = match outputs {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let stop = map.get("stop").map(truthy).unwrap_or(false);
        return InboundFrame::Chunk { text, stop };
    }
    if let Some(error) = map.get("error").filter(|value| truthy(value)) {
        let message = match error {
            Value::String(message) => message.clone(),
            other => other.to_string(),
        };
        return InboundFrame::Error { message };
    }
    let kind = map.get("type").and_then(Value::as_str);
    if kind == Some("pong") {
        return InboundFrame::HeartbeatAck;
    }
    if map.get("ok").map(truthy).unwrap_or(false) {
        return InboundFrame::Ack;
    }
    InboundFrame::Other {
        kind: kind.map(str::to_string),
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(value) => *value,
        Value::Number(value) => value.as_f64().map(|n| n != 0.0).unwrap_or(true),
        Value::String(value) => !value.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn outbound_frames_match_wire_shape() {
        let open = encode_frame(&OutboundFrame::open_session(DEFAULT_MODEL, 1024)).expect("encode");
        let open: Value = serde_json::from_str(&open).expect("json");
        assert_eq!(
            open,
            json!({"type": "open_inference_session", "model": DEFAULT_MODEL, "max_length": 1024})
        );

        let ping: Value =
            serde_json::from_str(&encode_frame(&OutboundFrame::Ping).expect("encode")).expect("json");
        assert_eq!(ping, json!({"type": "ping"}));

        let generate = GenerationParams::default().frame("hello", &["</s>".to_string()]);
        let generate: Value =
            serde_json::from_str(&encode_frame(&generate).expect("encode")).expect("json");
        assert_eq!(generate["type"], "generate");
        assert_eq!(generate["inputs"], "hello");
        assert_eq!(generate["max_new_tokens"], 1);
        assert_eq!(generate["max_length"], 2048);
        assert_eq!(generate["do_sample"], 1);
        assert_eq!(generate["stop_sequence"], "###");
        assert_eq!(generate["extra_stop_sequences"], json!(["</s>"]));
    }

    #[test]
    fn generate_frame_decodes_back_into_payload() {
        let frame = GenerationParams::default().frame("hi", &[]);
        let encoded = encode_frame(&frame).expect("encode");
        let decoded: OutboundFrame = serde_json::from_str(&encoded).expect("decode");
        assert_eq!(decoded, frame);
    }

    #[test]
    fn inbound_kinds_are_classified() {
        let cases = [
            (r#"{"outputs":"tok"}"#, InboundFrame::Chunk { text: "tok".to_string(), stop: false }),
            (r#"{"outputs":"","stop":true}"#, InboundFrame::Chunk { text: String::new(), stop: true }),
            (r#"{"error":"overloaded"}"#, InboundFrame::Error { message: "overloaded".to_string() }),
            (r#"{"type":"pong"}"#, InboundFrame::HeartbeatAck),
            (r#"{"ok":true}"#, InboundFrame::Ack),
            (r#"{"type":"session_info","ok":false}"#, InboundFrame::Other { kind: Some("session_info".to_string()) }),
            (r#"{}"#, InboundFrame::Other { kind: None }),
        ];
        for (raw, expected) in cases {
            let decoded = decode_frame(raw, DEFAULT_MAX_FRAME_BYTES).expect("decode");
            assert_eq!(decoded, expected, "frame {raw}");
        }
    }

    #[test]
    fn structured_error_payload_is_stringified() {
        let decoded =
            decode_frame(r#"{"error":{"code":503}}"#, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(
            decoded,
            InboundFrame::Error {
                message: r#"{"code":503}"#.to_string()
            }
        );
    }

    #[test]
    fn malformed_and_non_object_frames_fail_to_decode() {
        for raw in ["{\"outputs\":", "not json", "[1,2]", "\"text\""] {
            let result = decode_frame(raw, DEFAULT_MAX_FRAME_BYTES);
            assert!(matches!(result, Err(FrameError::Decode(_))), "frame {raw}");
        }
    }

    #[test]
    fn decoder_rejects_oversized_frame() {
        let huge = format!("{{\"outputs\":\"{}\"}}", "x".repeat(256));
        let result = decode_frame(&huge, 64);
        assert!(matches!(result, Err(FrameError::OversizedFrame { .. })));
    }
}
