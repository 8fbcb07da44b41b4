pub mod action;
pub mod clean;
pub mod wire;

pub use action::{
    ActionCall, ActionKind, ActionParams, ActionValidationError, Classification,
    ContractInvocation, DEFAULT_CONFIDENCE,
};
pub use clean::{
    contains_stop_marker, partial_stop_marker_len, CleaningRule, ResponseCleaner,
    DEFAULT_STOP_MARKERS,
};
pub use wire::{
    decode_frame, encode_frame, FrameError, GeneratePayload, GenerationParams, InboundFrame,
    OutboundFrame, DEFAULT_MAX_FRAME_BYTES, DEFAULT_MODEL, DEFAULT_SESSION_MAX_LENGTH,
};
