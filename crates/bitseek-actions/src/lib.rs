pub mod assistant;
pub mod classifier;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod generator;
pub mod heuristic;

pub use assistant::Assistant;
pub use classifier::{extract_json_object, judgment_prompt, parse_judgment, MAX_JSON_SCAN_BYTES};
pub use dispatcher::{DispatchConfig, Dispatcher, Reply, ReplyKind};
pub use error::ActionError;
pub use executor::{
    ActionExecutor, ExecutorError, ExecutorFailureKind, HttpActionExecutor,
    DEFAULT_EXECUTOR_TIMEOUT, DEFAULT_EXECUTOR_URL,
};
pub use generator::Generator;
