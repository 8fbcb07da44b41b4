use crate::classifier;
use crate::dispatcher::{DispatchConfig, Dispatcher, Reply};
use crate::error::ActionError;
use crate::executor::ActionExecutor;
use crate::generator::Generator;
use crate::heuristic;
use bitseek_core::Classification;
use bitseek_session::{retry_if, StreamSink};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Full input pipeline: classify, then chat or dispatch an action.
pub struct Assistant {
    generator: Arc<dyn Generator>,
    dispatcher: Dispatcher,
}

impl Assistant {
    pub fn new(
        generator: Arc<dyn Generator>,
        executor: Arc<dyn ActionExecutor>,
        config: DispatchConfig,
    ) -> Self {
        let dispatcher = Dispatcher::new(generator.clone(), executor, config);
        Self {
            generator,
            dispatcher,
        }
    }

    /// Model judgment first; an undecodable judgment falls back to keywords.
    pub async fn classify(
        &self,
        input: &str,
        cancel: &CancellationToken,
    ) -> Result<Classification, ActionError> {
        match classifier::classify(self.generator.as_ref(), input, cancel).await {
            Err(ActionError::ClassificationFormat(reason)) => {
                warn!(event = "classification_fallback", reason = %reason);
                Ok(heuristic::classify(input))
            }
            other => other,
        }
    }

    /// Runs one input to a reply. Turns that fail on the session link are
    /// rerun under the dispatch retry policy, with a fresh sink from
    /// `make_sink` per attempt. Every other failure except an abort becomes
    /// an error reply.
    pub async fn process_input<F>(
        &self,
        input: &str,
        mut make_sink: F,
        cancel: &CancellationToken,
    ) -> Result<Reply, ActionError>
    where
        F: FnMut() -> Option<Box<dyn StreamSink>>,
    {
        let policy = self.dispatcher.config().retry;
        let result = retry_if(policy, cancel, ActionError::is_transient, |attempt| {
            let sink = make_sink();
            async move {
                if attempt > 1 {
                    info!(event = "input_retry", attempt);
                }
                self.respond(input, sink, cancel).await
            }
        })
        .await;
        self.reply_or_abort(result)
    }

    /// Classifies and answers one input. Session failures are returned as
    /// errors; action failures are already folded into the reply.
    pub async fn respond(
        &self,
        input: &str,
        sink: Option<Box<dyn StreamSink>>,
        cancel: &CancellationToken,
    ) -> Result<Reply, ActionError> {
        match self.classify(input, cancel).await? {
            Classification::Action {
                kind,
                params,
                confidence,
            } => {
                info!(event = "input_routed", route = "action", action = %kind, confidence);
                self.dispatcher
                    .dispatch(kind, &params, input, sink, cancel)
                    .await
            }
            Classification::NotAction { confidence } => {
                info!(event = "input_routed", route = "chat", confidence);
                let text = self.generator.generate(input, sink, cancel).await?;
                Ok(Reply::chat(text))
            }
        }
    }

    fn reply_or_abort(&self, result: Result<Reply, ActionError>) -> Result<Reply, ActionError> {
        match result {
            Err(err) if !err.is_aborted() => {
                warn!(event = "input_failed", error = %err);
                let debug = self.dispatcher.config().debug;
                Ok(Reply::error(None, err.user_message(debug)))
            }
            other => other,
        }
    }
}
