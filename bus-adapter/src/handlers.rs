//! Placeholder business handlers.
//!
//! Each handler runs one use case. When the use case fails, the handler
//! answers on the bus with an error notification replying to the incoming
//! message; the dispatcher never sees the failure.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info};

use crate::error::AdapterError;
use crate::facade::{PortAdapter, Publisher};
use crate::message::{InboundMessage, OutboundMessage};
use crate::registry::MessageHandler;

pub const SOME_SUCCESS: &str = "SomeSuccess";
pub const SOME_ERROR: &str = "SomeError";

/// Type of the notification published when a use case fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InternalErrorType {
    ErrorOneType,
    ErrorOneTwoType,
}

impl InternalErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InternalErrorType::ErrorOneType => "ErrorOneType",
            InternalErrorType::ErrorOneTwoType => "ErrorOneTwoType",
        }
    }
}

#[derive(Error, Debug)]
pub enum UseCaseError {
    #[error("use case rejected the message: {0}")]
    Rejected(String),
}

#[async_trait]
pub trait UseCase: Send + Sync {
    async fn execute(&self, message: &InboundMessage) -> Result<(), UseCaseError>;
}

pub struct SomeSuccessUseCase;

#[async_trait]
impl UseCase for SomeSuccessUseCase {
    async fn execute(&self, _message: &InboundMessage) -> Result<(), UseCaseError> {
        Ok(())
    }
}

pub struct SomeErrorUseCase;

#[async_trait]
impl UseCase for SomeErrorUseCase {
    async fn execute(&self, _message: &InboundMessage) -> Result<(), UseCaseError> {
        Ok(())
    }
}

pub struct ErrorNotifier {
    publisher: Publisher,
}

impl ErrorNotifier {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }

    pub fn notify(&self, incoming: &InboundMessage, error_type: InternalErrorType) {
        let notification = OutboundMessage::new(error_type.as_str())
            .in_reply_to(incoming.message_id)
            .with_correlation_id(incoming.correlation_id.clone());

        if let Err(e) = self.publisher.send(notification) {
            error!(
                entity = "bus.handlers",
                correlation_id = %incoming.correlation_id,
                "can't publish error notification: {}",
                e
            );
        }
    }
}

pub struct UseCaseHandler {
    name: &'static str,
    use_case: Arc<dyn UseCase>,
    on_failure: InternalErrorType,
    notifier: ErrorNotifier,
}

impl UseCaseHandler {
    pub fn new(
        name: &'static str,
        use_case: Arc<dyn UseCase>,
        on_failure: InternalErrorType,
        publisher: Publisher,
    ) -> Self {
        Self {
            name,
            use_case,
            on_failure,
            notifier: ErrorNotifier::new(publisher),
        }
    }
}

#[async_trait]
impl MessageHandler for UseCaseHandler {
    async fn handle(&self, message: InboundMessage) {
        info!(
            entity = self.name,
            correlation_id = %message.correlation_id,
            "get job: {}",
            self.name
        );

        match self.use_case.execute(&message).await {
            Ok(()) => info!(
                entity = self.name,
                correlation_id = %message.correlation_id,
                "job {} successfully completed",
                self.name
            ),
            Err(e) => {
                error!(
                    entity = self.name,
                    correlation_id = %message.correlation_id,
                    "can't run {}, got error: {}",
                    self.name,
                    e
                );
                self.notifier.notify(&message, self.on_failure);
            }
        }
    }
}

/// Subscribes the placeholder handlers for `SomeSuccess` and `SomeError`.
pub fn register_default_handlers(adapter: &mut PortAdapter) -> Result<(), AdapterError> {
    let publisher = adapter.publisher();
    adapter.subscribe(
        SOME_SUCCESS,
        Arc::new(UseCaseHandler::new(
            "some success handler",
            Arc::new(SomeSuccessUseCase),
            InternalErrorType::ErrorOneType,
            publisher.clone(),
        )),
    )?;
    adapter.subscribe(
        SOME_ERROR,
        Arc::new(UseCaseHandler::new(
            "some error handler",
            Arc::new(SomeErrorUseCase),
            InternalErrorType::ErrorOneTwoType,
            publisher,
        )),
    )
}
