//! Inbound message dispatch with failure isolation
//!
//! The dispatcher runs on the session's background tick. A handler that
//! returns an error or panics is logged and counted; the tick keeps running.

use crate::transport::{EventSink, InboundMessage};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{error, info, warn};

/// Error type returned by message handlers
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Application callback for inbound messages
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError>;
}

impl<F> MessageHandler for F
where
    F: Fn(&InboundMessage) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        self(message)
    }
}

/// Handler in place until the application registers its own
#[derive(Debug, Default, Clone, Copy)]
pub struct UnconfiguredHandler;

impl MessageHandler for UnconfiguredHandler {
    fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        warn!(topic = %message.topic, "No message handler configured; message ignored");
        Ok(())
    }
}

/// Forwards inbound messages to one replaceable handler
pub struct MessageDispatcher {
    handler: RwLock<Arc<dyn MessageHandler>>,
    dispatched: AtomicU64,
    failures: AtomicU64,
}

impl Default for MessageDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageDispatcher {
    pub fn new() -> Self {
        Self::with_handler(Arc::new(UnconfiguredHandler))
    }

    pub fn with_handler(handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            handler: RwLock::new(handler),
            dispatched: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Replace the handler; takes effect from the next message
    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        match self.handler.write() {
            Ok(mut guard) => *guard = handler,
            Err(poisoned) => *poisoned.into_inner() = handler,
        }
    }

    fn current_handler(&self) -> Arc<dyn MessageHandler> {
        match self.handler.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    /// Deliver one message. Never fails and never panics.
    pub fn dispatch(&self, message: &InboundMessage) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
        info!(
            topic = %message.topic,
            payload = %message.payload_str(),
            retain = message.retain,
            "Received message"
        );

        let handler = self.current_handler();
        match catch_unwind(AssertUnwindSafe(|| handler.handle(message))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(topic = %message.topic, error = %e, "Message handler failed");
            }
            Err(panic) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                error!(
                    topic = %message.topic,
                    panic = %panic_message(panic.as_ref()),
                    "Message handler panicked"
                );
            }
        }
    }

    pub fn dispatched_count(&self) -> u64 {
        self.dispatched.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

impl EventSink for MessageDispatcher {
    fn on_message(&self, message: InboundMessage) {
        self.dispatch(&message);
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
