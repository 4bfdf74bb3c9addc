//! Application handlers.
//!
//! The dispatch loop hands every inbound message to a [`Handler`] and sends
//! whatever it returns back to the originating connection.

use crate::protocol::{Message, MessageKind};

/// Turns a request into its response.
pub trait Handler: Send + Sync {
    fn handle(&self, message: Message) -> Message;
}

/// Default handler: echo in order, or echo reversed.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoHandler;

impl Handler for EchoHandler {
    fn handle(&self, mut message: Message) -> Message {
        match message.kind() {
            MessageKind::InOrder => message,
            MessageKind::Reverse => {
                message.reverse_body();
                message
            }
        }
    }
}
