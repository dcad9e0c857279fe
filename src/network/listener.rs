//! Callbacks receiving what the network delivers

use std::net::SocketAddr;

use super::message::CustomMessage;
use crate::core::ObjectMessage;

/// Receives every newly accepted object and every extension message
pub trait MessageListener: Send + Sync {
    fn receive(&self, object: &ObjectMessage);

    /// Handle a `custom` message; a returned message is sent back to the peer
    fn custom(&self, _from: SocketAddr, _message: &CustomMessage) -> Option<CustomMessage> {
        None
    }
}

impl<F> MessageListener for F
where
    F: Fn(&ObjectMessage) + Send + Sync,
{
    fn receive(&self, object: &ObjectMessage) {
        self(object)
    }
}
