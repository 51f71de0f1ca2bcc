//! [`BusSlave`]: a protocol handler plus its optional local switch.

use std::sync::Arc;

use crate::debounce::SwitchHandler;
use crate::handler::ProtocolHandler;

/// A running slave device.
pub struct BusSlave {
    handler: Arc<ProtocolHandler>,
    switch: Option<SwitchHandler>,
}

impl BusSlave {
    pub(crate) fn new(handler: Arc<ProtocolHandler>, switch: Option<SwitchHandler>) -> Self {
        BusSlave { handler, switch }
    }

    pub fn handler(&self) -> &Arc<ProtocolHandler> {
        &self.handler
    }

    /// The local switch, if the slave was built with an input.
    pub fn switch(&self) -> Option<&SwitchHandler> {
        self.switch.as_ref()
    }

    pub fn address(&self) -> u8 {
        self.handler.address()
    }

    /// Stop the switch task, then the handler and its transport.
    pub async fn shutdown(&self) {
        if let Some(switch) = &self.switch {
            switch.shutdown().await;
        }
        self.handler.deinitialize().await;
    }
}
