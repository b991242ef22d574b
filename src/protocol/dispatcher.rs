//! Routes server-initiated long-link events to registered handlers.

use crate::core::packet::PacketHeader;
use crate::core::record::CMD_SYNC_NOTIFY;
use crate::error::{constants, ProtocolError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

type HandlerFn = dyn Fn(&PushEvent) -> Result<()> + Send + Sync + 'static;

/// A server-initiated message received on a long-link
#[derive(Debug, Clone)]
pub enum PushEvent {
    /// "New data available" notification; the caller typically follows up with a sync request
    SyncNotify { account_id: String, body: Bytes },
    /// A packet frame pushed by the server. Framing has been validated, the
    /// body is still sealed.
    Frame {
        account_id: String,
        cmd_id: u32,
        header: PacketHeader,
        frame: Bytes,
    },
}

impl PushEvent {
    pub fn account_id(&self) -> &str {
        match self {
            PushEvent::SyncNotify { account_id, .. } | PushEvent::Frame { account_id, .. } => {
                account_id
            }
        }
    }

    /// Command id used for routing
    pub fn cmd_id(&self) -> u32 {
        match self {
            PushEvent::SyncNotify { .. } => CMD_SYNC_NOTIFY,
            PushEvent::Frame { cmd_id, .. } => *cmd_id,
        }
    }
}

/// Event dispatcher keyed by command id, with an optional catch-all handler
pub struct EventDispatcher {
    handlers: Arc<RwLock<HashMap<u32, Box<HandlerFn>>>>,
    fallback: Arc<RwLock<Option<Box<HandlerFn>>>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            fallback: Arc::new(RwLock::new(None)),
        }
    }

    pub fn register<F>(&self, cmd_id: u32, handler: F) -> Result<()>
    where
        F: Fn(&PushEvent) -> Result<()> + Send + Sync + 'static,
    {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        handlers.insert(cmd_id, Box::new(handler));
        Ok(())
    }

    /// Handler for command ids with no specific registration
    pub fn set_fallback<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&PushEvent) -> Result<()> + Send + Sync + 'static,
    {
        let mut fallback = self
            .fallback
            .write()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_WRITE_LOCK.to_string()))?;

        *fallback = Some(Box::new(handler));
        Ok(())
    }

    pub fn dispatch(&self, event: &PushEvent) -> Result<()> {
        let cmd_id = event.cmd_id();

        let handlers = self
            .handlers
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string()))?;
        if let Some(handler) = handlers.get(&cmd_id) {
            return handler(event);
        }
        drop(handlers);

        let fallback = self
            .fallback
            .read()
            .map_err(|_| ProtocolError::Custom(constants::ERR_DISPATCHER_READ_LOCK.to_string()))?;
        match fallback.as_ref() {
            Some(handler) => handler(event),
            None => Err(ProtocolError::NotFound(format!("no handler for cmd {cmd_id}"))),
        }
    }
}
