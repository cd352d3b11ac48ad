//! Recording controller link.
//!
//! Captures every outbound command and event a session sends, so tests can
//! answer commands through `SessionHandle::controller_reply` and inspect
//! the events the controller would have received.

use crate::wait_for;
use accessory_receiver::errors::{ReceiverError, ReceiverResult};
use accessory_receiver::platform::{ControllerLink, OutboundCommand};
use accessory_receiver::value::Dict;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Mock controller side of one connection.
#[derive(Debug, Default)]
pub struct MockControllerLink {
    commands: Mutex<Vec<OutboundCommand>>,
    events: Mutex<Vec<(String, Dict)>>,
    broken: AtomicBool,
}

impl MockControllerLink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later send fail, as a dropped connection would.
    pub fn break_link(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    pub fn commands(&self) -> Vec<OutboundCommand> {
        self.commands.lock().unwrap().clone()
    }

    pub fn events(&self) -> Vec<(String, Dict)> {
        self.events.lock().unwrap().clone()
    }

    /// Events named `name`, oldest first.
    pub fn events_named(&self, name: &str) -> Vec<Dict> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, params)| params.clone())
            .collect()
    }

    /// Wait until a command named `name` has been sent and return the most
    /// recent one.
    pub async fn wait_for_command(&self, name: &str) -> OutboundCommand {
        wait_for(|| self.commands().iter().any(|c| c.command == name)).await;
        self.commands()
            .into_iter()
            .rev()
            .find(|c| c.command == name)
            .unwrap()
    }

    /// Wait until `count` events named `name` have been sent.
    pub async fn wait_for_events(&self, name: &str, count: usize) -> Vec<Dict> {
        wait_for(|| self.events_named(name).len() >= count).await;
        self.events_named(name)
    }
}

impl ControllerLink for MockControllerLink {
    fn send_command(&self, command: OutboundCommand) -> ReceiverResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ReceiverError::NotReady("link closed".to_string()));
        }
        self.commands.lock().unwrap().push(command);
        Ok(())
    }

    fn send_event(&self, name: &str, params: Dict) -> ReceiverResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ReceiverError::NotReady("link closed".to_string()));
        }
        self.events.lock().unwrap().push((name.to_string(), params));
        Ok(())
    }
}
