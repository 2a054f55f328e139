use std::collections::HashMap;

use crate::error::Result;
use crate::message::{Message, MsgType};

/// Handler for one message type, run against the node that owns it.
pub type Processor<N> = fn(&mut N, Message) -> Result<()>;

/// Message processors of a node, keyed by message type.
pub struct Processors<N> {
    table: HashMap<MsgType, Processor<N>>,
}

impl<N> Default for Processors<N> {
    fn default() -> Self {
        Self {
            table: HashMap::new(),
        }
    }
}

impl<N> Processors<N> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_message_processor(&mut self, msg_type: MsgType, processor: Processor<N>) {
        self.table.insert(msg_type, processor);
    }

    pub fn get(&self, msg_type: MsgType) -> Option<Processor<N>> {
        self.table.get(&msg_type).copied()
    }
}
