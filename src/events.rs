//! Workflow event channel.
//!
//! Runners stream progress to an optional observer over a tagged event
//! enum. The CLI consumes these to print live activity; library callers may
//! attach their own receiver or none at all.

use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;

use crate::item::ItemState;

/// Tagged progress events emitted while a phase runs.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A chunk of agent output text
    AgentChunk { text: String },
    /// A structured event from the agent stream (tool use, etc.)
    AgentEvent { name: String, payload: Value },
    /// The item moved to a new state
    PhaseChanged { item_id: String, state: ItemState },
    /// The implement loop switched to a different story
    StoryChanged { item_id: String, story_id: String },
    /// The implement loop started a new iteration
    IterationChanged {
        item_id: String,
        iteration: u32,
        max: u32,
    },
}

pub type EventSender = UnboundedSender<WorkflowEvent>;

/// Send an event if an observer is attached; a closed receiver is ignored.
pub fn emit(events: &Option<EventSender>, event: WorkflowEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}
