// crates/relaycore/src/events/mod.rs

mod base;

pub use base::{ApprovalNotice, EventBus, RunEvent, StepEmitter, StepEvent, ThreadSubscription};
