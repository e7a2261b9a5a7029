pub mod envelope;
pub mod event;
pub mod push_task;

pub use envelope::{EnvelopeMetadata, MessageEnvelope, MessageFlags};
pub use event::MessageEvent;
pub use push_task::PushTask;
