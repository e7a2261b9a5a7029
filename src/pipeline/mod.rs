pub mod consumer;
pub mod processor;

pub use consumer::{DeliveryConsumer, PipelineHandle};
pub use processor::MessageProcessor;
