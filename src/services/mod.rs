pub mod device_tokens;
pub mod fanout;
pub mod persistence;
pub mod push_gateway;
pub mod push_scheduler;
pub mod push_worker;

pub use device_tokens::{DeviceToken, DeviceTokenStore, PostgresDeviceTokenStore};
pub use fanout::{DeliveryOutcome, FanoutService, RecipientDelivery};
pub use persistence::{MessageStore, PersistOutcome, PostgresMessageStore};
pub use push_gateway::{DisabledPushGateway, HttpPushGateway, PushDeliveryResult, PushTransport};
pub use push_scheduler::PushScheduler;
pub use push_worker::{calculate_backoff, PushConsumer, TaskDisposition};
