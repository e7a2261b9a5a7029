use message_delivery_service::{
    config::Config,
    db,
    emitter::RedisSocketEmitter,
    error::AppError,
    logging,
    pipeline::{DeliveryConsumer, MessageProcessor},
    presence::RedisPresenceRegistry,
    queue::{DeliveryQueue, PushQueue},
    services::{
        DisabledPushGateway, FanoutService, HttpPushGateway, PostgresDeviceTokenStore,
        PostgresMessageStore, PushConsumer, PushScheduler, PushTransport,
    },
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let config = Arc::new(Config::from_env()?);

    let pool = db::init_pool(&config.database_url)
        .await
        .map_err(|e| AppError::Startup(format!("db: {e}")))?;
    db::MIGRATOR
        .run(&pool)
        .await
        .map_err(|e| AppError::Startup(format!("migrations: {e}")))?;

    let redis = redis::Client::open(config.redis_url.as_str())
        .map_err(|e| AppError::Startup(format!("redis: {e}")))?;

    let delivery_queue = Arc::new(DeliveryQueue::new(redis.clone(), config.partition_count));
    delivery_queue.ensure_groups().await?;
    let push_queue = PushQueue::new(redis.clone());
    push_queue.ensure_group().await?;

    let store = Arc::new(PostgresMessageStore::new(pool.clone(), redis.clone()));
    let presence = Arc::new(RedisPresenceRegistry::new(
        redis.clone(),
        config.presence_ttl,
    ));
    let emitter = Arc::new(RedisSocketEmitter::new(redis.clone()));
    let fanout = FanoutService::new(presence, emitter);
    let scheduler = PushScheduler::new(
        Arc::new(push_queue.clone()),
        config.content_preview_max,
    );
    let processor = Arc::new(MessageProcessor::new(store, fanout, scheduler));

    let pipeline = DeliveryConsumer::new(delivery_queue, processor, Arc::clone(&config)).start();

    let transport: Arc<dyn PushTransport> = match config.push_gateway.clone() {
        Some(gateway) => Arc::new(HttpPushGateway::new(gateway)),
        None => {
            tracing::warn!("PUSH_GATEWAY_URL not set; push delivery disabled");
            Arc::new(DisabledPushGateway)
        }
    };
    let tokens = Arc::new(PostgresDeviceTokenStore::new(pool.clone()));
    let push_pool = Arc::new(PushConsumer::new(
        push_queue,
        tokens,
        transport,
        Arc::clone(&config),
    ))
    .start();

    tracing::info!(
        partitions = config.partition_count,
        push_workers = config.push_worker_count,
        "message delivery service running"
    );

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| AppError::Startup(format!("signal handler: {e}")))?;
    tracing::info!("shutdown signal received, draining in-flight batches");

    pipeline.shutdown().await;
    push_pool.shutdown().await;
    tracing::info!("shutdown complete");

    Ok(())
}
