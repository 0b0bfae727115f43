use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::{Context, Result};
use redis_utils::ConsumerOptions;
use s3_utils::{S3Client, S3Config};
use sqlx::mysql::MySqlPoolOptions;
use tracing::{info, warn};

use crate::cdc::{Dispatcher, RouteTable};
use crate::collaborators::{
    Collaborators, HttpSearchClient, NoopSearchClient, ObjectStore, RedisPublisher, SearchClient,
    SqlSessionManager,
};
use crate::config::{CanalConfig, TransportKind};
use crate::metrics::{health_handler, metrics_handler};
use crate::stream::{KafkaStream, RedisStream, Stream};

/// Connect every downstream service the handlers emit into.
pub async fn build_collaborators(config: &CanalConfig) -> Result<Collaborators> {
    let redis = redis_utils::connect(&config.redis_url).await?;

    let db = MySqlPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await
        .context("Failed to create database pool")?;
    info!("Database pool created successfully");

    let search: Arc<dyn SearchClient> = match &config.search_url {
        Some(url) => {
            info!(url = %url, "search notifications enabled");
            Arc::new(HttpSearchClient::new(
                url,
                config.search_key.clone(),
                config.search_timeout(),
            )?)
        }
        None => {
            warn!("CANAL_SEARCH_URL not set, search notifications disabled");
            Arc::new(NoopSearchClient)
        }
    };

    let object_store: Option<Arc<dyn ObjectStore>> = if config.s3_enabled {
        let client = S3Client::with_config(S3Config::from_env()).await;
        info!(bucket = %config.s3_image_resize_bucket, "avatar cache cleanup enabled");
        Some(Arc::new(client))
    } else {
        None
    };

    Ok(Collaborators {
        search,
        sessions: Arc::new(SqlSessionManager::new(db, redis.clone())),
        publisher: Arc::new(RedisPublisher::new(redis)),
        object_store,
        image_resize_bucket: config.s3_image_resize_bucket.clone(),
    })
}

/// Open the configured transport.
pub async fn build_stream(config: &CanalConfig) -> Result<Box<dyn Stream>> {
    let topics = config.topics();

    match config.transport {
        TransportKind::Kafka => {
            let stream = KafkaStream::connect(
                &config.kafka_brokers,
                &config.group_id,
                &topics,
                config.retry_interval(),
            )
            .context("Failed to create Kafka consumer")?;
            Ok(Box::new(stream))
        }
        TransportKind::Redis => {
            let conn = redis_utils::connect(&config.redis_url).await?;
            let options = ConsumerOptions::new(&config.group_id, &config.consumer_name)
                .streams(topics.iter().cloned())
                .count(config.read_count)
                .block(config.read_block());

            let stream = RedisStream::connect(conn, options, config.retry_interval())
                .await
                .context("Failed to create Redis stream consumer group")?;
            info!(group = %config.group_id, streams = ?topics, "Redis stream consumer ready");
            Ok(Box::new(stream))
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                terminate.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C signal"),
        _ = terminate => info!("Received SIGTERM signal"),
    }
}

/// Consume the change stream until a shutdown signal, a server failure or
/// a handler error.
pub async fn run(config: CanalConfig) -> Result<()> {
    let collaborators = build_collaborators(&config).await?;
    let dispatcher = Dispatcher::new(RouteTable::standard(&collaborators));
    let stream = build_stream(&config).await?;
    info!(
        transport = ?config.transport,
        tables = ?dispatcher.routes().tables(),
        "canal consumer started"
    );

    let bind_addr = format!("{}:{}", config.http_host, config.http_port);
    let server = HttpServer::new(|| {
        App::new()
            .route("/metrics", web::get().to(metrics_handler))
            .route("/health", web::get().to(health_handler))
    })
    .disable_signals()
    .bind(&bind_addr)
    .with_context(|| format!("Failed to bind metrics server to {}", bind_addr))?
    .run();
    let server_handle = server.handle();
    info!("Metrics server listening on {}", bind_addr);

    let result = tokio::select! {
        res = stream.read(&dispatcher) => res.context("change stream consumer stopped"),
        res = server => res.context("metrics server failed"),
        _ = shutdown_signal() => {
            info!("receive signal, shutdown");
            Ok(())
        }
    };

    if let Err(err) = stream.close() {
        warn!(error = %err, "failed to close change stream");
    }
    server_handle.stop(true).await;

    result
}
