//! Redis test container shared by the store integration tests.

use beacon_jobs::config::RedisConfig;
use beacon_jobs::store::redis::create_pool;
use beacon_jobs::RedisJobStore;
use testcontainers::{runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::redis::{Redis, REDIS_PORT};

/// A throwaway Redis server and a job store bound to it.
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    store: RedisJobStore,
}

impl TestRedis {
    /// Starts a fresh Redis container and connects a store to it.
    pub async fn new() -> Self {
        let container = Redis::default()
            .with_tag("7-alpine")
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(REDIS_PORT)
            .await
            .expect("Failed to get Redis port");

        let config = RedisConfig {
            url: format!("redis://127.0.0.1:{}", port),
            pool_size: 4,
            key_prefix: "beacon:test".to_string(),
        };

        let pool = Self::connect_with_retry(&config, 30).await;

        Self {
            _container: container,
            store: RedisJobStore::new(pool, &config.key_prefix),
        }
    }

    pub fn store(&self) -> &RedisJobStore {
        &self.store
    }

    async fn connect_with_retry(config: &RedisConfig, max_attempts: u32) -> deadpool_redis::Pool {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match create_pool(config).await {
                Ok(pool) => return pool,
                Err(e) => {
                    if attempts >= max_attempts {
                        panic!("Failed to connect to Redis after {} attempts: {}", max_attempts, e);
                    }
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                }
            }
        }
    }
}
