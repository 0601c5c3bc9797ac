//! Redis connection for the shared violation store

use fred::clients::Client;
use fred::interfaces::*;
use fred::types::config::Config as RedisConfig;

/// Initialize Redis client
pub async fn init_client(redis_url: &str) -> anyhow::Result<Client> {
    let config = RedisConfig::from_url(redis_url)?;
    let client = Client::new(config, None, None, None);
    client.init().await?;
    ping(&client).await?;
    Ok(client)
}

/// Ping Redis to check connection
pub async fn ping(client: &Client) -> anyhow::Result<()> {
    client.ping::<()>(None).await?;
    Ok(())
}
