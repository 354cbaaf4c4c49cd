//! PostgreSQL `LISTEN`/`NOTIFY` driver.

use std::str::FromStr;

use async_trait::async_trait;
use sqlx::{postgres::PgListener, PgPool};

use crate::{error::Error, event::Channel};

use super::{Driver, Listener};

#[derive(Clone)]
pub struct PgDriver {
    pool: PgPool,
}

impl PgDriver {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Driver for PgDriver {
    async fn publish(&self, channel: Channel, payload: &str) -> Result<(), Error> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel.as_ref())
            .bind(payload)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn listen(&self, channels: &[Channel]) -> Result<Box<dyn Listener>, Error> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener
            .listen_all(channels.iter().map(|channel| channel.as_ref()))
            .await?;

        Ok(Box::new(PgNotificationListener { listener }))
    }
}

struct PgNotificationListener {
    listener: PgListener,
}

#[async_trait]
impl Listener for PgNotificationListener {
    async fn recv(&mut self) -> Result<(Channel, String), Error> {
        loop {
            let notification = self.listener.recv().await?;

            match Channel::from_str(notification.channel()) {
                Ok(channel) => return Ok((channel, notification.payload().to_owned())),
                Err(_) => {
                    tracing::debug!(channel = notification.channel(), "Ignoring unknown channel");
                }
            }
        }
    }
}
