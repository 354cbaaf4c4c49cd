//! Single-process driver over a tokio broadcast channel.

use async_trait::async_trait;
use tokio::sync::broadcast::{self, error::RecvError};

use crate::{error::Error, event::Channel};

use super::{Driver, Listener};

const CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct LocalDriver {
    sender: broadcast::Sender<(Channel, String)>,
}

impl LocalDriver {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CAPACITY);
        Self { sender }
    }
}

impl Default for LocalDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Driver for LocalDriver {
    async fn publish(&self, channel: Channel, payload: &str) -> Result<(), Error> {
        // No listener attached is not an error; the notification is simply lost.
        let _ = self.sender.send((channel, payload.to_owned()));
        Ok(())
    }

    async fn listen(&self, channels: &[Channel]) -> Result<Box<dyn Listener>, Error> {
        Ok(Box::new(LocalListener {
            receiver: self.sender.subscribe(),
            channels: channels.to_vec(),
        }))
    }
}

struct LocalListener {
    receiver: broadcast::Receiver<(Channel, String)>,
    channels: Vec<Channel>,
}

#[async_trait]
impl Listener for LocalListener {
    async fn recv(&mut self) -> Result<(Channel, String), Error> {
        loop {
            match self.receiver.recv().await {
                Ok((channel, payload)) if self.channels.contains(&channel) => {
                    return Ok((channel, payload))
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Local listener lagged behind");
                }
                Err(RecvError::Closed) => {
                    return Err(Error::internal(eyre::eyre!("local event channel closed")))
                }
            }
        }
    }
}
