use async_trait::async_trait;
use tokio::sync::mpsc;

use super::protocol::{ClientMessage, ServerMessage, decode, encode};
use crate::error::TransportError;

/// A bidirectional channel between a session and its client.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, message: ServerMessage) -> Result<(), TransportError>;

    /// The next client message, or `None` once the client is gone.
    async fn receive(&mut self) -> Result<Option<ClientMessage>, TransportError>;

    async fn close(&mut self) -> Result<(), TransportError>;
}

/// In-process transport. Messages cross the channel as JSON text, the same
/// way they would cross a socket.
#[derive(Debug)]
pub struct ChannelTransport {
    outgoing: Option<mpsc::Sender<String>>,
    incoming: mpsc::Receiver<String>,
}

/// The client end of a [`ChannelTransport`].
#[derive(Debug)]
pub struct ChannelClient {
    outgoing: Option<mpsc::Sender<String>>,
    incoming: mpsc::Receiver<String>,
}

const CHANNEL_CAPACITY: usize = 64;

impl ChannelTransport {
    pub fn pair() -> (ChannelTransport, ChannelClient) {
        let (to_client, from_server) = mpsc::channel(CHANNEL_CAPACITY);
        let (to_server, from_client) = mpsc::channel(CHANNEL_CAPACITY);
        (
            ChannelTransport {
                outgoing: Some(to_client),
                incoming: from_client,
            },
            ChannelClient {
                outgoing: Some(to_server),
                incoming: from_server,
            },
        )
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&mut self, message: ServerMessage) -> Result<(), TransportError> {
        let text = encode(&message)?;
        let sender = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        sender.send(text).await.map_err(|_| TransportError::Closed)
    }

    async fn receive(&mut self) -> Result<Option<ClientMessage>, TransportError> {
        match self.incoming.recv().await {
            Some(text) => decode(&text).map(Some),
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.outgoing.take();
        self.incoming.close();
        Ok(())
    }
}

impl ChannelClient {
    pub async fn send(&self, message: &ClientMessage) -> Result<(), TransportError> {
        let text = encode(message)?;
        let sender = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        sender.send(text).await.map_err(|_| TransportError::Closed)
    }

    /// Sends raw text, bypassing encoding.
    pub async fn send_raw(&self, text: impl Into<String>) -> Result<(), TransportError> {
        let sender = self.outgoing.as_ref().ok_or(TransportError::Closed)?;
        sender.send(text.into()).await.map_err(|_| TransportError::Closed)
    }

    pub async fn receive(&mut self) -> Result<Option<ServerMessage>, TransportError> {
        match self.incoming.recv().await {
            Some(text) => decode(&text).map(Some),
            None => Ok(None),
        }
    }

    /// Non-blocking receive.
    pub fn try_receive(&mut self) -> Result<Option<ServerMessage>, TransportError> {
        match self.incoming.try_recv() {
            Ok(text) => decode(&text).map(Some),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(TransportError::Closed),
        }
    }

    pub fn close(&mut self) {
        self.outgoing.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::ComponentBatch;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_messages_cross_the_channel() {
        let (mut server, mut client) = ChannelTransport::pair();

        client
            .send(&ClientMessage::StateUpdate { updates: BTreeMap::new() })
            .await
            .unwrap();
        assert_eq!(
            server.receive().await.unwrap(),
            Some(ClientMessage::StateUpdate { updates: BTreeMap::new() })
        );

        let batch = ComponentBatch::Plain { components: Vec::new() };
        server.send(ServerMessage::Components { batch: batch.clone() }).await.unwrap();
        assert_eq!(
            client.receive().await.unwrap(),
            Some(ServerMessage::Components { batch })
        );
    }

    #[tokio::test]
    async fn test_client_close_ends_stream() {
        let (mut server, mut client) = ChannelTransport::pair();
        client.close();
        assert_eq!(server.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (mut server, _client) = ChannelTransport::pair();
        server.close().await.unwrap();
        let err = server
            .send(ServerMessage::Error { message: "x".into() })
            .await
            .unwrap_err();
        assert_eq!(err, TransportError::Closed);
    }

    #[tokio::test]
    async fn test_garbage_is_a_decode_error() {
        let (mut server, client) = ChannelTransport::pair();
        client.send_raw("not json").await.unwrap();
        assert!(matches!(server.receive().await, Err(TransportError::Decode(_))));
    }
}
