//! Streaming connection to the aggregation service.

// Third Party
use async_trait::async_trait;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tracing::info;

// Local
use crate::error::Result;
use crate::model::CongroupUpdateEvent;

#[async_trait]
pub trait EventConnection: Send {
    /// Delivers one event. Any error ends the connection.
    async fn send(&mut self, event: &CongroupUpdateEvent) -> Result<()>;
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn EventConnection>>;
}

/// Newline-delimited JSON over TCP.
pub struct TcpJsonConnector {
    address: String,
}

impl TcpJsonConnector {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl Connector for TcpJsonConnector {
    async fn connect(&self) -> Result<Box<dyn EventConnection>> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        info!(address = %self.address, "Connected to aggregation service");
        Ok(Box::new(TcpJsonConnection {
            writer: BufWriter::new(stream),
        }))
    }
}

struct TcpJsonConnection {
    writer: BufWriter<TcpStream>,
}

#[async_trait]
impl EventConnection for TcpJsonConnection {
    async fn send(&mut self, event: &CongroupUpdateEvent) -> Result<()> {
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    // Third Party
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    // Local
    use super::*;
    use crate::model::{CongroupEventType, CongroupUid, ContainerGroup};

    #[tokio::test]
    async fn test_events_are_written_as_json_lines() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut lines = BufReader::new(socket).lines();
            let mut received = Vec::new();
            while let Some(line) = lines.next_line().await.unwrap() {
                received.push(serde_json::from_str::<CongroupUpdateEvent>(&line).unwrap());
            }
            received
        });

        let mut connection = TcpJsonConnector::new(&address).connect().await.unwrap();
        for id in ["a", "b"] {
            let event = CongroupUpdateEvent::new(
                CongroupEventType::Added,
                ContainerGroup::new(CongroupUid::new("k8s_resourcequota", id)),
            );
            connection.send(&event).await.unwrap();
        }
        drop(connection);

        let received = server.await.unwrap();
        let ids: Vec<_> = received.iter().map(|e| e.object.uid.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_connect_failure_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(TcpJsonConnector::new(&address).connect().await.is_err());
    }
}
