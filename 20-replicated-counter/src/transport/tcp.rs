use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        lookup_host,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::Mutex,
};
use tracing::debug;

use super::{Connector, PeerChannel, RpcError};
use crate::message::{read_message, write_message, Request, Response};

/// Dials peers over TCP.
///
/// Dialing only resolves the address; the socket is opened on the first call,
/// so a peer that is down right now still yields a channel that works once it
/// comes back.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn dial(&self, addr: &str) -> Result<Arc<dyn PeerChannel>, RpcError> {
        let mut resolved = lookup_host(addr).await.map_err(|source| RpcError::Io {
            peer: addr.to_string(),
            source,
        })?;
        if resolved.next().is_none() {
            return Err(RpcError::Unreachable {
                peer: addr.to_string(),
            });
        }
        Ok(Arc::new(TcpChannel::new(addr)))
    }
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

/// One lazily connected TCP stream carrying sequential request/response pairs.
pub struct TcpChannel {
    addr: String,
    slot: Mutex<Option<Connection>>,
}

impl TcpChannel {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            slot: Mutex::new(None),
        }
    }

    async fn connect(&self) -> Result<Connection, RpcError> {
        let stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| self.io_error(source))?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        debug!(peer = %self.addr, "opened connection");
        Ok(Connection {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn exchange(&self, conn: &mut Connection, request: &Request) -> Result<Response, RpcError> {
        write_message(&mut conn.writer, request)
            .await
            .map_err(|source| self.io_error(source))?;
        match read_message::<_, Response>(&mut conn.reader).await {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Err(RpcError::Closed {
                peer: self.addr.clone(),
            }),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> RpcError {
        RpcError::Io {
            peer: self.addr.clone(),
            source,
        }
    }
}

#[async_trait]
impl PeerChannel for TcpChannel {
    async fn call(&self, request: Request) -> Result<Response, RpcError> {
        let mut slot = self.slot.lock().await;
        // The connection leaves the slot for the duration of the exchange. If the
        // caller's deadline drops this future midway, the half-used stream is
        // dropped with it rather than handed to the next caller.
        let mut conn = match slot.take() {
            Some(conn) => conn,
            None => self.connect().await?,
        };
        let response = self.exchange(&mut conn, &request).await?;
        *slot = Some(conn);
        Ok(response)
    }

    async fn close(&self) {
        if let Some(mut conn) = self.slot.lock().await.take() {
            let _ = conn.writer.shutdown().await;
            debug!(peer = %self.addr, "closed connection");
        }
    }
}
