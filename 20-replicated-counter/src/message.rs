use std::io;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Calls a node accepts from its peers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Announce `id` to the callee; answered with the callee's known peers.
    Register { id: String },
    Heartbeat { id: String },
    PropagateIncrement { op_id: String },
    GetCounter,
    GetPeers,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Peers { peers: Vec<String> },
    Alive { alive: bool },
    Ack { success: bool },
    Counter { counter: i64 },
    Error { message: String },
}

/// Reads the next frame from a peer connection.
///
/// A frame is one JSON document terminated by `\n` (a trailing `\r` is
/// dropped). Empty frames are skipped. `Ok(None)` means the peer hung up
/// between frames; a frame that is not valid JSON for `T` is `InvalidData`.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut frame = String::new();
    loop {
        frame.clear();
        if reader.read_line(&mut frame).await? == 0 {
            return Ok(None);
        }
        let body = frame.trim_end_matches(LINE_ENDINGS);
        if !body.is_empty() {
            return serde_json::from_str(body).map(Some).map_err(invalid_frame);
        }
    }
}

/// Writes one frame and flushes, so a request is on the wire before the
/// caller starts waiting for its response.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut frame = serde_json::to_vec(message).map_err(invalid_frame)?;
    frame.push(b'\n');
    writer.write_all(&frame).await?;
    writer.flush().await
}

fn invalid_frame(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}
