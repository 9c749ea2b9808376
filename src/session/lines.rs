//! Newline-delimited JSON framing for sessions.
//!
//! Each line a client writes is one [`ControlMessage`]; each line the server
//! writes is one [`UpdateEvent`]. Lines that do not parse are logged and
//! skipped, so a client typo never ends its session. A line longer than
//! [`MAX_LINE_LENGTH`] is a codec error and ends the stream.

use super::SessionSink;
use crate::error::SessionError;
use crate::types::{ControlMessage, UpdateEvent};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::warn;

/// Longest accepted control line, in bytes.
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

pub type ControlStream = BoxStream<'static, Result<ControlMessage, SessionError>>;

/// Parse control messages from `reader`, one per line.
pub fn control_stream<R>(reader: R) -> ControlStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH))
        .filter_map(|line| async move {
            match line {
                Ok(line) => parse_control(&line).map(Ok),
                Err(e) => Some(Err(e.into())),
            }
        })
        .boxed()
}

fn parse_control(line: &str) -> Option<ControlMessage> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(message) => Some(message),
        Err(e) => {
            warn!(error = %e, "skipping malformed control message");
            None
        }
    }
}

/// Writes each event as one JSON line.
pub struct LineSink<W> {
    inner: FramedWrite<W, LinesCodec>,
}

impl<W: AsyncWrite + Unpin> LineSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            inner: FramedWrite::new(writer, LinesCodec::new()),
        }
    }
}

#[async_trait]
impl<W> SessionSink for LineSink<W>
where
    W: AsyncWrite + Send + Unpin,
{
    async fn send(&mut self, event: UpdateEvent) -> Result<(), SessionError> {
        let line = serde_json::to_string(&event)?;
        self.inner.send(line).await?;
        Ok(())
    }
}

/// Split a connection into its control stream and event sink.
pub fn split<T>(io: T) -> (ControlStream, LineSink<WriteHalf<T>>)
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let (reader, writer): (ReadHalf<T>, WriteHalf<T>) = tokio::io::split(io);
    (control_stream(reader), LineSink::new(writer))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_control_stream_skips_bad_lines() {
        let input: &[u8] = b"{\"resource_id\":\"p1\",\"action\":\"subscribe\"}\n\
            not json\n\
            \n\
            {\"resource_id\":\"p1\",\"action\":\"update\"}\n";
        let messages: Vec<_> = control_stream(input).collect().await;

        let messages: Vec<_> = messages.into_iter().map(|m| m.unwrap()).collect();
        assert_eq!(
            messages,
            vec![ControlMessage::subscribe("p1"), ControlMessage::update("p1")]
        );
    }

    #[tokio::test]
    async fn test_oversized_line_is_an_error() {
        let mut input = vec![b'x'; MAX_LINE_LENGTH + 10];
        input.push(b'\n');
        let mut messages = control_stream(std::io::Cursor::new(input));

        assert!(matches!(
            messages.next().await,
            Some(Err(SessionError::Codec(_)))
        ));
    }

    #[tokio::test]
    async fn test_line_sink_writes_json_lines() {
        let (client, server) = tokio::io::duplex(1024);
        let (_incoming, mut sink) = split(server);

        sink.send(UpdateEvent::new("p1", 3, "Project p1 updated"))
            .await
            .unwrap();

        let mut lines = BufReader::new(client).lines();
        let line = lines.next_line().await.unwrap().unwrap();
        let event: UpdateEvent = serde_json::from_str(&line).unwrap();
        assert_eq!(event, UpdateEvent::new("p1", 3, "Project p1 updated"));
    }

    #[tokio::test]
    async fn test_split_reads_client_lines() {
        let (mut client, server) = tokio::io::duplex(1024);
        let (mut incoming, _sink) = split(server);

        client
            .write_all(b"{\"resource_id\":\"p9\",\"action\":\"noop\"}\n")
            .await
            .unwrap();
        drop(client);

        let message = incoming.next().await.unwrap().unwrap();
        assert_eq!(message, ControlMessage::new("p9", "noop"));
        assert!(incoming.next().await.is_none());
    }
}
