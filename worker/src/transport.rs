use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::debug;

use shared::codec::BinCodec;
use shared::control::{ControlMessage, Handshake, HandshakeAck};

#[derive(Debug, Error)]
pub enum TransportError {
    /// The byte stream ended, or ended mid-frame. Distinct from a receive
    /// timeout, which is not an error.
    #[error("connection to host lost")]
    ConnectionLost,
    /// A complete frame arrived but its payload did not decode. The caller
    /// drops the message and keeps the connection.
    #[error("malformed message: {0}")]
    Malformed(String),
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Framed control-message connection to the host.
///
/// Every frame is a 4-byte big-endian u32 length prefix plus payload;
/// `send` flushes the whole frame and `recv` accumulates partial reads
/// until the declared length is satisfied before decoding.
pub struct HostLink {
    reader: FramedRead<OwnedReadHalf, BinCodec<ControlMessage>>,
    writer: FramedWrite<OwnedWriteHalf, BinCodec<ControlMessage>>,
}

impl HostLink {
    pub async fn connect(path: &Path) -> Result<Self, TransportError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(stream))
    }

    pub fn from_stream(stream: UnixStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: FramedRead::new(read_half, BinCodec::new()),
            writer: FramedWrite::new(write_half, BinCodec::new()),
        }
    }

    /// Announce this worker and wait for the host's ack within `timeout`.
    pub async fn handshake(
        &mut self,
        hello: Handshake,
        timeout: Duration,
    ) -> Result<HandshakeAck, TransportError> {
        self.send(ControlMessage::Handshake(hello)).await?;
        match self.recv(timeout).await? {
            Some(ControlMessage::HandshakeAck(ack)) => Ok(ack),
            Some(other) => Err(TransportError::HandshakeFailed(format!(
                "expected HandshakeAck, got {other:?}"
            ))),
            None => Err(TransportError::HandshakeFailed("timed out waiting for ack".into())),
        }
    }

    /// Wait up to `timeout` for one message.
    ///
    /// `Ok(None)` means no complete frame arrived in time; the connection
    /// is still healthy. EOF (clean or mid-frame) is `ConnectionLost`, and
    /// an undecodable payload is `Malformed`.
    pub async fn recv(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<ControlMessage>, TransportError> {
        match tokio::time::timeout(timeout, self.reader.next()).await {
            Err(_elapsed) => Ok(None),
            Ok(None) => Err(TransportError::ConnectionLost),
            Ok(Some(Ok(message))) => {
                debug!(?message, "received control message");
                Ok(Some(message))
            }
            Ok(Some(Err(err))) if err.kind() == ErrorKind::InvalidData => {
                Err(TransportError::Malformed(err.to_string()))
            }
            Ok(Some(Err(_))) => Err(TransportError::ConnectionLost),
        }
    }

    pub async fn send(&mut self, message: ControlMessage) -> Result<(), TransportError> {
        self.writer.send(message).await?;
        Ok(())
    }

    pub async fn close(&mut self) {
        let _ = self.writer.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::control::{Heartbeat, JobSubmit};
    use std::collections::HashMap;
    use tokio::io::AsyncWriteExt;

    fn framed(stream: UnixStream) -> HostLink {
        HostLink::from_stream(stream)
    }

    #[tokio::test]
    async fn round_trip_over_socket_pair() {
        let (worker_side, host_side) = UnixStream::pair().unwrap();
        let mut worker = framed(worker_side);
        let mut host = framed(host_side);

        let submit = ControlMessage::JobSubmit(JobSubmit {
            job_id: "j-1".into(),
            op_type: "decoder.vae".into(),
            params: HashMap::new(),
            inputs: HashMap::new(),
            outputs: vec![],
        });
        host.send(submit.clone()).await.unwrap();

        let received = worker.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(received, Some(submit));
    }

    #[tokio::test]
    async fn empty_socket_times_out_as_none() {
        let (worker_side, _host_side) = UnixStream::pair().unwrap();
        let mut worker = framed(worker_side);

        let received = worker.recv(Duration::ZERO).await.unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn eof_is_connection_lost() {
        let (worker_side, host_side) = UnixStream::pair().unwrap();
        let mut worker = framed(worker_side);
        drop(host_side);

        let err = worker.recv(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost));
    }

    #[tokio::test]
    async fn close_mid_frame_is_connection_lost() {
        let (worker_side, mut host_side) = UnixStream::pair().unwrap();
        let mut worker = framed(worker_side);

        // Declare a 100-byte payload but deliver only 10 before closing.
        host_side.write_all(&100u32.to_be_bytes()).await.unwrap();
        host_side.write_all(&[0u8; 10]).await.unwrap();
        host_side.shutdown().await.unwrap();
        drop(host_side);

        let err = worker.recv(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::ConnectionLost));
    }

    #[tokio::test]
    async fn garbage_frame_is_malformed() {
        let (worker_side, mut host_side) = UnixStream::pair().unwrap();
        let mut worker = framed(worker_side);

        // A complete frame whose payload is not a ControlMessage.
        host_side.write_all(&2u32.to_be_bytes()).await.unwrap();
        host_side.write_all(&[0xfe, 0xff]).await.unwrap();

        let err = worker.recv(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::Malformed(_)));
    }

    #[tokio::test]
    async fn heartbeat_echo_round_trip() {
        let (worker_side, host_side) = UnixStream::pair().unwrap();
        let mut worker = framed(worker_side);
        let mut host = framed(host_side);

        host.send(ControlMessage::Heartbeat(Heartbeat { sequence: 42 })).await.unwrap();
        match worker.recv(Duration::from_secs(1)).await.unwrap() {
            Some(ControlMessage::Heartbeat(beat)) => {
                worker.send(ControlMessage::Heartbeat(beat)).await.unwrap();
            }
            other => panic!("unexpected message: {other:?}"),
        }

        let echoed = host.recv(Duration::from_secs(1)).await.unwrap();
        assert_eq!(echoed, Some(ControlMessage::Heartbeat(Heartbeat { sequence: 42 })));
    }
}
