use log::{debug, warn};
use shared::{
    decode_payload, encode_message, Frame, FrameDecoder, FrameError, Message, MsgId, PayloadError,
    ProtocolError,
};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error(transparent)]
    Payload(#[from] PayloadError),

    #[error("timed out waiting for the server")]
    Timeout,

    #[error("server closed the connection")]
    Disconnected,

    #[error("expected message {expected}, got {got}")]
    UnexpectedMessage { expected: u16, got: u16 },

    #[error("{0:?} has no paired response")]
    NoPairedResponse(MsgId),
}

/// Framed TCP connection to the arena server.
///
/// A background task splits inbound frames into direct responses and
/// unsolicited server pushes, so a request can wait for its paired response
/// while battle updates keep queueing up on the side.
pub struct Client {
    writer: OwnedWriteHalf,
    responses: mpsc::UnboundedReceiver<Frame>,
    pushes: mpsc::UnboundedReceiver<Frame>,
    reader: JoinHandle<()>,
    timeout: Duration,
}

impl Client {
    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        let (read_half, writer) = stream.into_split();

        let (response_tx, responses) = mpsc::unbounded_channel();
        let (push_tx, pushes) = mpsc::unbounded_channel();
        let reader = tokio::spawn(Self::read_loop(read_half, response_tx, push_tx));

        Ok(Client {
            writer,
            responses,
            pushes,
            reader,
            timeout: DEFAULT_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn read_loop(
        mut reader: OwnedReadHalf,
        responses: mpsc::UnboundedSender<Frame>,
        pushes: mpsc::UnboundedSender<Frame>,
    ) {
        let mut decoder = FrameDecoder::new();
        let mut buffer = vec![0u8; 8 * 1024];

        loop {
            let n = match reader.read(&mut buffer).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    debug!("Client read failed: {}", e);
                    break;
                }
            };
            decoder.extend(&buffer[..n]);

            loop {
                match decoder.next_frame() {
                    Ok(Some(frame)) => {
                        let is_push = MsgId::from_id(frame.msg_id).map_or(false, MsgId::is_server_push);
                        let target = if is_push { &pushes } else { &responses };
                        if target.send(frame).is_err() {
                            return;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Server sent an invalid frame: {}", e);
                        return;
                    }
                }
            }
        }
    }

    /// Sends a typed record without waiting for anything back
    pub async fn send<M: Message>(&mut self, message: &M) -> Result<(), ClientError> {
        let frame = encode_message(message)?;
        self.send_raw(&frame).await
    }

    /// Writes bytes verbatim, bypassing all framing checks
    pub async fn send_raw(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.writer.write_all(bytes).await?;
        Ok(())
    }

    /// Sends `request` and waits for the response paired with its id.
    pub async fn request<Req: Message, Resp: Message>(
        &mut self,
        request: &Req,
    ) -> Result<Resp, ClientError> {
        let expected = Req::MSG_ID
            .expected_response()
            .ok_or(ClientError::NoPairedResponse(Req::MSG_ID))?;
        if expected != Resp::MSG_ID {
            return Err(ClientError::UnexpectedMessage {
                expected: expected.id(),
                got: Resp::MSG_ID.id(),
            });
        }

        self.send(request).await?;
        let frame = self.next_response().await?;
        if frame.msg_id != expected.id() {
            return Err(ClientError::UnexpectedMessage {
                expected: expected.id(),
                got: frame.msg_id,
            });
        }
        Ok(decode_payload(&frame.payload)?)
    }

    pub async fn next_response(&mut self) -> Result<Frame, ClientError> {
        match tokio::time::timeout(self.timeout, self.responses.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(ClientError::Disconnected),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    pub async fn next_push(&mut self) -> Result<Frame, ClientError> {
        match tokio::time::timeout(self.timeout, self.pushes.recv()).await {
            Ok(Some(frame)) => Ok(frame),
            Ok(None) => Err(ClientError::Disconnected),
            Err(_) => Err(ClientError::Timeout),
        }
    }

    /// Skips pushes until one of type `M` arrives
    pub async fn next_push_of<M: Message>(&mut self) -> Result<M, ClientError> {
        loop {
            let frame = self.next_push().await?;
            if frame.msg_id == M::MSG_ID.id() {
                return Ok(decode_payload(&frame.payload)?);
            }
        }
    }

    /// Pushes already received and not yet consumed
    pub fn drain_pushes(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.pushes.try_recv() {
            frames.push(frame);
        }
        frames
    }

    /// Waits until the server side closes the connection
    pub async fn wait_disconnected(&mut self, within: Duration) -> bool {
        if self.reader.is_finished() {
            return true;
        }
        tokio::time::timeout(within, &mut self.reader).await.is_ok()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
