//! Framed message channel between the broker and a login helper.
//!
//! Frames are newline-delimited: the helper sends single-line JSON
//! objects, the broker sends raw payload text. The channel rides a Unix
//! socketpair; the helper side is handed out as a plain OS stream so a
//! child process can inherit it on fd 3.
//!
//! Two timeouts guard every channel: a wall-clock conversation timeout
//! from creation to close, and an inter-message idle timeout. Either
//! expiry closes the channel with a timeout reason.

use std::os::unix::net::UnixStream as StdUnixStream;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::{Duration, Instant, sleep_until, timeout};

use crate::error::{Error, Result};

/// Close reason used when either timeout expires.
pub const CLOSE_TIMEOUT: &str = "timeout";

pub enum PipeEvent {
    /// One complete frame from the helper.
    Message(Vec<u8>),
    /// Channel closed. `Some` carries the reason; `None` is an orderly EOF.
    Closed(Option<String>),
}

pub struct AuthPipe {
    id: String,
    writer: Mutex<Option<OwnedWriteHalf>>,
    events: Mutex<mpsc::Receiver<PipeEvent>>,
    closed_rx: watch::Receiver<bool>,
}

impl AuthPipe {
    /// Create the broker side of the channel. The returned stream is the
    /// helper side.
    pub fn new(
        id: String,
        conversation_timeout: Duration,
        idle_timeout: Duration,
    ) -> Result<(Self, StdUnixStream)> {
        let (ours, theirs) = StdUnixStream::pair()?;
        ours.set_nonblocking(true)?;
        let stream = UnixStream::from_std(ours)?;
        let (read_half, write_half) = stream.into_split();

        let (event_tx, event_rx) = mpsc::channel(8);
        let (closed_tx, closed_rx) = watch::channel(false);
        tokio::spawn(read_frames(
            read_half,
            event_tx,
            closed_tx,
            conversation_timeout,
            idle_timeout,
        ));

        Ok((
            Self {
                id,
                writer: Mutex::new(Some(write_half)),
                events: Mutex::new(event_rx),
                closed_rx,
            },
            theirs,
        ))
    }

    /// The conversation id this channel was tagged with at construction.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Send one frame to the helper.
    pub async fn answer(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::Internal("auth pipe already closed".into()))?;
        writer.write_all(frame).await?;
        writer.write_all(b"\n").await?;
        Ok(())
    }

    /// Await the next message or close event. The receiver is guarded so
    /// only one waiter can be outstanding at a time.
    pub async fn next_event(&self) -> PipeEvent {
        let mut events = self.events.lock().await;
        events.recv().await.unwrap_or(PipeEvent::Closed(None))
    }

    /// A receiver that flips to `true` once the channel has closed.
    pub fn closed_receiver(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }
}

async fn read_frames(
    reader: OwnedReadHalf,
    events: mpsc::Sender<PipeEvent>,
    closed: watch::Sender<bool>,
    conversation_timeout: Duration,
    idle_timeout: Duration,
) {
    let deadline = Instant::now() + conversation_timeout;
    let mut lines = BufReader::new(reader).lines();
    loop {
        let event = tokio::select! {
            _ = sleep_until(deadline) => PipeEvent::Closed(Some(CLOSE_TIMEOUT.to_string())),
            next = timeout(idle_timeout, lines.next_line()) => match next {
                Err(_) => PipeEvent::Closed(Some(CLOSE_TIMEOUT.to_string())),
                Ok(Ok(Some(line))) => PipeEvent::Message(line.into_bytes()),
                Ok(Ok(None)) => PipeEvent::Closed(None),
                Ok(Err(e)) => PipeEvent::Closed(Some(e.to_string())),
            },
        };
        let closing = matches!(event, PipeEvent::Closed(_));
        if events.send(event).await.is_err() || closing {
            break;
        }
    }
    let _ = closed.send(true);
}
