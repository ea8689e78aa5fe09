//! TCP driver for one [`BridgeSession`].
//!
//! The session is shared behind a mutex so the manager can read channel
//! mappings and issue joins while the reader task feeds it server lines.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{info, trace, warn};

use super::codec::IrcLineCodec;
use super::protocol::{IrcLine, MAX_LINE_LENGTH};
use super::session::{BridgeEvent, BridgeSession, SessionEffect};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("connection failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out connecting to {0}")]
    Timeout(String),
}

/// A running bridge connection.
pub struct BridgeClient {
    session: Arc<Mutex<BridgeSession>>,
    outbound: mpsc::UnboundedSender<String>,
    events: mpsc::UnboundedSender<BridgeEvent>,
    task: JoinHandle<()>,
}

impl BridgeClient {
    /// Connect to `addr` (host:port) and register. Events the session emits,
    /// including the final [`BridgeEvent::Closed`], go to `events`.
    pub fn spawn(
        addr: String,
        session: BridgeSession,
        events: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Self {
        let session = Arc::new(Mutex::new(session));
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let task = tokio::spawn({
            let session = session.clone();
            let events = events.clone();
            let outbound = outbound.clone();
            async move {
                let reason = match drive(&addr, &session, outbound, outbound_rx, &events).await {
                    Ok(reason) => reason,
                    Err(e) => {
                        warn!(addr, "IRC bridge failed: {}", e);
                        Some(e.to_string())
                    }
                };
                lock(&session).mark_disconnected();
                let _ = events.send(BridgeEvent::Closed { reason });
            }
        });

        Self {
            session,
            outbound,
            events,
            task,
        }
    }

    pub fn send_line(&self, line: String) {
        let _ = self.outbound.send(line);
    }

    /// Read the session.
    pub fn with_session<T>(&self, f: impl FnOnce(&BridgeSession) -> T) -> T {
        f(&lock(&self.session))
    }

    /// Mutate the session and carry out the resulting effects.
    pub fn apply(&self, f: impl FnOnce(&mut BridgeSession) -> Vec<SessionEffect>) {
        let effects = f(&mut lock(&self.session));
        dispatch(effects, &self.outbound, &self.events);
    }

    /// Send QUIT and give the server a moment before dropping the socket.
    pub fn shutdown(self, message: Option<&str>) {
        let quit = match message {
            Some(message) => format!("QUIT :{}", super::protocol::sanitize(message)),
            None => "QUIT".to_string(),
        };
        let _ = self.outbound.send(quit);
        let task = self.task;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            task.abort();
        });
    }
}

fn lock(session: &Mutex<BridgeSession>) -> std::sync::MutexGuard<'_, BridgeSession> {
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

fn dispatch(
    effects: Vec<SessionEffect>,
    outbound: &mpsc::UnboundedSender<String>,
    events: &mpsc::UnboundedSender<BridgeEvent>,
) {
    for effect in effects {
        match effect {
            SessionEffect::Send(line) => {
                let _ = outbound.send(line);
            }
            SessionEffect::Emit(event) => {
                let _ = events.send(event);
            }
        }
    }
}

async fn drive(
    addr: &str,
    session: &Mutex<BridgeSession>,
    outbound: mpsc::UnboundedSender<String>,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<BridgeEvent>,
) -> Result<Option<String>, BridgeError> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr))
        .await
        .map_err(|_| BridgeError::Timeout(addr.to_string()))??;
    stream.set_nodelay(true)?;
    info!(addr, "IRC bridge connected");

    let (reader, mut writer) = stream.into_split();

    // Writer task: drains outbound lines to the socket
    let write_handle = tokio::spawn(async move {
        while let Some(line) = outbound_rx.recv().await {
            trace!(line, "IRC >>");
            if writer.write_all(format!("{}\r\n", line).as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let start = lock(session).start();
    dispatch(start, &outbound, events);

    let mut lines = FramedRead::new(reader, IrcLineCodec::new(MAX_LINE_LENGTH));
    let result = loop {
        let raw = match lines.next().await {
            Some(Ok(raw)) => raw,
            Some(Err(e)) => break Err(e.into()),
            None => break Ok(None),
        };
        trace!(line = %raw, "IRC <<");
        let Some(line) = IrcLine::parse(&raw) else {
            continue;
        };
        if line.command == "ERROR" {
            break Ok(line.last_param().map(String::from));
        }
        let effects = lock(session).handle_line(&line);
        dispatch(effects, &outbound, events);
    };

    write_handle.abort();
    result
}
