//! One live connection
//!
//! A link runs three tasks in a `JoinSet`: reader, writer and heartbeat.
//! The first one to exit stops the others. The writer hands the persistent
//! outbound queue back, together with any message it had dequeued but not
//! finished writing, so the next link can pick up where this one stopped.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use stroop_core::{CodecError, FrameError, SessionClock, SessionId};
use stroop_wire::{ErrorCode, FrameReader, FrameWriter, Message, MessageBody};

/// Capacity of the per-link control queue (heartbeats, error replies)
const CONTROL_CAPACITY: usize = 8;

/// Heartbeat timing
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkConfig {
    pub heartbeat_interval: Duration,
    /// Intervals without inbound traffic before the link is declared dead
    pub missed_heartbeats: u32,
}

impl LinkConfig {
    pub fn silence_timeout(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats.max(1)
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            heartbeat_interval: Duration::from_secs(5),
            missed_heartbeats: 3,
        }
    }
}

/// Why a link ended
#[derive(Error, Debug)]
pub enum LinkClosed {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("no inbound traffic for {0:?}")]
    Silent(Duration),

    #[error("read failed: {0}")]
    Read(FrameError),

    #[error("write failed: {0}")]
    Write(FrameError),

    #[error("outbound queue closed")]
    OutboundClosed,

    #[error("shutdown requested")]
    Shutdown,

    #[error("link task failed: {0}")]
    Task(String),
}

/// What is left of a link once it has stopped
#[derive(Debug)]
pub struct LinkEnd {
    pub reason: LinkClosed,
    /// `None` only if the writer task panicked
    pub outbound: Option<mpsc::Receiver<Message>>,
    /// Dequeued but not completely written; send first next time
    pub unsent: Option<Message>,
}

enum TaskExit {
    /// `None` when stopped by a sibling
    Reader(Option<LinkClosed>),
    Writer {
        reason: Option<LinkClosed>,
        outbound: mpsc::Receiver<Message>,
        unsent: Option<Message>,
    },
    Heartbeat,
}

/// An established, handshaken connection
pub struct Link<R, W> {
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    session_id: SessionId,
    clock: SessionClock,
    config: LinkConfig,
}

impl<R, W> Link<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        reader: FrameReader<R>,
        writer: FrameWriter<W>,
        session_id: SessionId,
        clock: SessionClock,
        config: LinkConfig,
    ) -> Self {
        Link {
            reader,
            writer,
            session_id,
            clock,
            config,
        }
    }

    /// Run until the connection fails or `shutdown` flips
    pub async fn run(
        self,
        outbound: mpsc::Receiver<Message>,
        unsent: Option<Message>,
        inbound: mpsc::Sender<Message>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> LinkEnd {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (control_tx, control_rx) = mpsc::channel(CONTROL_CAPACITY);

        let mut tasks = JoinSet::new();
        tasks.spawn(read_loop(
            self.reader,
            inbound,
            control_tx.clone(),
            self.session_id,
            self.clock,
            self.config.silence_timeout(),
            stop_rx.clone(),
        ));
        tasks.spawn(write_loop(self.writer, outbound, unsent, control_rx, stop_rx.clone()));
        tasks.spawn(heartbeat_loop(
            control_tx,
            self.session_id,
            self.clock,
            self.config.heartbeat_interval,
            stop_rx,
        ));

        let mut end = LinkEnd {
            reason: LinkClosed::Shutdown,
            outbound: None,
            unsent: None,
        };
        let mut reason = None;

        tokio::select! {
            biased;
            _ = shutdown.changed() => reason = Some(LinkClosed::Shutdown),
            Some(joined) = tasks.join_next() => absorb(joined, &mut reason, &mut end),
        }

        stop_tx.send_replace(true);
        while let Some(joined) = tasks.join_next().await {
            absorb(joined, &mut reason, &mut end);
        }

        if let Some(reason) = reason {
            end.reason = reason;
        }
        end
    }
}

fn absorb(
    joined: Result<TaskExit, JoinError>,
    reason: &mut Option<LinkClosed>,
    end: &mut LinkEnd,
) {
    match joined {
        Ok(TaskExit::Reader(closed)) => {
            if reason.is_none() {
                *reason = closed;
            }
        }
        Ok(TaskExit::Writer {
            reason: closed,
            outbound,
            unsent,
        }) => {
            end.outbound = Some(outbound);
            end.unsent = unsent;
            if reason.is_none() {
                *reason = closed;
            }
        }
        Ok(TaskExit::Heartbeat) => {}
        Err(e) => {
            warn!("Link task failed: {}", e);
            if reason.is_none() {
                *reason = Some(LinkClosed::Task(e.to_string()));
            }
        }
    }
}

async fn read_loop<R: AsyncRead + Unpin>(
    mut reader: FrameReader<R>,
    inbound: mpsc::Sender<Message>,
    control: mpsc::Sender<Message>,
    session_id: SessionId,
    clock: SessionClock,
    silence: Duration,
    mut stop: watch::Receiver<bool>,
) -> TaskExit {
    loop {
        let frame = tokio::select! {
            biased;
            _ = stop.changed() => return TaskExit::Reader(None),
            frame = tokio::time::timeout(silence, reader.read_frame()) => frame,
        };

        let payload = match frame {
            Err(_) => return TaskExit::Reader(Some(LinkClosed::Silent(silence))),
            Ok(Ok(Some(payload))) => payload,
            Ok(Ok(None)) => return TaskExit::Reader(Some(LinkClosed::PeerClosed)),
            Ok(Err(e)) => return TaskExit::Reader(Some(LinkClosed::Read(e))),
        };

        match Message::decode(&payload) {
            Ok(message) if message.session_id != session_id => {
                warn!(
                    session_id = %session_id,
                    received = %message.session_id,
                    kind = %message.kind(),
                    "Ignoring message for another session"
                );
            }
            Ok(Message {
                body: MessageBody::Heartbeat,
                ..
            }) => trace!("Heartbeat received"),
            Ok(message) => {
                tokio::select! {
                    biased;
                    _ = stop.changed() => return TaskExit::Reader(None),
                    sent = inbound.send(message) => {
                        if sent.is_err() {
                            debug!("Inbound receiver dropped; message discarded");
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Rejecting inbound message");
                let code = match e {
                    CodecError::UnknownKind(_) => ErrorCode::UnknownKind,
                    _ => ErrorCode::Malformed,
                };
                let reply = Message::new(
                    session_id,
                    clock.now(),
                    MessageBody::Error {
                        code,
                        message: e.to_string(),
                    },
                );
                if control.try_send(reply).is_err() {
                    debug!("Control queue full; error reply dropped");
                }
            }
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut outbound: mpsc::Receiver<Message>,
    unsent: Option<Message>,
    mut control: mpsc::Receiver<Message>,
    mut stop: watch::Receiver<bool>,
) -> TaskExit {
    let mut pending = unsent;
    loop {
        // `queued` marks messages owned by the outbound queue; control
        // traffic is per-link and never handed back
        let (message, queued) = match pending.take() {
            Some(message) => (message, true),
            None => tokio::select! {
                biased;
                _ = stop.changed() => return writer_exit(outbound, None, None),
                Some(message) = control.recv() => (message, false),
                message = outbound.recv() => match message {
                    Some(message) => (message, true),
                    None => return writer_exit(outbound, None, Some(LinkClosed::OutboundClosed)),
                },
            },
        };

        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(kind = %message.kind(), error = %e, "Dropping unencodable message");
                continue;
            }
        };

        let written = tokio::select! {
            biased;
            _ = stop.changed() => None,
            result = writer.write_frame(&payload) => Some(result),
        };

        match written {
            Some(Ok(len)) => trace!(kind = %message.kind(), len, "Message written"),
            Some(Err(e)) => {
                let unsent = queued.then_some(message);
                return writer_exit(outbound, unsent, Some(LinkClosed::Write(e)));
            }
            None => return writer_exit(outbound, queued.then_some(message), None),
        }
    }
}

fn writer_exit(
    outbound: mpsc::Receiver<Message>,
    unsent: Option<Message>,
    reason: Option<LinkClosed>,
) -> TaskExit {
    TaskExit::Writer {
        reason,
        outbound,
        unsent,
    }
}

async fn heartbeat_loop(
    control: mpsc::Sender<Message>,
    session_id: SessionId,
    clock: SessionClock,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) -> TaskExit {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // The handshake just happened; first beat is due one period later
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = stop.changed() => return TaskExit::Heartbeat,
            _ = ticker.tick() => {}
        }

        let beat = Message::new(session_id, clock.now(), MessageBody::Heartbeat);
        match control.try_send(beat) {
            Ok(()) => trace!("Heartbeat queued"),
            Err(TrySendError::Full(_)) => debug!("Heartbeat skipped; writer busy"),
            Err(TrySendError::Closed(_)) => return TaskExit::Heartbeat,
        }
    }
}
