//! Session handshake
//!
//! Initiator: send `handshake`, expect `handshake_response` with
//! `ready = true` and a matching protocol version.
//! Responder: expect `handshake`, answer with `handshake_response`.
//! Both sides bound the exchange with a timeout.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use stroop_core::{DeviceId, FrameError, HandshakeError, SessionClock, SessionId};
use stroop_wire::{FrameReader, FrameWriter, Message, MessageBody, PROTOCOL_VERSION};

/// Result of a completed handshake
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandshakeInfo {
    pub session_id: SessionId,
    pub peer_device: DeviceId,
}

/// Run the initiator half of the handshake
pub async fn initiate<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    session_id: SessionId,
    device_id: DeviceId,
    clock: &SessionClock,
    timeout: Duration,
) -> Result<HandshakeInfo, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let exchange = async {
        let hello = Message::new(
            session_id,
            clock.now(),
            MessageBody::Handshake {
                device_id,
                version: PROTOCOL_VERSION,
            },
        );
        writer.write_frame(&hello.encode()?).await?;

        let reply = read_message(reader).await?;
        match reply.body {
            MessageBody::HandshakeResponse {
                device_id: peer_device,
                version,
                ready,
            } => {
                if version != PROTOCOL_VERSION {
                    return Err(HandshakeError::VersionMismatch {
                        local: PROTOCOL_VERSION,
                        remote: version,
                    });
                }
                if !ready {
                    return Err(HandshakeError::NotReady);
                }
                if reply.session_id != session_id {
                    return Err(HandshakeError::UnexpectedMessage(format!(
                        "response for session {}",
                        reply.session_id
                    )));
                }
                Ok(HandshakeInfo {
                    session_id,
                    peer_device,
                })
            }
            other => Err(HandshakeError::UnexpectedMessage(other.kind().to_string())),
        }
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))?
}

/// Run the responder half of the handshake
///
/// The session id is taken from the initiator's `handshake`. A version
/// mismatch is still answered (with `ready = false`) before failing.
pub async fn respond<R, W>(
    reader: &mut FrameReader<R>,
    writer: &mut FrameWriter<W>,
    device_id: DeviceId,
    clock: &SessionClock,
    timeout: Duration,
) -> Result<HandshakeInfo, HandshakeError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let exchange = async {
        let hello = read_message(reader).await?;
        let MessageBody::Handshake {
            device_id: peer_device,
            version,
        } = hello.body
        else {
            return Err(HandshakeError::UnexpectedMessage(hello.kind().to_string()));
        };

        let ready = version == PROTOCOL_VERSION;
        let reply = Message::new(
            hello.session_id,
            clock.now(),
            MessageBody::HandshakeResponse {
                device_id,
                version: PROTOCOL_VERSION,
                ready,
            },
        );
        writer.write_frame(&reply.encode()?).await?;

        if !ready {
            return Err(HandshakeError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: version,
            });
        }
        Ok(HandshakeInfo {
            session_id: hello.session_id,
            peer_device,
        })
    };

    tokio::time::timeout(timeout, exchange)
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))?
}

async fn read_message<R: AsyncRead + Unpin>(
    reader: &mut FrameReader<R>,
) -> Result<Message, HandshakeError> {
    let payload = reader
        .read_frame()
        .await?
        .ok_or(FrameError::ConnectionClosed)?;
    Ok(Message::decode(&payload)?)
}
