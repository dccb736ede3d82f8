//! WebSocket adapter for the signaling relay
//!
//! One JSON text message per event. The socket is switched to non-blocking
//! after the handshake so `poll_recv` never stalls the caller's loop; writes
//! that would block stay queued inside tungstenite and are flushed on the
//! next poll. Ping/pong is answered by tungstenite itself.

use super::{SignalEvent, SignalingChannel, SignalingError};
use std::io;
use std::net::TcpStream;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

type WsStream = WebSocket<MaybeTlsStream<TcpStream>>;

fn is_would_block(e: &tungstenite::Error) -> bool {
    matches!(e, tungstenite::Error::Io(io) if io.kind() == io::ErrorKind::WouldBlock)
}

fn map_ws_error(e: tungstenite::Error) -> SignalingError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            SignalingError::Closed
        }
        tungstenite::Error::Io(io) => SignalingError::Io(io),
        other => SignalingError::Io(io::Error::new(io::ErrorKind::Other, other.to_string())),
    }
}

/// Relay connection over a WebSocket
pub struct RelaySignaling {
    ws: WsStream,
    url: String,
    closed: bool,
}

impl RelaySignaling {
    /// Connect (blocking handshake), then switch to non-blocking
    pub fn connect(url: &str) -> Result<Self, SignalingError> {
        log::info!("Connecting to signaling relay at {}", url);

        let (ws, _response) =
            tungstenite::connect(url).map_err(|e| SignalingError::Connect(format!("{}: {}", url, e)))?;

        match ws.get_ref() {
            MaybeTlsStream::Plain(tcp) => {
                tcp.set_nodelay(true)?;
                tcp.set_nonblocking(true)?;
            }
            _ => {
                return Err(SignalingError::Connect(format!(
                    "{}: only ws:// relays are supported",
                    url
                )))
            }
        }

        log::info!("Connected to signaling relay");
        Ok(Self {
            ws,
            url: url.to_string(),
            closed: false,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Send a close frame; later calls fail with `Closed`
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.ws.close(None) {
            if !is_would_block(&e) {
                log::debug!("Relay close: {}", e);
            }
        }
        let _ = self.ws.flush();
    }
}

impl SignalingChannel for RelaySignaling {
    fn send(&mut self, event: SignalEvent) -> Result<(), SignalingError> {
        if self.closed {
            return Err(SignalingError::Closed);
        }
        let json = event.to_json()?;
        log::debug!("Relay <- {}", event.name());

        match self.ws.send(Message::Text(json)) {
            Ok(()) => Ok(()),
            // queued inside tungstenite, flushed on the next poll
            Err(e) if is_would_block(&e) => Ok(()),
            Err(e) => Err(map_ws_error(e)),
        }
    }

    fn poll_recv(&mut self) -> Result<Option<SignalEvent>, SignalingError> {
        if self.closed {
            return Err(SignalingError::Closed);
        }

        match self.ws.flush() {
            Ok(()) => {}
            Err(e) if is_would_block(&e) => {}
            Err(e) => return Err(map_ws_error(e)),
        }

        loop {
            let msg = match self.ws.read() {
                Ok(msg) => msg,
                Err(e) if is_would_block(&e) => return Ok(None),
                Err(e) => {
                    self.closed = true;
                    return Err(map_ws_error(e));
                }
            };

            match msg {
                Message::Text(text) => match SignalEvent::from_json(&text) {
                    Ok(event) => {
                        log::debug!("Relay -> {}", event.name());
                        return Ok(Some(event));
                    }
                    Err(e) => {
                        log::warn!("Ignoring relay message: {}", e);
                        continue;
                    }
                },
                Message::Close(frame) => {
                    log::info!("Relay closed the connection: {:?}", frame);
                    self.closed = true;
                    return Err(SignalingError::Closed);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
                Message::Binary(data) => {
                    log::warn!("Ignoring {}-byte binary relay message", data.len());
                    continue;
                }
            }
        }
    }
}

impl Drop for RelaySignaling {
    fn drop(&mut self) {
        self.close();
    }
}
