use std::io;
use std::net::TcpStream;
use std::time::Duration;

use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{connect as websocket_connect, Message as WsMessage, WebSocket};

use crate::config::{stream_url, EngineConfig};
use crate::error::GenerationError;

/// One inbound unit from the event stream, already classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamFrame {
    Text(String),
    /// Raw image frames from legacy preview paths; only the length is kept.
    Binary(usize),
    /// Nothing arrived within the poll interval.
    Idle,
    Closed { clean: bool, reason: String },
}

pub trait EventStream: Send {
    /// `Err` only for transport failures that are not a close.
    fn next_frame(&mut self) -> Result<StreamFrame, GenerationError>;
    fn close(&mut self);
}

pub trait StreamConnector: Send + Sync {
    fn connect(&self, client_id: &str) -> Result<Box<dyn EventStream>, GenerationError>;
}

#[derive(Debug, Clone)]
pub struct WsConnector {
    base_url: String,
    poll: Duration,
}

impl WsConnector {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            base_url: config.base_url.clone(),
            poll: config.stream_poll,
        }
    }
}

impl StreamConnector for WsConnector {
    fn connect(&self, client_id: &str) -> Result<Box<dyn EventStream>, GenerationError> {
        let url = stream_url(&self.base_url, client_id);
        let (mut ws, _) = websocket_connect(url.as_str()).map_err(|err| GenerationError::Stream {
            message: format!("failed to connect event stream ({url}): {err}"),
        })?;
        set_socket_read_timeout(&mut ws, Some(self.poll));
        Ok(Box::new(WsEventStream { ws, closed: false }))
    }
}

struct WsEventStream {
    ws: WebSocket<MaybeTlsStream<TcpStream>>,
    closed: bool,
}

impl EventStream for WsEventStream {
    fn next_frame(&mut self) -> Result<StreamFrame, GenerationError> {
        if self.closed {
            return Ok(StreamFrame::Closed {
                clean: true,
                reason: "closed locally".to_string(),
            });
        }
        let message = match self.ws.read() {
            Ok(message) => message,
            Err(tungstenite::Error::Io(err))
                if matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                return Ok(StreamFrame::Idle);
            }
            Err(tungstenite::Error::Io(err)) if is_abrupt_close(err.kind()) => {
                self.closed = true;
                return Ok(StreamFrame::Closed {
                    clean: false,
                    reason: err.to_string(),
                });
            }
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => {
                self.closed = true;
                return Ok(StreamFrame::Closed {
                    clean: false,
                    reason: "connection closed".to_string(),
                });
            }
            Err(tungstenite::Error::Protocol(err)) => {
                self.closed = true;
                return Ok(StreamFrame::Closed {
                    clean: false,
                    reason: err.to_string(),
                });
            }
            Err(err) => {
                return Err(GenerationError::Stream {
                    message: format!("event stream read failed: {err}"),
                })
            }
        };

        let frame = match message {
            WsMessage::Text(text) => StreamFrame::Text(text.to_string()),
            WsMessage::Binary(bytes) => StreamFrame::Binary(bytes.len()),
            WsMessage::Close(frame) => {
                self.closed = true;
                let (clean, reason) = match frame {
                    Some(frame) => (
                        frame.code == CloseCode::Normal,
                        format!("{} {}", u16::from(frame.code), frame.reason.as_str())
                            .trim()
                            .to_string(),
                    ),
                    None => (false, "no close frame".to_string()),
                };
                StreamFrame::Closed { clean, reason }
            }
            _ => StreamFrame::Idle,
        };
        Ok(frame)
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.ws.close(None);
        let _ = self.ws.flush();
    }
}

fn is_abrupt_close(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::NotConnected
    )
}

fn set_socket_read_timeout(ws: &mut WebSocket<MaybeTlsStream<TcpStream>>, timeout: Option<Duration>) {
    match ws.get_mut() {
        MaybeTlsStream::Plain(stream) => {
            let _ = stream.set_read_timeout(timeout);
        }
        MaybeTlsStream::Rustls(stream) => {
            let _ = stream.get_mut().set_read_timeout(timeout);
        }
        _ => {}
    }
}
