use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message, error::ProtocolError},
};
use url::Url;

use super::{ChannelEvent, ChannelEvents, ChannelLink, Connector};

/// Signaling channels over WebSocket text frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Connector for WebSocketConnector {
    fn connect(&self, endpoint: &Url, events: ChannelEvents) -> ChannelLink {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_connection(endpoint.clone(), events, outbound_rx));
        ChannelLink::new(outbound_tx)
    }
}

async fn run_connection(
    endpoint: Url,
    events: ChannelEvents,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let slot = events.slot();
    let generation = events.generation();

    let stream = tokio::select! {
        result = connect_async(endpoint.as_str()) => match result {
            Ok((stream, _)) => stream,
            Err(err) => {
                tracing::warn!(
                    target: "beach_cams::transport",
                    %slot,
                    generation,
                    url = %endpoint,
                    error = %err,
                    "signaling websocket connect failed"
                );
                events.emit(ChannelEvent::Errored(format!("websocket connect failed: {err}")));
                return;
            }
        },
        None = outbound.recv() => {
            tracing::debug!(
                target: "beach_cams::transport",
                %slot,
                generation,
                "channel discarded before connect completed"
            );
            return;
        }
    };
    tracing::debug!(
        target: "beach_cams::transport",
        %slot,
        generation,
        url = %endpoint,
        "signaling websocket connected"
    );
    if !events.emit(ChannelEvent::Opened) {
        return;
    }

    let (mut ws_write, mut ws_read) = stream.split();
    loop {
        tokio::select! {
            outgoing = outbound.recv() => match outgoing {
                Some(text) => {
                    if let Err(err) = ws_write.send(Message::Text(text)).await {
                        events.emit(ChannelEvent::Errored(format!("websocket send failed: {err}")));
                        return;
                    }
                }
                None => {
                    // Owner dropped the channel; close politely and stop reporting.
                    let _ = ws_write.close().await;
                    tracing::debug!(
                        target: "beach_cams::transport",
                        %slot,
                        generation,
                        "signaling websocket released"
                    );
                    return;
                }
            },
            incoming = ws_read.next() => {
                let event = match incoming {
                    Some(Ok(Message::Text(text))) => {
                        tracing::trace!(
                            target: "beach_cams::transport",
                            %slot,
                            event = "ws_in",
                            kind = "text",
                            len = text.len()
                        );
                        ChannelEvent::Message(text)
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => ChannelEvent::Message(text),
                        Err(_) => {
                            tracing::warn!(
                                target: "beach_cams::transport",
                                %slot,
                                "ignoring non-utf8 binary frame"
                            );
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => ChannelEvent::Closed,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => match &err {
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => {
                            tracing::debug!(
                                target: "beach_cams::transport",
                                %slot,
                                "signaling websocket closed: {err}"
                            );
                            ChannelEvent::Closed
                        }
                        _ => {
                            tracing::warn!(
                                target: "beach_cams::transport",
                                %slot,
                                "signaling websocket error: {err}"
                            );
                            ChannelEvent::Errored(err.to_string())
                        }
                    },
                };
                let terminal = matches!(event, ChannelEvent::Closed | ChannelEvent::Errored(_));
                if !events.emit(event) || terminal {
                    return;
                }
            }
        }
    }
}
