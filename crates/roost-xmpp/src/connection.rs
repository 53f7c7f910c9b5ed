//! Connection actor for handling individual XMPP client connections.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

use crate::error::stream_errors;
use crate::extensions::{ExtensionPipeline, SessionContext};
use crate::keepalive::{is_whitespace_ping, KeepaliveConfig};
use crate::metrics;
use crate::parser::Frame;
use crate::registry::{AccountManager, DisconnectEvent, DisconnectReason, Outbound, RegistryBus};
use crate::stanza::Stanza;
use crate::state::{self, BoundSession, Handshake, State};
use crate::stream::{StreamReader, StreamWriter, Transport, XmppStream};
use crate::xep::xep0199;
use crate::XmppError;

/// Everything a session needs from the server, shared by all connections.
#[derive(Clone)]
pub struct SessionServices {
    pub accounts: Arc<AccountManager>,
    pub bus: RegistryBus,
    pub extensions: ExtensionPipeline,
    pub tls_acceptor: Option<TlsAcceptor>,
    pub tls_required: bool,
    pub keepalive: KeepaliveConfig,
    pub shutdown: CancellationToken,
}

/// What the client is sent when the Normal state ends.
enum Farewell {
    /// `</stream:stream>`
    Close,
    /// `<stream:error/>` with this condition
    StreamError(&'static str),
    /// Nothing; the transport is just shut down
    Drop,
}

/// How the Normal state ended.
struct SessionExit {
    reason: DisconnectReason,
    farewell: Farewell,
}

impl SessionExit {
    fn new(reason: DisconnectReason, farewell: Farewell) -> Self {
        Self { reason, farewell }
    }
}

/// Actor managing a single XMPP client connection.
pub struct ConnectionActor<S> {
    stream: XmppStream<S>,
    services: SessionServices,
    handshake: Handshake,
}

impl<S: Transport> ConnectionActor<S> {
    /// Handle a new incoming connection.
    #[instrument(
        name = "xmpp.connection.handle",
        skip(io, services),
        fields(peer = %peer_addr)
    )]
    pub async fn handle_connection(
        io: S,
        peer_addr: SocketAddr,
        services: SessionServices,
    ) -> Result<(), XmppError> {
        info!("New connection from {}", peer_addr);

        let domain = services.accounts.config().domain.clone();
        let actor = Self {
            stream: XmppStream::new(io, domain),
            services,
            handshake: Handshake::default(),
        };

        actor.run().await
    }

    /// Walk the state table, then run the Normal state.
    async fn run(mut self) -> Result<(), XmppError> {
        for &state in state::state_table(self.services.tls_required) {
            if state == State::Normal {
                break;
            }
            let step = tokio::select! {
                _ = self.services.shutdown.cancelled() => Err(XmppError::StreamClosed),
                step = state::dispatch(state, &mut self.stream, &self.services, &mut self.handshake) => step,
            };
            if let Err(e) = step {
                self.abort_handshake(state, &e).await;
                return Err(e);
            }
        }

        let bound = self
            .handshake
            .bound
            .take()
            .ok_or_else(|| XmppError::internal("handshake ended without a bound session"))?;
        info!(jid = %bound.jid, "Session established");

        let services = self.services.clone();
        let jid = bound.jid.clone();
        let local_part = bound.local_part.clone();
        let session_id = bound.mailbox.session_id();

        let reason = run_normal(self.stream, &services, bound).await;
        info!(jid = %jid, reason = %reason, "Connection closed");

        services.bus.disconnect(DisconnectEvent {
            jid,
            local_part,
            session_id,
            reason,
        });
        Ok(())
    }

    async fn abort_handshake(&mut self, state: State, error: &XmppError) {
        match error {
            XmppError::StreamClosed => debug!(state = %state, "Client left during handshake"),
            XmppError::AuthFailed(_) | XmppError::MalformedAuth(_) => {
                info!(state = %state, error = %error, "Authentication rejected")
            }
            _ => warn!(state = %state, error = %error, "Handshake failed"),
        }

        match error.stream_condition() {
            Some(condition) => self.stream.send_stream_error(condition).await,
            None => {
                let _ = self.stream.close().await;
            }
        }
    }
}

/// Normal state: a reader task decodes and dispatches while this task
/// drains the session mailbox into the stream.
async fn run_normal<S: Transport>(
    stream: XmppStream<S>,
    services: &SessionServices,
    bound: BoundSession,
) -> DisconnectReason {
    let BoundSession {
        jid,
        local_part,
        mailbox,
        mut receiver,
    } = bound;

    let (reader, mut writer) = stream.into_split();
    let (pong_tx, mut pong_rx) = mpsc::unbounded_channel();
    let (exit_tx, mut exit_rx) = oneshot::channel();

    let session = SessionContext {
        jid,
        local_part,
        mailbox,
    };
    let reader_task = tokio::spawn(read_loop(
        reader,
        session,
        services.extensions.clone(),
        pong_tx,
        exit_tx,
    ));

    let exit = loop {
        tokio::select! {
            biased;

            exit = &mut exit_rx => {
                break exit.unwrap_or_else(|_| SessionExit::new(
                    DisconnectReason::ReadError("reader task ended".to_string()),
                    Farewell::Drop,
                ));
            }

            Some(pong) = pong_rx.recv() => {
                if let Err(e) = writer.send_raw(&pong).await {
                    break write_failed(e);
                }
            }

            item = receiver.recv() => {
                let Some(item) = item else {
                    break SessionExit::new(DisconnectReason::StreamClosed, Farewell::Close);
                };
                if let Err(e) = write_outbound(&mut writer, item).await {
                    break write_failed(e);
                }
            }

            _ = services.shutdown.cancelled() => {
                break SessionExit::new(
                    DisconnectReason::Shutdown,
                    Farewell::StreamError(stream_errors::SYSTEM_SHUTDOWN),
                );
            }
        }
    };

    reader_task.abort();
    match exit.farewell {
        Farewell::Close => writer.close().await,
        Farewell::StreamError(condition) => writer.send_stream_error(condition).await,
        Farewell::Drop => writer.shutdown().await,
    }
    exit.reason
}

fn write_failed(e: XmppError) -> SessionExit {
    SessionExit::new(DisconnectReason::WriteError(e.to_string()), Farewell::Drop)
}

async fn write_outbound<S: Transport>(
    writer: &mut StreamWriter<S>,
    item: Outbound,
) -> Result<(), XmppError> {
    match item {
        Outbound::Stanza(stanza) => {
            metrics::record_stanza(stanza.name(), "outbound");
            writer.send_stanza(&stanza).await
        }
        Outbound::Raw(xml) => writer.send_raw(&xml).await,
    }
}

/// Decode and dispatch until the stream ends.
async fn read_loop<S: Transport>(
    mut reader: StreamReader<S>,
    session: SessionContext,
    extensions: ExtensionPipeline,
    pongs: mpsc::UnboundedSender<String>,
    exit: oneshot::Sender<SessionExit>,
) {
    let result = loop {
        let frame = match reader.next_start_tag_or_text().await {
            Ok(frame) => frame,
            Err(e) => break reader_exit(e),
        };

        match frame {
            Frame::Text(text) => {
                if is_whitespace_ping(&text) {
                    trace!(jid = %session.jid, "Whitespace ping");
                    reader.refresh_deadline();
                }
            }
            Frame::StreamClose => {
                debug!(jid = %session.jid, "Client closed stream");
                break SessionExit::new(DisconnectReason::StreamClosed, Farewell::Close);
            }
            Frame::StreamOpen(_) => {
                break SessionExit::new(
                    DisconnectReason::ReadError("unexpected stream header".to_string()),
                    Farewell::StreamError(stream_errors::POLICY_VIOLATION),
                );
            }
            Frame::Element(element) => {
                let stanza = match Stanza::decode(element) {
                    Ok(stanza) => stanza,
                    Err(e) => {
                        warn!(jid = %session.jid, error = %e, "Skipping undecodable stanza");
                        continue;
                    }
                };
                metrics::record_stanza(stanza.name(), "inbound");

                if let Stanza::Iq(iq) = &stanza {
                    if xep0199::is_ping(iq) {
                        reader.refresh_deadline();
                    }
                    if xep0199::is_fast_path_ping(iq) {
                        trace!(jid = %session.jid, "Answering ping");
                        let _ = pongs.send(xep0199::build_ping_result(iq));
                    }
                }

                extensions.dispatch(&stanza, &session);
            }
        }
    };

    let _ = exit.send(result);
}

fn reader_exit(error: XmppError) -> SessionExit {
    match error {
        XmppError::StreamClosed => SessionExit::new(DisconnectReason::StreamClosed, Farewell::Drop),
        XmppError::Timeout => SessionExit::new(DisconnectReason::Timeout, Farewell::Drop),
        other => {
            let farewell = match other.stream_condition() {
                Some(condition) => Farewell::StreamError(condition),
                None => Farewell::Drop,
            };
            SessionExit::new(DisconnectReason::ReadError(other.to_string()), farewell)
        }
    }
}
