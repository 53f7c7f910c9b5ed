//! Framed XML stream over a client connection.
//!
//! `XmppStream` owns the transport during the handshake: it reads frames,
//! decodes them through the stanza registry, writes the hand-built
//! negotiation fragments and performs the STARTTLS upgrade. Once the session
//! is bound it splits into a [`StreamReader`] owned by the reader task and a
//! [`StreamWriter`] owned by the mailbox loop, so exactly one task reads and
//! one task writes.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, instrument};

use crate::error::generate_stream_error;
use crate::keepalive::IdleDeadline;
use crate::parser::{escape, ns, Frame, StreamHeader, XmlParser};
use crate::stanza::Stanza;
use crate::XmppError;

const READ_CHUNK: usize = 4096;

/// Byte streams a session can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + 'static> Transport for T {}

/// The raw transport, before or after the TLS upgrade.
enum StreamInner<S> {
    None,
    Plain(S),
    Tls(Box<TlsStream<S>>),
}

fn not_connected() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "stream not initialized")
}

impl<S: Transport> AsyncRead for StreamInner<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamInner::None => Poll::Ready(Err(not_connected())),
            StreamInner::Plain(s) => Pin::new(s).poll_read(cx, buf),
            StreamInner::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl<S: Transport> AsyncWrite for StreamInner<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            StreamInner::None => Poll::Ready(Err(not_connected())),
            StreamInner::Plain(s) => Pin::new(s).poll_write(cx, buf),
            StreamInner::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamInner::None => Poll::Ready(Err(not_connected())),
            StreamInner::Plain(s) => Pin::new(s).poll_flush(cx),
            StreamInner::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            StreamInner::None => Poll::Ready(Ok(())),
            StreamInner::Plain(s) => Pin::new(s).poll_shutdown(cx),
            StreamInner::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Read until the parser yields a frame, honouring the idle deadline.
async fn read_frame<R: AsyncRead + Unpin>(
    io: &mut R,
    parser: &mut XmlParser,
    deadline: Option<&IdleDeadline>,
) -> Result<Frame, XmppError> {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        if let Some(frame) = parser.next_frame()? {
            return Ok(frame);
        }

        let n = match deadline {
            Some(d) => tokio::time::timeout_at(d.deadline(), io.read(&mut buf))
                .await
                .map_err(|_| XmppError::Timeout)??,
            None => io.read(&mut buf).await?,
        };
        if n == 0 {
            return Err(XmppError::StreamClosed);
        }
        parser.feed(&buf[..n]);
    }
}

async fn write_text<W: AsyncWrite + Unpin>(io: &mut W, text: &str) -> Result<(), XmppError> {
    io.write_all(text.as_bytes()).await?;
    io.flush().await?;
    Ok(())
}

/// XMPP stream handler for the handshake phase.
pub struct XmppStream<S> {
    inner: StreamInner<S>,
    parser: XmlParser,
    domain: String,
    stream_id: String,
    client_header: Option<StreamHeader>,
    deadline: Option<IdleDeadline>,
}

impl<S: Transport> XmppStream<S> {
    /// Wrap an accepted connection.
    pub fn new(io: S, domain: impl Into<String>) -> Self {
        Self {
            inner: StreamInner::Plain(io),
            parser: XmlParser::new(),
            domain: domain.into(),
            stream_id: new_stream_id(),
            client_header: None,
            deadline: None,
        }
    }

    /// Whether the transport has been upgraded to TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self.inner, StreamInner::Tls(_))
    }

    /// Server domain.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Current stream ID.
    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The most recent client stream header.
    pub fn client_header(&self) -> Option<&StreamHeader> {
        self.client_header.as_ref()
    }

    /// Arm (or clear) the idle-read deadline.
    pub fn set_idle_deadline(&mut self, deadline: Option<IdleDeadline>) {
        self.deadline = deadline;
    }

    /// Next frame of any kind, including character data.
    pub async fn next_start_tag_or_text(&mut self) -> Result<Frame, XmppError> {
        read_frame(&mut self.inner, &mut self.parser, self.deadline.as_ref()).await
    }

    /// Next stream header or element, skipping character data.
    pub async fn next_start_tag(&mut self) -> Result<Frame, XmppError> {
        loop {
            match self.next_start_tag_or_text().await? {
                Frame::Text(_) => continue,
                Frame::StreamClose => return Err(XmppError::StreamClosed),
                frame => return Ok(frame),
            }
        }
    }

    /// Read the next element and decode it through the registry.
    pub async fn read_stanza(&mut self) -> Result<Stanza, XmppError> {
        match self.next_start_tag().await? {
            Frame::Element(element) => Stanza::decode(element),
            _ => Err(XmppError::stream("unexpected stream header")),
        }
    }

    /// Read the client's opening stream tag.
    #[instrument(skip(self), name = "xmpp.stream.read_header")]
    pub async fn read_stream_header(&mut self) -> Result<StreamHeader, XmppError> {
        let header = match self.next_start_tag().await? {
            Frame::StreamOpen(header) => header,
            _ => return Err(XmppError::stream("expected stream header")),
        };
        header.validate()?;

        debug!(
            to = ?header.to,
            version = ?header.version,
            "Received stream header"
        );

        self.client_header = Some(header.clone());
        Ok(header)
    }

    /// Send the server's stream header with a fresh stream ID.
    pub async fn send_stream_header(&mut self) -> Result<(), XmppError> {
        self.stream_id = new_stream_id();
        let response = format!(
            "<?xml version='1.0'?>\
            <stream:stream xmlns='{}' \
            xmlns:stream='{}' \
            id='{}' from='{}' version='1.0'>",
            ns::JABBER_CLIENT,
            ns::STREAM,
            self.stream_id,
            escape(&self.domain)
        );
        self.send_raw(&response).await?;

        debug!(stream_id = %self.stream_id, "Sent stream header");
        Ok(())
    }

    /// Send stream features requiring STARTTLS.
    #[instrument(skip(self), name = "xmpp.stream.send_features_starttls")]
    pub async fn send_features_starttls(&mut self) -> Result<(), XmppError> {
        let features = format!(
            "<stream:features><starttls xmlns='{}'><required/></starttls></stream:features>",
            ns::TLS
        );
        self.send_raw(&features).await
    }

    /// Send stream features advertising SASL PLAIN.
    #[instrument(skip(self), name = "xmpp.stream.send_features_sasl")]
    pub async fn send_features_sasl(&mut self) -> Result<(), XmppError> {
        let features = format!(
            "<stream:features><mechanisms xmlns='{}'><mechanism>PLAIN</mechanism></mechanisms></stream:features>",
            ns::SASL
        );
        self.send_raw(&features).await
    }

    /// Answer a STARTTLS request and upgrade the transport.
    #[instrument(skip(self, tls_acceptor), name = "xmpp.stream.starttls")]
    pub async fn upgrade_tls(&mut self, tls_acceptor: &TlsAcceptor) -> Result<(), XmppError> {
        let proceed = format!("<proceed xmlns='{}'/>", ns::TLS);
        self.send_raw(&proceed).await?;

        let io = match std::mem::replace(&mut self.inner, StreamInner::None) {
            StreamInner::Plain(io) => io,
            StreamInner::Tls(tls) => {
                self.inner = StreamInner::Tls(tls);
                return Err(XmppError::stream("Already using TLS"));
            }
            StreamInner::None => return Err(XmppError::internal("Stream not initialized")),
        };

        // Plaintext that arrived after <starttls/> must not leak into the TLS stream.
        self.parser.reset();

        let tls = tls_acceptor.accept(io).await?;
        self.inner = StreamInner::Tls(Box::new(tls));

        debug!("TLS handshake complete");
        Ok(())
    }

    /// Send `<success/>` and expect a stream restart.
    pub async fn send_sasl_success(&mut self) -> Result<(), XmppError> {
        self.parser.reset();
        let success = format!("<success xmlns='{}'/>", ns::SASL);
        self.send_raw(&success).await
    }

    /// Send the SASL not-authorized failure.
    pub async fn send_sasl_failure(&mut self) -> Result<(), XmppError> {
        let failure = format!("<failure xmlns='{}'><not-authorized/></failure>", ns::SASL);
        self.send_raw(&failure).await
    }

    /// Send stream features for resource binding.
    #[instrument(skip(self), name = "xmpp.stream.send_features_bind")]
    pub async fn send_features_bind(&mut self) -> Result<(), XmppError> {
        let features = format!(
            "<stream:features>\
                <bind xmlns='{}'/>\
                <keepalive xmlns='{}'><interval min='30' max='300'/></keepalive>\
            </stream:features>",
            ns::BIND,
            ns::KEEPALIVE
        );
        self.send_raw(&features).await
    }

    /// Reply to a bind request with the bound JID.
    pub async fn send_bind_result(&mut self, id: &str, jid: &str) -> Result<(), XmppError> {
        let result = format!(
            "<iq id='{}' type='result'><bind xmlns='{}'><jid>{}</jid></bind></iq>",
            escape(id),
            ns::BIND,
            escape(jid)
        );
        self.send_raw(&result).await
    }

    /// Marshal and write a stanza.
    pub async fn send_stanza(&mut self, stanza: &Stanza) -> Result<(), XmppError> {
        let xml = stanza.to_xml()?;
        self.send_raw(&xml).await
    }

    /// Write literal text.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), XmppError> {
        write_text(&mut self.inner, text).await
    }

    /// Send a stream error, which also closes the stream, and shut the transport down.
    pub async fn send_stream_error(&mut self, condition: &str) {
        let _ = write_text(&mut self.inner, &generate_stream_error(condition)).await;
        let _ = self.inner.shutdown().await;
    }

    /// Close the stream and the transport.
    pub async fn close(&mut self) -> Result<(), XmppError> {
        let _ = write_text(&mut self.inner, "</stream:stream>").await;
        self.inner.shutdown().await?;
        Ok(())
    }

    /// Split into independent reader and writer halves.
    pub fn into_split(self) -> (StreamReader<S>, StreamWriter<S>) {
        let (read, write) = tokio::io::split(self.inner);
        (
            StreamReader {
                read,
                parser: self.parser,
                deadline: self.deadline,
            },
            StreamWriter { write },
        )
    }
}

/// Read half used by the Normal-state reader task.
pub struct StreamReader<S> {
    read: ReadHalf<StreamInner<S>>,
    parser: XmlParser,
    deadline: Option<IdleDeadline>,
}

impl<S: Transport> StreamReader<S> {
    /// Next frame of any kind, including character data.
    pub async fn next_start_tag_or_text(&mut self) -> Result<Frame, XmppError> {
        read_frame(&mut self.read, &mut self.parser, self.deadline.as_ref()).await
    }

    /// Push the idle deadline out by one window.
    pub fn refresh_deadline(&mut self) {
        if let Some(deadline) = self.deadline.as_mut() {
            deadline.refresh();
        }
    }

    /// Whether an idle deadline is armed.
    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }
}

/// Write half used by the Normal-state mailbox loop.
pub struct StreamWriter<S> {
    write: WriteHalf<StreamInner<S>>,
}

impl<S: Transport> StreamWriter<S> {
    /// Marshal and write a stanza.
    pub async fn send_stanza(&mut self, stanza: &Stanza) -> Result<(), XmppError> {
        let xml = stanza.to_xml()?;
        self.send_raw(&xml).await
    }

    /// Write literal text.
    pub async fn send_raw(&mut self, text: &str) -> Result<(), XmppError> {
        write_text(&mut self.write, text).await
    }

    /// Send a stream error, which also closes the stream, and shut the transport down.
    pub async fn send_stream_error(&mut self, condition: &str) {
        let _ = write_text(&mut self.write, &generate_stream_error(condition)).await;
        let _ = self.write.shutdown().await;
    }

    /// Shut the transport down without a closing tag.
    pub async fn shutdown(&mut self) {
        let _ = self.write.shutdown().await;
    }

    /// Send the closing tag and shut the transport down.
    pub async fn close(&mut self) {
        let _ = write_text(&mut self.write, "</stream:stream>").await;
        let _ = self.write.shutdown().await;
    }
}

fn new_stream_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
