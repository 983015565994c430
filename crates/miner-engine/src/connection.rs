//! Pool connection: TLS transport, line reactor and reconnect loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::EngineEvent;
use crate::error::{ProtocolError, SessionError};
use crate::protocol;
use crate::session::{InboundOutcome, SharedSession};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Longest inbound line accepted. Longer lines are skipped and reported.
const MAX_LINE_LEN: usize = 64 * 1024;

pub(crate) struct ConnectionConfig {
    pub(crate) host: String,
    pub(crate) port: u16,
    pub(crate) api_key: String,
    pub(crate) reconnect_delay: Duration,
}

/// Accepts any server certificate. Pools run self-signed certificates, so the
/// session is encrypted but the peer is not authenticated. Handshake
/// signatures are still checked.
#[derive(Debug)]
struct AcceptAnyCertificate {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

fn tls_connector() -> Result<TlsConnector, SessionError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| SessionError::Tls(e.to_string()))?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate { provider }))
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Resolve the pool and try every endpoint in order until one completes the
/// TCP connect and TLS handshake.
async fn connect(
    cfg: &ConnectionConfig,
    tls: &TlsConnector,
) -> Result<(TlsStream<TcpStream>, SocketAddr), SessionError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((cfg.host.as_str(), cfg.port))
        .await
        .map_err(|e| SessionError::Resolve {
            host: cfg.host.clone(),
            reason: e.to_string(),
        })?
        .collect();
    if addrs.is_empty() {
        return Err(SessionError::Resolve {
            host: cfg.host.clone(),
            reason: "no addresses".to_string(),
        });
    }

    let server_name =
        ServerName::try_from(cfg.host.clone()).map_err(|e| SessionError::Tls(e.to_string()))?;

    let mut last_err = None;
    for addr in addrs {
        debug!(%addr, "connecting");
        let tcp = match tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(source)) => {
                last_err = Some(SessionError::Connect { addr, source });
                continue;
            }
            Err(_) => {
                last_err = Some(SessionError::Connect {
                    addr,
                    source: std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out"),
                });
                continue;
            }
        };
        let _ = tcp.set_nodelay(true);
        let stream = tls
            .connect(server_name.clone(), tcp)
            .await
            .map_err(|e| SessionError::Tls(e.to_string()))?;
        return Ok((stream, addr));
    }
    Err(last_err.unwrap_or(SessionError::Closed))
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> Result<(), SessionError> {
    debug!(line = line.trim_end(), "pool <-");
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

fn emit(events: &mpsc::UnboundedSender<EngineEvent>, event: EngineEvent) {
    let _ = events.send(event);
}

/// One read result of [`LineReader`].
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    /// A complete line without its newline.
    Line(Vec<u8>),
    /// A line over [`MAX_LINE_LEN`] was skipped.
    Oversized(usize),
    /// The peer closed the stream.
    Eof,
}

/// Newline framing with a length cap.
///
/// `next_frame` is cancel safe: bytes taken from the stream are held in
/// `self` until their line completes.
struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    skipped: usize,
    max: usize,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R, max: usize) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
            skipped: 0,
            max,
        }
    }

    async fn next_frame(&mut self) -> std::io::Result<Frame> {
        loop {
            let available = self.inner.fill_buf().await?;
            if available.is_empty() {
                return Ok(Frame::Eof);
            }
            let (chunk, used, complete) = match available.iter().position(|b| *b == b'\n') {
                Some(pos) => (&available[..pos], pos + 1, true),
                None => (available, available.len(), false),
            };

            if self.skipped > 0 || self.buf.len() + chunk.len() > self.max {
                self.skipped += self.buf.len() + chunk.len();
                self.buf.clear();
            } else {
                self.buf.extend_from_slice(chunk);
            }
            self.inner.consume(used);

            if complete {
                if self.skipped > 0 {
                    return Ok(Frame::Oversized(std::mem::take(&mut self.skipped)));
                }
                return Ok(Frame::Line(std::mem::take(&mut self.buf)));
            }
        }
    }
}

fn drop_message(events: &mpsc::UnboundedSender<EngineEvent>, err: &ProtocolError) {
    warn!(error = %err, "dropping malformed pool message");
    emit(events, EngineEvent::Warning {
        message: format!("dropped pool message: {err}"),
    });
}

fn handle_frame(
    frame: Frame,
    session: &SharedSession,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> Result<(), SessionError> {
    let raw = match frame {
        Frame::Eof => return Err(SessionError::Closed),
        Frame::Oversized(len) => {
            drop_message(events, &ProtocolError::LineTooLong { len, max: MAX_LINE_LEN });
            return Ok(());
        }
        Frame::Line(raw) => raw,
    };
    match String::from_utf8(raw) {
        Ok(line) if line.trim().is_empty() => Ok(()),
        Ok(line) => handle_line(&line, session, events),
        Err(err) => {
            drop_message(events, &ProtocolError::from(err));
            Ok(())
        }
    }
}

fn handle_line(
    line: &str,
    session: &SharedSession,
    events: &mpsc::UnboundedSender<EngineEvent>,
) -> Result<(), SessionError> {
    debug!(line, "pool ->");
    let msg = match protocol::parse_inbound(line) {
        Ok(msg) => msg,
        Err(err) => {
            drop_message(events, &err);
            return Ok(());
        }
    };

    match session.apply(msg) {
        InboundOutcome::LoginAccepted { nonce_prefix } => {
            info!(nonce_prefix = %hex::encode(&nonce_prefix), "login accepted");
            emit(events, EngineEvent::LoginAccepted {
                nonce_prefix: hex::encode(nonce_prefix),
            });
        }
        InboundOutcome::LoginRejected { code } => {
            return Err(SessionError::LoginRejected { code });
        }
        InboundOutcome::ShareAccepted { id } => {
            info!(work_id = %id, "solution accepted");
            emit(events, EngineEvent::ShareAccepted {
                work_id: id,
                accepted: session.accepted(),
                rejected: session.rejected(),
            });
        }
        InboundOutcome::ShareRejected { id, code } => {
            warn!(work_id = %id, code, "solution rejected");
            emit(events, EngineEvent::ShareRejected {
                work_id: id,
                code,
                accepted: session.accepted(),
                rejected: session.rejected(),
            });
        }
        InboundOutcome::NewJob {
            work_id,
            difficulty,
            height,
            fork_reached,
        } => {
            info!(work_id, difficulty = difficulty.to_float(), ?height, "new job");
            if fork_reached {
                if let Some(height) = height {
                    info!(height, "fork height reached, switching algorithm");
                    emit(events, EngineEvent::ForkHeightReached { height });
                }
            }
            emit(events, EngineEvent::NewJob {
                work_id,
                difficulty,
                height,
                accepted: session.accepted(),
                rejected: session.rejected(),
            });
        }
        InboundOutcome::Cancelled { work_id, matched } => {
            debug!(work_id, matched, "cancel");
            if matched {
                emit(events, EngineEvent::JobCancelled { work_id });
            }
        }
        InboundOutcome::Ignored { method } => {
            debug!(?method, "ignoring pool message");
        }
    }
    Ok(())
}

/// Run one logged-in session over `stream` until it fails or `stop` fires.
///
/// Writes `login` first, then serves inbound lines and the outbound queue from
/// one loop so a queued line is always written whole. On `stop`, lines still
/// queued are written before returning `Ok(())`.
///
/// Inbound lines that are not UTF-8 or exceed [`MAX_LINE_LEN`] are dropped
/// with a warning; the session stays up.
pub(crate) async fn drive_connection<S>(
    stream: S,
    api_key: &str,
    session: &SharedSession,
    outbound: &mut mpsc::Receiver<String>,
    events: &mpsc::UnboundedSender<EngineEvent>,
    stop: &CancellationToken,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut lines = LineReader::new(reader, MAX_LINE_LEN);

    write_line(&mut writer, &protocol::login_line(api_key)).await?;

    loop {
        tokio::select! {
            _ = stop.cancelled() => {
                while let Ok(line) = outbound.try_recv() {
                    write_line(&mut writer, &line).await?;
                }
                let _ = writer.shutdown().await;
                return Ok(());
            }
            frame = lines.next_frame() => {
                handle_frame(frame?, session, events)?;
            }
            Some(line) = outbound.recv() => {
                write_line(&mut writer, &line).await?;
            }
        }
    }
}

/// Keep a pool session alive until `stop` fires.
///
/// Returns an error only for failures reconnecting cannot fix.
pub(crate) async fn run_connection(
    cfg: ConnectionConfig,
    session: Arc<SharedSession>,
    mut outbound: mpsc::Receiver<String>,
    events: mpsc::UnboundedSender<EngineEvent>,
    stop: CancellationToken,
) -> Result<(), SessionError> {
    let tls = tls_connector()?;
    let server = format!("{}:{}", cfg.host, cfg.port);

    loop {
        info!(%server, "connecting to pool");
        emit(&events, EngineEvent::Connecting {
            server: server.clone(),
        });

        let connected = tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            res = connect(&cfg, &tls) => res,
        };

        let err = match connected {
            Ok((stream, addr)) => {
                info!(%addr, "tls handshake ok");
                emit(&events, EngineEvent::Connected {
                    endpoint: addr.to_string(),
                });
                match drive_connection(stream, &cfg.api_key, &session, &mut outbound, &events, &stop).await {
                    Ok(()) => return Ok(()),
                    Err(err) if err.is_fatal() => return Err(err),
                    Err(err) => err,
                }
            }
            Err(err) => err,
        };

        session.invalidate_work();
        let mut discarded = 0usize;
        while outbound.try_recv().is_ok() {
            discarded += 1;
        }
        if discarded > 0 {
            warn!(discarded, "discarding queued solutions after connection loss");
        }

        warn!(error = %err, retry_in = ?cfg.reconnect_delay, "lost connection to pool");
        emit(&events, EngineEvent::ConnectionLost {
            reason: err.to_string(),
            retry_in_ms: cfg.reconnect_delay.as_millis() as u64,
        });

        tokio::select! {
            _ = stop.cancelled() => return Ok(()),
            _ = tokio::time::sleep(cfg.reconnect_delay) => {}
        }
    }
}
