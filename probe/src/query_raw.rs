//! Raw TCP and SSL query driver
//!
//! The base layer of the query stack: connect, write the optional
//! payload, half-close the write side, then read until the peer closes.
//! Everything received before a timeout is preserved as partial payload.
//! This module also owns the shared TCP-error mapping and the TLS
//! connectors used by the SSL variant.

use rustls::pki_types::ServerName;
use shared::status::{Failure, Outcome};
use shared::ProbeError;
use std::io::ErrorKind;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, error};

use crate::queries::{QueryContext, RawSpec};
use crate::runnable::lock;

/// Stream abstraction covering both plain TCP and TLS-wrapped sockets.
pub trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

/// Converts common TCP-level failures into the status contract.
///
/// File-descriptor exhaustion is special: it means the whole process is
/// in trouble, so it is logged at error level for the operator while the
/// affected query still reports CRITICAL like any other failure.
pub(crate) fn tcp_failure(err: &std::io::Error) -> Failure {
    if err.raw_os_error() == Some(libc::EMFILE) {
        error!("Too many open files! Restart with a new ulimit -n");
        return Failure::critical(format!("PROBE ERROR: {err}"));
    }

    let failure = match err.kind() {
        ErrorKind::TimedOut => Failure::critical("TCP handshake timeout"),
        ErrorKind::ConnectionRefused => Failure::critical("TCP connection refused"),
        ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
            Failure::critical("TCP connection lost unexpectedly")
        }
        _ => Failure::critical(format!("TCP error: {err}")),
    };

    failure.with_error(err.to_string())
}

/// Runs one raw exchange against `spec.host:spec.port`.
pub async fn execute(
    ctx: &QueryContext,
    spec: &RawSpec,
    timeout: Duration,
    partial: &Mutex<String>,
) -> Outcome {
    lock(partial).clear();
    let deadline = Instant::now() + timeout;

    debug!(
        "raw {} exchange with {}:{}",
        if spec.ssl { "ssl" } else { "tcp" },
        spec.host,
        spec.port
    );

    let addr = match tokio::time::timeout_at(
        deadline,
        tokio::net::lookup_host((spec.host.as_str(), spec.port)),
    )
    .await
    {
        Err(_) => return Err(Failure::critical("TCP handshake timeout")),
        Ok(Err(err)) => return Err(tcp_failure(&err)),
        Ok(Ok(mut addrs)) => match addrs.next() {
            Some(addr) => addr,
            None => {
                return Err(Failure::critical(format!(
                    "No addresses found for host '{}'",
                    spec.host
                )));
            }
        },
    };

    let stream = match tokio::time::timeout_at(deadline, TcpStream::connect(addr)).await {
        Err(_) => return Err(Failure::critical("TCP handshake timeout")),
        Ok(Err(err)) => return Err(tcp_failure(&err)),
        Ok(Ok(stream)) => stream,
    };

    let mut stream: Box<dyn AsyncReadWrite> = if spec.ssl {
        let connector = if spec.verify {
            &ctx.tls_verify
        } else {
            &ctx.tls_no_verify
        };

        let server_name = match ServerName::try_from(spec.host.clone()) {
            Ok(name) => name,
            Err(err) => {
                return Err(Failure::critical(format!(
                    "Invalid TLS server name '{}': {err}",
                    spec.host
                )));
            }
        };

        match tokio::time::timeout_at(deadline, connector.connect(server_name, stream)).await {
            Err(_) => return Err(Failure::critical("TCP handshake timeout")),
            Ok(Err(err)) => {
                return Err(Failure::critical(format!("TLS handshake failed: {err}")));
            }
            Ok(Ok(tls_stream)) => Box::new(tls_stream),
        }
    } else {
        Box::new(stream)
    };

    converse(&mut stream, spec.data.as_deref(), deadline, partial).await
}

/// Write phase, half-close, then read until the peer closes or the
/// deadline passes.
async fn converse(
    stream: &mut Box<dyn AsyncReadWrite>,
    data: Option<&str>,
    deadline: Instant,
    partial: &Mutex<String>,
) -> Outcome {
    if let Some(data) = data {
        if !data.is_empty() {
            match tokio::time::timeout_at(deadline, stream.write_all(data.as_bytes())).await {
                Err(_) => {
                    return Err(Failure::critical("Timeout waiting for connection close."));
                }
                Ok(Err(err)) => return Err(tcp_failure(&err)),
                Ok(Ok(())) => {}
            }
        }
    }

    // Half-close the write side (close_notify for TLS) so the peer sees
    // the end of the request and can respond then close.
    if let Err(err) = stream.shutdown().await {
        return Err(tcp_failure(&err));
    }

    let mut buf = vec![0u8; 4096];
    loop {
        match tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            Err(_) => {
                return Err(Failure::critical("Timeout waiting for connection close.")
                    .with_partial(take_partial(partial)));
            }
            Ok(Err(err)) if err.kind() == ErrorKind::UnexpectedEof => {
                // Peers that skip close_notify still count as closed.
                break;
            }
            Ok(Err(err)) => {
                return Err(tcp_failure(&err).with_partial(take_partial(partial)));
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                lock(partial).push_str(&String::from_utf8_lossy(&buf[..n]));
            }
        }
    }

    let received = take_partial(partial);
    if received.is_empty() {
        Err(Failure::critical("Empty response"))
    } else {
        Ok(received)
    }
}

pub(crate) fn take_partial(partial: &Mutex<String>) -> String {
    std::mem::take(&mut *lock(partial))
}

/// Create a TLS connector with certificate verification enabled
///
/// Loads the system root certificates; individual load errors are
/// tolerated as long as at least one root is usable.
pub fn tls_connector_with_verification() -> shared::Result<TlsConnector> {
    // Idempotent; a provider may already be installed.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let loaded = rustls_native_certs::load_native_certs();
    if loaded.certs.is_empty() && !loaded.errors.is_empty() {
        return Err(ProbeError::Init(format!(
            "No usable system root certificates ({} load errors)",
            loaded.errors.len()
        ))
        .into());
    }

    let mut root_store = rustls::RootCertStore::empty();
    for cert in loaded.certs {
        // Unparseable roots are skipped; the store keeps the rest.
        let _ = root_store.add(cert);
    }

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Create a TLS connector with certificate verification disabled
///
/// Probe traffic historically does not authenticate its targets; this is
/// the connector used unless `verify_ssl` is set.
pub fn tls_connector_without_verification() -> shared::Result<TlsConnector> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Verifier that trusts any certificate chain the peer presents.
///
/// Handshake signatures are still checked against the crypto provider's
/// algorithm set, so only the trust decision is skipped, not the
/// protocol itself.
#[derive(Debug)]
struct AcceptAnyServerCert {
    algorithms: rustls::crypto::WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: rustls::crypto::aws_lc_rs::default_provider()
                .signature_verification_algorithms,
        }
    }
}

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
