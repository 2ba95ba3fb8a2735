//! TLS wrapping for `amqps` connections, built on rustls.
//!
//! The handshake is driven inside the worker's poll loop: plaintext written
//! before the handshake completes is buffered by rustls and released once
//! the session is established.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::sync::Arc;

use mio::net::TcpStream;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, ClientConnection, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::trace;

use crate::connection::options::{ConnectionOptions, TlsVerify, TlsVersion};
use crate::error::{Error, Result};
use crate::frames::buffer::FrameBuffer;
use crate::transport::{ReadOutcome, READ_CHUNK};

pub(crate) struct TlsTransport {
    socket: TcpStream,
    session: ClientConnection,
}

impl std::fmt::Debug for TlsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsTransport")
            .field("socket", &self.socket)
            .finish_non_exhaustive()
    }
}

impl TlsTransport {
    pub(crate) fn new(socket: TcpStream, options: &ConnectionOptions) -> Result<Self> {
        let config = client_config(options)?;
        let server_name =
            ServerName::try_from(options.host.clone()).map_err(|_| Error::InvalidOption {
                option: "host",
                value: options.host.clone(),
            })?;
        let session = ClientConnection::new(Arc::new(config), server_name)?;
        Ok(Self { socket, session })
    }

    pub(crate) fn socket_mut(&mut self) -> &mut TcpStream {
        &mut self.socket
    }

    pub(crate) fn read_into(&mut self, buffer: &mut FrameBuffer) -> Result<ReadOutcome> {
        let mut outcome = ReadOutcome::default();
        loop {
            match self.session.read_tls(&mut self.socket) {
                Ok(0) => {
                    outcome.closed = true;
                    break;
                }
                Ok(_) => {
                    let state = self.session.process_new_packets()?;
                    if state.peer_has_closed() {
                        outcome.closed = true;
                    }
                    outcome.bytes += self.drain_plaintext(buffer)?;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        // The handshake may have produced records that need to go out.
        self.flush_pending()?;
        Ok(outcome)
    }

    fn drain_plaintext(&mut self, buffer: &mut FrameBuffer) -> Result<usize> {
        let mut total = 0;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.session.reader().read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    buffer.extend(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    pub(crate) fn write(&mut self, data: &[u8]) -> Result<usize> {
        let accepted = match self.session.writer().write(data) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(e.into()),
        };
        self.flush_pending()?;
        Ok(accepted)
    }

    pub(crate) fn flush_pending(&mut self) -> Result<()> {
        while self.session.wants_write() {
            match self.session.write_tls(&mut self.socket) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

fn client_config(options: &ConnectionOptions) -> Result<ClientConfig> {
    let tls = &options.tls_options;

    let builder = match tls.ssl_version {
        None | Some(TlsVersion::Sslv23) => ClientConfig::builder(),
        Some(TlsVersion::Tlsv1_2) => {
            ClientConfig::builder_with_protocol_versions(&[&rustls::version::TLS12])
        }
        Some(version @ (TlsVersion::Tlsv1 | TlsVersion::Tlsv1_1)) => {
            return Err(Error::InvalidOption {
                option: "ssl_version",
                value: format!("{version:?} is not supported by the TLS backend"),
            })
        }
    };

    let verify_certs = match tls.verify {
        TlsVerify::Ignore => false,
        TlsVerify::Optional => tls.cacertfile.is_some(),
        TlsVerify::Required => true,
    };

    let builder = if verify_certs {
        let mut roots = RootCertStore::empty();
        match &tls.cacertfile {
            Some(path) => {
                for cert in load_certs(path)? {
                    roots
                        .add(cert)
                        .map_err(Error::Tls)?;
                }
            }
            None => {
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }
        builder.with_root_certificates(roots)
    } else {
        trace!("server certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification::new()))
    };

    let config = match (&tls.certfile, &tls.keyfile) {
        (Some(certfile), Some(keyfile)) => {
            let certs = load_certs(certfile)?;
            let key = load_key(keyfile)?;
            builder.with_client_auth_cert(certs, key)?
        }
        _ => builder.with_no_client_auth(),
    };
    Ok(config)
}

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<io::Result<Vec<_>>>()?;
    Ok(certs)
}

fn load_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no private key found in {}", path.display()),
        ))
    })
}

/// Accepts any server certificate; installed for `verify=ignore`.
#[derive(Debug)]
struct NoCertificateVerification(CryptoProvider);

impl NoCertificateVerification {
    fn new() -> Self {
        Self(rustls::crypto::ring::default_provider())
    }
}

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}
