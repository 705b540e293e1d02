//! The underlying transport a [`super::Connection`] reads and writes through: a plain TCP socket
//! or, when `rustls-tls` is enabled and the deployment requests TLS, a `rustls` stream over TCP.

use std::pin::Pin;

use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};

use crate::{
    error::{ErrorKind, Result},
    options::{ServerAddress, TlsOptions},
};

pub(crate) enum AsyncStream {
    Tcp(TcpStream),
    #[cfg(feature = "rustls-tls")]
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncStream {
    pub(crate) async fn connect(address: &ServerAddress, tls: Option<&TlsOptions>) -> Result<Self> {
        let ServerAddress::Tcp { host, port } = address else {
            return Err(ErrorKind::InvalidArgument {
                message: "Unix domain socket connections are not supported on this platform".into(),
            }
            .into());
        };

        let tcp = TcpStream::connect((host.as_str(), *port)).await?;
        tcp.set_nodelay(true)?;

        match tls {
            None => Ok(AsyncStream::Tcp(tcp)),
            Some(tls_options) => {
                #[cfg(feature = "rustls-tls")]
                {
                    Ok(AsyncStream::Tls(Box::new(connect_tls(tcp, host, tls_options).await?)))
                }
                #[cfg(not(feature = "rustls-tls"))]
                {
                    let _ = tls_options;
                    Err(ErrorKind::Tls("TLS was requested but this build has no TLS backend enabled".into()).into())
                }
            }
        }
    }
}

#[cfg(feature = "rustls-tls")]
async fn connect_tls(
    tcp: TcpStream,
    host: &str,
    options: &TlsOptions,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
    use std::sync::Arc;

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let config = if options.allow_invalid_certificates {
        let mut config = config;
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(danger::NoVerifier));
        config
    } else {
        config
    };

    let connector = tokio_rustls::TlsConnector::from(Arc::new(config));
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|e| crate::error::ErrorKind::Tls(format!("invalid server name {host}: {e}")))?;
    connector
        .connect(server_name, tcp)
        .await
        .map_err(|e| crate::error::ErrorKind::Tls(e.to_string()).into())
}

#[cfg(feature = "rustls-tls")]
mod danger {
    use rustls::{
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        DigitallySignedStruct, SignatureScheme,
    };

    /// Only ever constructed when the caller explicitly set `tlsAllowInvalidCertificates=true`.
    #[derive(Debug)]
    pub(super) struct NoVerifier;

    impl ServerCertVerifier for NoVerifier {
        fn verify_server_cert(
            &self,
            _end_entity: &rustls::pki_types::CertificateDer<'_>,
            _intermediates: &[rustls::pki_types::CertificateDer<'_>],
            _server_name: &rustls::pki_types::ServerName<'_>,
            _ocsp_response: &[u8],
            _now: rustls::pki_types::UnixTime,
        ) -> std::result::Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &rustls::pki_types::CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ED25519,
            ]
        }
    }
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "rustls-tls")]
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            AsyncStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "rustls-tls")]
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "rustls-tls")]
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            AsyncStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "rustls-tls")]
            AsyncStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}
