//! QUIC transport for the client.
//!
//! [`ConnectedClient`] bridges two channels and one bidirectional QUIC
//! stream. A writer task encodes outgoing [`ClientMessage`]s as frames; a
//! reader task decodes incoming frames into [`ServerMessage`]s. Event order
//! is preserved both ways because there is exactly one stream.

use std::{
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use quinn::{ClientConfig, Endpoint, RecvStream, SendStream};
use roomcast_proto::{ALPN_PROTOCOL, ClientMessage, Frame, FrameHeader, ServerMessage};
use tokio::{sync::mpsc, task::AbortHandle};

use crate::error::TransportError;

/// Client transport settings.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Upper bound on the QUIC/TLS handshake
    pub connect_timeout: Duration,
    /// QUIC idle timeout; the relay's own heartbeat keeps live sessions busy
    pub idle_timeout: Duration,
    /// Server name presented for TLS
    pub server_name: String,
    /// Capacity of each direction's channel
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(90),
            server_name: "localhost".to_string(),
            channel_capacity: 256,
        }
    }
}

/// Handle to a live connection.
///
/// Dropping `to_server` (or calling [`close`](Self::close)) finishes the send
/// half; `from_server` yields `None` once the server ends the stream.
pub struct ConnectedClient {
    /// Send events to the server.
    pub to_server: mpsc::Sender<ClientMessage>,
    /// Receive events from the server, in the order the server sent them.
    pub from_server: mpsc::Receiver<ServerMessage>,
    connection: quinn::Connection,
    _endpoint: Endpoint,
    reader: AbortHandle,
    writer: AbortHandle,
}

impl ConnectedClient {
    /// Queue an event for the server.
    ///
    /// # Errors
    ///
    /// `Closed` if the writer task has stopped.
    pub async fn send(&self, message: ClientMessage) -> Result<(), TransportError> {
        self.to_server.send(message).await.map_err(|_| TransportError::Closed)
    }

    /// Next event from the server, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.from_server.recv().await
    }

    /// Server address.
    pub fn remote_addr(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Close the connection immediately.
    pub fn close(&self) {
        self.connection.close(0u32.into(), b"client closed");
        self.stop();
    }

    /// Stop the background tasks without closing the connection.
    pub fn stop(&self) {
        self.reader.abort();
        self.writer.abort();
    }
}

impl Drop for ConnectedClient {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Connect with default settings.
///
/// # Errors
///
/// See [`connect_with_config`].
pub async fn connect(server_addr: &str) -> Result<ConnectedClient, TransportError> {
    connect_with_config(server_addr, TransportConfig::default()).await
}

/// Connect to a roomcast server and open the event stream.
///
/// # Errors
///
/// `Connection` for a bad address or refused handshake, `Timeout` if the
/// handshake exceeds `connect_timeout`, `Stream` if the stream cannot be
/// opened.
pub async fn connect_with_config(
    server_addr: &str,
    config: TransportConfig,
) -> Result<ConnectedClient, TransportError> {
    let addr: SocketAddr = server_addr
        .parse()
        .map_err(|e| TransportError::Connection(format!("invalid address: {e}")))?;

    let mut endpoint = Endpoint::client(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))
        .map_err(|e| TransportError::Connection(format!("endpoint creation failed: {e}")))?;
    endpoint.set_default_client_config(insecure_client_config(&config)?);

    let connecting = endpoint
        .connect(addr, &config.server_name)
        .map_err(|e| TransportError::Connection(format!("connect failed: {e}")))?;

    let connection = tokio::time::timeout(config.connect_timeout, connecting)
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Connection(format!("connection failed: {e}")))?;

    let (send, recv) = connection
        .open_bi()
        .await
        .map_err(|e| TransportError::Stream(format!("open_bi failed: {e}")))?;

    let (to_server_tx, to_server_rx) = mpsc::channel(config.channel_capacity);
    let (from_server_tx, from_server_rx) = mpsc::channel(config.channel_capacity);

    let writer = tokio::spawn(write_loop(send, to_server_rx));
    let reader = tokio::spawn(read_loop(recv, from_server_tx));

    Ok(ConnectedClient {
        to_server: to_server_tx,
        from_server: from_server_rx,
        connection,
        _endpoint: endpoint,
        reader: reader.abort_handle(),
        writer: writer.abort_handle(),
    })
}

async fn write_loop(mut send: SendStream, mut rx: mpsc::Receiver<ClientMessage>) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = send_message(&mut send, &message).await {
            tracing::debug!(error = %e, kind = message.kind(), "send failed");
            return;
        }
    }

    let _ = send.finish();
}

async fn send_message(send: &mut SendStream, message: &ClientMessage) -> Result<(), TransportError> {
    let mut buf = Vec::new();
    message.into_frame()?.encode(&mut buf)?;
    send.write_all(&buf).await.map_err(|e| TransportError::Stream(format!("write failed: {e}")))
}

async fn read_loop(mut recv: RecvStream, tx: mpsc::Sender<ServerMessage>) {
    loop {
        match read_message(&mut recv).await {
            Ok(message) => {
                if tx.send(message).await.is_err() {
                    return;
                }
            },
            Err(e) => {
                tracing::debug!(error = %e, "read ended");
                return;
            },
        }
    }
}

async fn read_message(recv: &mut RecvStream) -> Result<ServerMessage, TransportError> {
    let mut header_buf = [0u8; FrameHeader::SIZE];
    recv.read_exact(&mut header_buf)
        .await
        .map_err(|e| TransportError::Stream(format!("header read failed: {e}")))?;

    let payload_size = FrameHeader::from_bytes(&header_buf)?.payload_size() as usize;

    let mut payload = vec![0u8; payload_size];
    recv.read_exact(&mut payload)
        .await
        .map_err(|e| TransportError::Stream(format!("payload read failed: {e}")))?;

    Ok(ServerMessage::from_frame(&Frame::new(payload))?)
}

/// Client config that accepts any certificate.
///
/// WARNING: development only. Production must verify certificates.
fn insecure_client_config(config: &TransportConfig) -> Result<ClientConfig, TransportError> {
    let mut crypto = rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureCertVerifier))
        .with_no_client_auth();

    crypto.alpn_protocols = vec![ALPN_PROTOCOL.to_vec()];

    let quic = quinn::crypto::rustls::QuicClientConfig::try_from(crypto)
        .map_err(|e| TransportError::Connection(format!("invalid TLS config: {e}")))?;
    let mut client_config = ClientConfig::new(Arc::new(quic));

    let idle = config
        .idle_timeout
        .try_into()
        .map_err(|e| TransportError::Connection(format!("invalid idle timeout: {e}")))?;
    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(Some(idle));
    client_config.transport_config(Arc::new(transport));

    Ok(client_config)
}

/// Certificate verifier that accepts anything.
#[derive(Debug)]
struct InsecureCertVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureCertVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}
