//! The narrow, pluggable byte-stream abstraction (§4.3): plain TCP now, TLS after
//! an in-band STLS upgrade.

use crate::error::{AdbError, Result};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

/// How to validate the daemon's certificate during the STLS→TLS upgrade (§4.3).
///
/// adbd's TLS certificates are self-signed and not chained to any public CA, so
/// there is no root store to verify against; trust instead comes from either
/// pinning the exact certificate (e.g. one captured during pairing) or, as a
/// last resort, skipping verification entirely.
pub enum TlsVerifyPolicy {
    /// Accept only a server certificate matching this exact DER encoding.
    PinnedCertificate(Vec<u8>),
    /// Accept any certificate the daemon presents. Named for what it is.
    InsecureSkipVerify,
}

struct PinnedVerifier(Vec<u8>);

impl rustls::client::ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        if end_entity.0 == self.0 {
            Ok(rustls::client::ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General(
                "server certificate did not match the pinned certificate".into(),
            ))
        }
    }
}

struct InsecureVerifier;

impl rustls::client::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

fn verifier_for(policy: &TlsVerifyPolicy) -> Arc<dyn rustls::client::ServerCertVerifier> {
    match policy {
        TlsVerifyPolicy::PinnedCertificate(der) => Arc::new(PinnedVerifier(der.clone())),
        TlsVerifyPolicy::InsecureSkipVerify => Arc::new(InsecureVerifier),
    }
}

/// A bidirectional byte stream. Implementations needn't buffer beyond what the
/// underlying OS socket already does; the core never has more than one frame
/// outstanding per direction.
pub trait Transport: Send {
    fn send_all(&mut self, bytes: &[u8]) -> Result<()>;
    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()>;
    fn close(&mut self) -> Result<()>;

    /// Produce an independent handle to the same underlying connection, the
    /// way `TcpStream::try_clone` hands back a second fd for the same socket.
    /// The multiplexer uses this to give its reader thread and its writer
    /// mutex genuinely independent handles, so a blocked read never holds up
    /// a concurrent write (§5).
    fn try_clone(&self) -> Result<Box<dyn Transport>>;

    /// Consume this transport and wrap it in TLS, after the STLS frame exchange
    /// at the application layer (§4.4 `TlsPending`) has already happened.
    fn upgrade_to_tls(
        self: Box<Self>,
        server_name: &str,
        ca_verify_policy: &TlsVerifyPolicy,
    ) -> Result<Box<dyn Transport>>;
}

/// Plain-TCP transport, the default for a first connection attempt.
pub struct TcpTransport(TcpStream);

impl TcpTransport {
    pub fn connect(addrs: impl ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addrs)?;
        stream.set_nodelay(true)?;
        Ok(Self(stream))
    }

    pub fn connect_timeout(addr: std::net::SocketAddr, timeout: Duration) -> Result<Self> {
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_nodelay(true)?;
        Ok(Self(stream))
    }

    /// Consume this transport and hand back the raw stream, e.g. to hand it to
    /// `rustls::StreamOwned` after an STLS exchange.
    pub fn into_inner(self) -> TcpStream {
        self.0
    }
}

impl Transport for TcpTransport {
    fn send_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.0.write_all(bytes)?;
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.0.read_exact(buf)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.0.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn Transport>> {
        Ok(Box::new(TcpTransport(self.0.try_clone()?)))
    }

    fn upgrade_to_tls(
        self: Box<Self>,
        server_name: &str,
        ca_verify_policy: &TlsVerifyPolicy,
    ) -> Result<Box<dyn Transport>> {
        let client_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(verifier_for(ca_verify_policy))
            .with_no_client_auth();
        let name = rustls::ServerName::try_from(server_name)
            .map_err(|_| AdbError::Crypto(format!("invalid TLS server name {server_name:?}")))?;
        let conn = rustls::ClientConnection::new(Arc::new(client_config), name)
            .map_err(|e| AdbError::Crypto(format!("TLS handshake setup failed: {e}")))?;
        Ok(Box::new(TlsTransport::new(conn, self.0)))
    }
}

/// TLS transport used after an STLS upgrade (§4.4 `TlsPending`).
pub struct TlsTransport(rustls::StreamOwned<rustls::ClientConnection, TcpStream>);

impl TlsTransport {
    pub fn new(conn: rustls::ClientConnection, stream: TcpStream) -> Self {
        Self(rustls::StreamOwned::new(conn, stream))
    }
}

impl Transport for TlsTransport {
    fn send_all(&mut self, bytes: &[u8]) -> Result<()> {
        self.0.write_all(bytes)?;
        self.0.flush()?;
        Ok(())
    }

    fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.0.read_exact(buf)?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.0.sock.shutdown(std::net::Shutdown::Both)?;
        Ok(())
    }

    fn try_clone(&self) -> Result<Box<dyn Transport>> {
        // rustls's `ClientConnection` owns mutable crypto state that can't be
        // soundly shared between an independent reader and writer handle; a
        // multiplexed connection therefore stays on plain TCP, matching this
        // crate's STLS support being offered at the interface boundary only
        // (see DESIGN.md).
        Err(AdbError::Crypto(
            "TLS transport cannot be split into independent reader/writer handles".into(),
        ))
    }

    fn upgrade_to_tls(
        self: Box<Self>,
        _server_name: &str,
        _ca_verify_policy: &TlsVerifyPolicy,
    ) -> Result<Box<dyn Transport>> {
        Err(AdbError::Crypto(
            "transport is already TLS-upgraded".into(),
        ))
    }
}

#[cfg(test)]
pub(crate) mod duplex {
    //! An in-memory duplex transport, a pair of pipes, for deterministic tests
    //! of the handshake and multiplexer state machines without a real device.

    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Condvar, Mutex};

    #[derive(Default)]
    struct Pipe {
        buf: Mutex<VecDeque<u8>>,
        closed: Mutex<bool>,
        cv: Condvar,
    }

    impl Pipe {
        fn push(&self, bytes: &[u8]) {
            let mut buf = self.buf.lock().unwrap();
            buf.extend(bytes);
            self.cv.notify_all();
        }

        fn pull(&self, out: &mut [u8]) -> Result<()> {
            let mut buf = self.buf.lock().unwrap();
            let mut filled = 0;
            while filled < out.len() {
                while buf.is_empty() {
                    if *self.closed.lock().unwrap() {
                        return Err(crate::error::AdbError::TransportClosed);
                    }
                    buf = self.cv.wait(buf).unwrap();
                }
                let n = std::cmp::min(out.len() - filled, buf.len());
                for slot in out.iter_mut().skip(filled).take(n) {
                    *slot = buf.pop_front().unwrap();
                }
                filled += n;
            }
            Ok(())
        }

        fn close(&self) {
            *self.closed.lock().unwrap() = true;
            self.cv.notify_all();
        }
    }

    /// One endpoint of an in-memory duplex pair. Construct with [`duplex_pair`].
    pub struct DuplexTransport {
        outbound: Arc<Pipe>,
        inbound: Arc<Pipe>,
    }

    impl Transport for DuplexTransport {
        fn send_all(&mut self, bytes: &[u8]) -> Result<()> {
            self.outbound.push(bytes);
            Ok(())
        }

        fn recv_exact(&mut self, buf: &mut [u8]) -> Result<()> {
            self.inbound.pull(buf)
        }

        fn close(&mut self) -> Result<()> {
            // Closes both directions, the way a real socket shutdown(Both)
            // is visible to every fd referencing that socket, not just the
            // handle that called it.
            self.outbound.close();
            self.inbound.close();
            Ok(())
        }

        fn try_clone(&self) -> Result<Box<dyn Transport>> {
            Ok(Box::new(DuplexTransport {
                outbound: self.outbound.clone(),
                inbound: self.inbound.clone(),
            }))
        }

        fn upgrade_to_tls(
            self: Box<Self>,
            _server_name: &str,
            _ca_verify_policy: &TlsVerifyPolicy,
        ) -> Result<Box<dyn Transport>> {
            Err(crate::error::AdbError::Crypto(
                "in-memory test transport has no underlying socket to upgrade".into(),
            ))
        }
    }

    /// Build a connected pair: bytes sent on `a` are received on `b` and vice versa.
    pub fn duplex_pair() -> (DuplexTransport, DuplexTransport) {
        let left = Arc::new(Pipe::default());
        let right = Arc::new(Pipe::default());
        let a = DuplexTransport {
            outbound: left.clone(),
            inbound: right.clone(),
        };
        let b = DuplexTransport {
            outbound: right,
            inbound: left,
        };
        (a, b)
    }

    #[test]
    fn duplex_roundtrip() {
        let (mut a, mut b) = duplex_pair();
        a.send_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        b.recv_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn duplex_close_unblocks_reader() {
        let (mut a, mut b) = duplex_pair();
        a.close().unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(
            b.recv_exact(&mut buf),
            Err(crate::error::AdbError::TransportClosed)
        ));
    }
}
