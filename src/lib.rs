//! Core of an Android Debug Bridge (ADB) client: wire framing, the CNXN/AUTH/STLS
//! handshake, RSA identities and pairing, and the OPEN/OKAY/CLSE/WRTE stream
//! multiplexer. Transport sockets beyond the bundled TCP/TLS ones, the `adb server`
//! protocol, the sync and shell-v2 subprotocols, and key persistence are all left
//! to callers.

pub mod codec;
pub mod config;
pub mod error;
pub mod handshake;
pub mod keystore;
pub mod multiplex;
pub mod pairing;
pub mod transport;
pub mod version;

pub use codec::{Command, Frame};
pub use config::{Config, ConfigBuilder, TlsPolicy};
pub use error::{AdbError, ProtocolErrorReason, Result};
pub use handshake::Connected;
pub use keystore::{EncodedPublicKey, Identity};
pub use multiplex::{Multiplexer, Stream};
pub use pairing::TrustedIdentity;
pub use transport::{TcpTransport, TlsTransport, TlsVerifyPolicy, Transport};

/// Connect to `addr`, run the handshake and start the multiplexer.
///
/// This is the ordinary entry point; callers who need a non-TCP transport
/// (e.g. USB) should call [`handshake::connect`] and [`Multiplexer::start`]
/// directly with their own `Transport` impl.
pub fn connect(addr: impl std::net::ToSocketAddrs, config: &Config) -> Result<Multiplexer> {
    let transport = TcpTransport::connect(addr)?;
    let connected = handshake::connect(Box::new(transport), config)?;
    Multiplexer::start(connected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::duplex::duplex_pair;
    use crate::version::V_MIN;
    use std::thread;

    /// Scenario 5: open/write/read/close round trip (§8).
    #[test]
    fn open_write_read_close_round_trip_scenario_5() {
        let (host, mut daemon) = duplex_pair();
        let connected = Connected {
            transport: Box::new(host),
            active_version: V_MIN,
            active_max_data: 0x1000,
            remote_banner: b"device::".to_vec(),
        };
        let mux = Multiplexer::start(connected).unwrap();

        let daemon_thread = thread::spawn(move || {
            // Host OPEN(1, 0, "shell:echo hi\0")
            let open = Frame::read_from(&mut daemon, V_MIN, 0x1000).unwrap();
            assert_eq!(open.command, Command::Open);
            assert_eq!(open.arg0, 1);

            Frame::okay(7, 1).write_to(&mut daemon, V_MIN).unwrap();

            // Host's empty WRTE(1, 7, "")
            let wrte = Frame::read_from(&mut daemon, V_MIN, 0x1000).unwrap();
            assert_eq!(wrte.command, Command::Wrte);
            assert!(wrte.payload.is_empty());
            Frame::okay(7, 1).write_to(&mut daemon, V_MIN).unwrap();

            Frame::wrte(7, 1, b"hi\n".to_vec())
                .write_to(&mut daemon, V_MIN)
                .unwrap();

            let okay = Frame::read_from(&mut daemon, V_MIN, 0x1000).unwrap();
            assert_eq!(okay.command, Command::Okay);

            Frame::clse(7, 1).write_to(&mut daemon, V_MIN).unwrap();
        });

        let mut stream = mux.open("shell:echo hi", None).unwrap();
        stream.write(b"", None).unwrap();

        let mut buf = [0u8; 16];
        let n = stream.read(&mut buf, None).unwrap();
        assert_eq!(&buf[..n], b"hi\n");

        let n2 = stream.read(&mut buf, None).unwrap();
        assert_eq!(n2, 0);

        daemon_thread.join().unwrap();
    }

    /// Scenario 6: refused OPEN (§8).
    #[test]
    fn refused_open_scenario_6() {
        let (host, mut daemon) = duplex_pair();
        let connected = Connected {
            transport: Box::new(host),
            active_version: V_MIN,
            active_max_data: 0x1000,
            remote_banner: b"device::".to_vec(),
        };
        let mux = Multiplexer::start(connected).unwrap();

        let daemon_thread = thread::spawn(move || {
            let open = Frame::read_from(&mut daemon, V_MIN, 0x1000).unwrap();
            assert_eq!(open.command, Command::Open);
            assert_eq!(open.arg0, 1);
            Frame::clse(0, 1).write_to(&mut daemon, V_MIN).unwrap();
        });

        let err = mux.open("jdwp:999999", None).unwrap_err();
        assert!(matches!(err, AdbError::ConnectionRefused));

        daemon_thread.join().unwrap();
    }
}
