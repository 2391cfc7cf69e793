//! CNXN → AUTH(token/signature/rsa-pubkey) → optional STLS → Connected (§4.4).

use crate::codec::{Command, Frame};
use crate::config::{Config, TlsPolicy};
use crate::error::{AdbError, ProtocolErrorReason, Result};
use crate::transport::Transport;
use crate::version::V_MIN;
use std::time::Instant;

pub const AUTH_TOKEN: u32 = 1;
pub const AUTH_SIGNATURE: u32 = 2;
pub const AUTH_RSAPUBLICKEY: u32 = 3;

/// The outcome of a completed handshake: enough state to hand off to the
/// multiplexer, plus the transport (now possibly TLS-wrapped).
pub struct Connected {
    pub transport: Box<dyn Transport>,
    pub active_version: u32,
    pub active_max_data: u32,
    pub remote_banner: Vec<u8>,
}

fn send(transport: &mut dyn Transport, frame: &Frame, active_version: u32) -> Result<()> {
    log::trace!("send {:?} arg0={:#x} arg1={:#x}", frame.command, frame.arg0, frame.arg1);
    frame.write_to(transport, active_version)
}

fn recv(transport: &mut dyn Transport, active_version: u32, max_data: u32) -> Result<Frame> {
    let frame = Frame::read_from(transport, active_version, max_data)?;
    log::trace!("recv {:?} arg0={:#x} arg1={:#x}", frame.command, frame.arg0, frame.arg1);
    Ok(frame)
}

fn check_deadline(deadline: Instant) -> Result<()> {
    if Instant::now() >= deadline {
        return Err(AdbError::Timeout);
    }
    Ok(())
}

/// Drive the handshake state machine to completion on `transport`.
///
/// The transport's own read timeout (if any) is the caller's mechanism for
/// preempting an indefinitely blocked `recv_exact`; this function additionally
/// rejects the handshake once `Config::handshake_deadline` has elapsed between
/// steps, matching the "silent for 10s" scenario in §8.
pub fn connect(mut transport: Box<dyn Transport>, config: &Config) -> Result<Connected> {
    let deadline = Instant::now() + config.handshake_deadline;
    let local_version = config.advertised_version;
    let local_max_data = config.advertised_max_data;

    send(
        transport.as_mut(),
        &Frame::cnxn(local_version, local_max_data, &config.system_banner),
        local_version,
    )?;
    log::debug!("handshake: sent CNXN, state=WaitBanner");

    wait_banner(transport, config, deadline, local_version, local_max_data, 0)
}

/// The `WaitBanner` state (§4.4): await CNXN (done), AUTH(TOKEN) (sign or
/// offer our public key), or STLS (upgrade then re-enter this same state over
/// the new transport). Re-entered with a fresh `identity_idx` after a TLS
/// upgrade, since the daemon renegotiates AUTH over the encrypted channel.
fn wait_banner(
    mut transport: Box<dyn Transport>,
    config: &Config,
    deadline: Instant,
    local_version: u32,
    local_max_data: u32,
    mut identity_idx: usize,
) -> Result<Connected> {
    let mut active_version = local_version;

    loop {
        check_deadline(deadline)?;
        let frame = recv(transport.as_mut(), active_version, local_max_data)?;
        match frame.command {
            Command::Cnxn => {
                active_version = std::cmp::min(local_version, frame.arg0);
                let active_max_data = std::cmp::min(local_max_data, frame.arg1);
                log::debug!(
                    "handshake: Connected version={:#x} max_data={:#x}",
                    active_version,
                    active_max_data
                );
                return Ok(Connected {
                    transport,
                    active_version,
                    active_max_data,
                    remote_banner: frame.payload,
                });
            }
            Command::Auth if frame.arg0 == AUTH_TOKEN => {
                if identity_idx < config.identities.len() {
                    let identity = &config.identities[identity_idx];
                    let signature = identity.sign(&frame.payload)?;
                    identity_idx += 1;
                    log::debug!("handshake: AuthSign, identity {identity_idx}");
                    send(
                        transport.as_mut(),
                        &Frame::auth_signature(signature),
                        active_version,
                    )?;
                } else if let Some(identity) = config.identities.first() {
                    log::debug!("handshake: no identities left, offering RSA public key");
                    let encoded = identity.encoded_public()?;
                    send(
                        transport.as_mut(),
                        &Frame::auth_rsa_public_key(encoded),
                        active_version,
                    )?;
                    return wait_user_accept(transport, config, active_version, deadline);
                } else {
                    return Err(AdbError::AuthenticationFailed);
                }
            }
            Command::Stls if matches!(config.tls, TlsPolicy::PreferIfOffered) => {
                return tls_upgrade(
                    transport,
                    config,
                    deadline,
                    active_version,
                    local_version,
                    local_max_data,
                );
            }
            other => {
                log::warn!("handshake: unexpected frame {:?} in WaitBanner", other.command);
                return Err(AdbError::ProtocolError(
                    ProtocolErrorReason::UnexpectedCommandInState,
                ));
            }
        }
    }
}

fn wait_user_accept(
    mut transport: Box<dyn Transport>,
    config: &Config,
    active_version: u32,
    deadline: Instant,
) -> Result<Connected> {
    log::debug!("handshake: WaitUserAccept");
    loop {
        check_deadline(deadline)?;
        let frame = recv(transport.as_mut(), active_version, config.advertised_max_data)?;
        match frame.command {
            Command::Cnxn => {
                let active_version = std::cmp::min(config.advertised_version, frame.arg0);
                let active_max_data = std::cmp::min(config.advertised_max_data, frame.arg1);
                log::debug!("handshake: Connected after key enrolment");
                return Ok(Connected {
                    transport,
                    active_version,
                    active_max_data,
                    remote_banner: frame.payload,
                });
            }
            Command::Auth if frame.arg0 == AUTH_TOKEN => {
                log::warn!("handshake: daemon re-issued AUTH(TOKEN) after RSAPUBLICKEY");
                return Err(AdbError::AuthenticationFailed);
            }
            _ => {
                return Err(AdbError::ProtocolError(
                    ProtocolErrorReason::UnexpectedCommandInState,
                ));
            }
        }
    }
}

/// The `TlsPending` state (§4.4): reply with our own STLS, hand the transport
/// to rustls, then re-enter `WaitBanner` on the upgraded channel.
fn tls_upgrade(
    mut transport: Box<dyn Transport>,
    config: &Config,
    deadline: Instant,
    active_version: u32,
    local_version: u32,
    local_max_data: u32,
) -> Result<Connected> {
    log::debug!("handshake: TlsPending");
    send(transport.as_mut(), &Frame::stls(V_MIN), active_version)?;
    let upgraded = transport.upgrade_to_tls(&config.tls_server_name, &config.tls_verify_policy)?;
    log::debug!("handshake: TLS upgrade complete, state=WaitBanner");
    wait_banner(upgraded, config, deadline, local_version, local_max_data, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keystore::Identity;
    use crate::transport::duplex::duplex_pair;
    use rand::SeedableRng;
    use rsa::RsaPrivateKey;
    use std::thread;

    fn test_identity(label: &str) -> Identity {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        Identity::new(private, label)
    }

    #[test]
    fn plain_connect_scenario_1() {
        let (host, mut daemon) = duplex_pair();
        let config = Config::builder().build();

        let handle = thread::spawn(move || connect(Box::new(host), &config));

        let mut header = [0u8; crate::codec::HEADER_LEN];
        daemon.recv_exact(&mut header).unwrap();
        let data_len = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let mut payload = vec![0u8; data_len as usize];
        daemon.recv_exact(&mut payload).unwrap();
        assert_eq!(&payload, b"host::\0");

        let reply = Frame::cnxn(V_MIN, 0x40000, "device::ro.product.name=pixel;\0");
        daemon.send_all(&reply.encode(V_MIN)).unwrap();

        let connected = handle.join().unwrap().unwrap();
        assert_eq!(connected.active_max_data, 0x40000);
    }

    #[test]
    fn token_signature_accept_scenario_2() {
        let (host, mut daemon) = duplex_pair();
        let identity = test_identity("unknown@host");
        let config = Config::builder().add_identity(identity).build();

        let handle = thread::spawn(move || connect(Box::new(host), &config));

        let mut header = [0u8; crate::codec::HEADER_LEN];
        daemon.recv_exact(&mut header).unwrap();
        let data_len = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let mut payload = vec![0u8; data_len as usize];
        daemon.recv_exact(&mut payload).unwrap();

        let token = vec![0x42u8; 20];
        daemon
            .send_all(&Frame::auth_token(token).encode(V_MIN))
            .unwrap();

        let mut header = [0u8; crate::codec::HEADER_LEN];
        daemon.recv_exact(&mut header).unwrap();
        let data_len = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let mut sig = vec![0u8; data_len as usize];
        daemon.recv_exact(&mut sig).unwrap();
        assert_eq!(sig.len(), 256);

        daemon
            .send_all(
                &Frame::cnxn(V_MIN, 0x40000, "device::\0").encode(V_MIN),
            )
            .unwrap();

        let connected = handle.join().unwrap().unwrap();
        assert_eq!(connected.active_max_data, 0x40000);
    }

    fn read_host_frame(daemon: &mut impl Transport) -> Frame {
        let mut header = [0u8; crate::codec::HEADER_LEN];
        daemon.recv_exact(&mut header).unwrap();
        let data_len = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let mut payload = vec![0u8; data_len as usize];
        daemon.recv_exact(&mut payload).unwrap();
        Frame {
            command: Command::from_u32(u32::from_le_bytes(header[0..4].try_into().unwrap()))
                .unwrap(),
            arg0: u32::from_le_bytes(header[4..8].try_into().unwrap()),
            arg1: u32::from_le_bytes(header[8..12].try_into().unwrap()),
            payload,
        }
    }

    /// Scenario 3: no usable identity on the first pass, daemon prompts
    /// again, second identity signs and is rejected, client finally offers
    /// its RSA public key for enrolment and the daemon accepts it (§8).
    #[test]
    fn key_enrolment_accepted_scenario_3() {
        let (host, mut daemon) = duplex_pair();
        let id_a = test_identity("a@host");
        let id_b = test_identity("b@host");
        let config = Config::builder()
            .add_identity(id_a)
            .add_identity(id_b)
            .build();

        let handle = thread::spawn(move || connect(Box::new(host), &config));

        let _cnxn = read_host_frame(&mut daemon);

        daemon
            .send_all(&Frame::auth_token(vec![0x11u8; 20]).encode(V_MIN))
            .unwrap();
        let sig1 = read_host_frame(&mut daemon);
        assert_eq!(sig1.command, Command::Auth);
        assert_eq!(sig1.arg0, AUTH_SIGNATURE);

        daemon
            .send_all(&Frame::auth_token(vec![0x22u8; 20]).encode(V_MIN))
            .unwrap();
        let sig2 = read_host_frame(&mut daemon);
        assert_eq!(sig2.arg0, AUTH_SIGNATURE);

        daemon
            .send_all(&Frame::auth_token(vec![0x33u8; 20]).encode(V_MIN))
            .unwrap();
        let pubkey = read_host_frame(&mut daemon);
        assert_eq!(pubkey.command, Command::Auth);
        assert_eq!(pubkey.arg0, AUTH_RSAPUBLICKEY);

        daemon
            .send_all(&Frame::cnxn(V_MIN, 0x1000, "device::\0").encode(V_MIN))
            .unwrap();

        let connected = handle.join().unwrap().unwrap();
        assert_eq!(connected.active_max_data, 0x1000);
    }

    /// Scenario 4: same as scenario 3, but the daemon re-issues an
    /// AUTH(TOKEN) after the RSA public key instead of accepting it.
    #[test]
    fn key_enrolment_rejected_scenario_4() {
        let (host, mut daemon) = duplex_pair();
        let id_a = test_identity("a@host");
        let config = Config::builder().add_identity(id_a).build();

        let handle = thread::spawn(move || connect(Box::new(host), &config));

        let _cnxn = read_host_frame(&mut daemon);

        daemon
            .send_all(&Frame::auth_token(vec![0x11u8; 20]).encode(V_MIN))
            .unwrap();
        let sig1 = read_host_frame(&mut daemon);
        assert_eq!(sig1.arg0, AUTH_SIGNATURE);

        daemon
            .send_all(&Frame::auth_token(vec![0x22u8; 20]).encode(V_MIN))
            .unwrap();
        let pubkey = read_host_frame(&mut daemon);
        assert_eq!(pubkey.arg0, AUTH_RSAPUBLICKEY);

        daemon
            .send_all(&Frame::auth_token(vec![0x33u8; 20]).encode(V_MIN))
            .unwrap();

        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, AdbError::AuthenticationFailed));
    }

    /// When the daemon offers STLS, the client must reply with its own STLS
    /// frame and actually attempt the upgrade rather than silently accepting
    /// the plaintext connection. The in-memory duplex transport has no real
    /// socket to hand to rustls, so the attempt surfaces as a `Crypto` error
    /// instead of the handshake either hanging or pretending to succeed.
    #[test]
    fn offered_stls_is_acknowledged_and_upgrade_is_attempted() {
        let (host, mut daemon) = duplex_pair();
        let config = Config::builder().build();

        let handle = thread::spawn(move || connect(Box::new(host), &config));

        let _cnxn = read_host_frame(&mut daemon);

        daemon
            .send_all(&Frame::stls(V_MIN).encode(V_MIN))
            .unwrap();
        let stls_reply = read_host_frame(&mut daemon);
        assert_eq!(stls_reply.command, Command::Stls);

        let err = handle.join().unwrap().unwrap_err();
        assert!(matches!(err, AdbError::Crypto(_)));
    }
}
