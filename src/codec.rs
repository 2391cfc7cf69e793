//! Wire framing: the 24-byte ADB header, payload checksum, and magic invariants.

use crate::error::{AdbError, ProtocolErrorReason, Result};
use crate::version::{V_MIN, V_SKIP_CHECKSUM};
use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::Read;

pub const HEADER_LEN: usize = 24;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u32)]
pub enum Command {
    Sync = 0x434e_5953,
    Cnxn = 0x4e58_4e43,
    Auth = 0x4854_5541,
    Open = 0x4e45_504f,
    Okay = 0x5941_4b4f,
    Clse = 0x4553_4c43,
    Wrte = 0x4554_5257,
    Stls = 0x534c_5453,
}

impl Command {
    pub fn from_u32(cmd: u32) -> Option<Self> {
        Some(match cmd {
            c if c == Self::Sync as u32 => Self::Sync,
            c if c == Self::Cnxn as u32 => Self::Cnxn,
            c if c == Self::Auth as u32 => Self::Auth,
            c if c == Self::Open as u32 => Self::Open,
            c if c == Self::Okay as u32 => Self::Okay,
            c if c == Self::Clse as u32 => Self::Clse,
            c if c == Self::Wrte as u32 => Self::Wrte,
            c if c == Self::Stls as u32 => Self::Stls,
            _ => return None,
        })
    }
}

/// Unsigned byte sum of the payload, wrapping on overflow. Per §4.1, this is stored
/// even when the active protocol version doesn't require peers to validate it.
pub fn checksum(payload: &[u8]) -> u32 {
    payload.iter().fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
}

/// An immutable decoded/to-be-encoded ADB frame.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub command: Command,
    pub arg0: u32,
    pub arg1: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(command: Command, arg0: u32, arg1: u32, payload: Vec<u8>) -> Self {
        Self {
            command,
            arg0,
            arg1,
            payload,
        }
    }

    pub fn cnxn(version: u32, max_data: u32, system_banner: &str) -> Self {
        let mut payload = Vec::with_capacity(system_banner.len() + 1);
        payload.extend_from_slice(system_banner.as_bytes());
        if !system_banner.ends_with('\0') {
            payload.push(0);
        }
        Self::new(Command::Cnxn, version, max_data, payload)
    }

    pub fn auth_token(token: Vec<u8>) -> Self {
        Self::new(Command::Auth, crate::handshake::AUTH_TOKEN, 0, token)
    }

    pub fn auth_signature(signature: Vec<u8>) -> Self {
        Self::new(Command::Auth, crate::handshake::AUTH_SIGNATURE, 0, signature)
    }

    pub fn auth_rsa_public_key(encoded: Vec<u8>) -> Self {
        Self::new(Command::Auth, crate::handshake::AUTH_RSAPUBLICKEY, 0, encoded)
    }

    pub fn stls(version: u32) -> Self {
        Self::new(Command::Stls, version, 0, Vec::new())
    }

    pub fn open(local_id: u32, destination: &str) -> Self {
        let mut payload = Vec::with_capacity(destination.len() + 1);
        payload.extend_from_slice(destination.as_bytes());
        payload.push(0);
        Self::new(Command::Open, local_id, 0, payload)
    }

    pub fn okay(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Okay, local_id, remote_id, Vec::new())
    }

    pub fn wrte(local_id: u32, remote_id: u32, data: Vec<u8>) -> Self {
        Self::new(Command::Wrte, local_id, remote_id, data)
    }

    pub fn clse(local_id: u32, remote_id: u32) -> Self {
        Self::new(Command::Clse, local_id, remote_id, Vec::new())
    }

    /// Encode this frame's 24-byte header plus payload.
    ///
    /// The checksum is emitted as 0 when `active_version` is `V_SKIP_CHECKSUM`,
    /// matching §4.1: "MUST still be set to 0 on transmit when the active version
    /// is V_SKIP_CHECKSUM, else to the sum".
    pub fn encode(&self, active_version: u32) -> Vec<u8> {
        let cmd = self.command as u32;
        let data_checksum = if active_version >= V_SKIP_CHECKSUM {
            0
        } else {
            checksum(&self.payload)
        };
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());
        buf.write_u32::<LE>(cmd).unwrap();
        buf.write_u32::<LE>(self.arg0).unwrap();
        buf.write_u32::<LE>(self.arg1).unwrap();
        buf.write_u32::<LE>(self.payload.len() as u32).unwrap();
        buf.write_u32::<LE>(data_checksum).unwrap();
        buf.write_u32::<LE>(cmd ^ 0xffff_ffff).unwrap();
        buf.extend_from_slice(&self.payload);
        buf
    }

    /// Send this frame's encoding to `transport` in one call.
    pub fn write_to(&self, transport: &mut dyn crate::transport::Transport, active_version: u32) -> Result<()> {
        transport.send_all(&self.encode(active_version))
    }

    /// Read one frame directly off `transport`, reading the header first to
    /// learn `data_len` before reading the payload (unlike `decode`, which
    /// expects the whole frame already buffered behind a `Read`).
    pub fn read_from(
        transport: &mut dyn crate::transport::Transport,
        active_version: u32,
        max_data: u32,
    ) -> Result<Self> {
        let mut header = [0u8; HEADER_LEN];
        transport.recv_exact(&mut header)?;
        let command_word = u32::from_le_bytes(header[0..4].try_into().unwrap());
        let arg0 = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let arg1 = u32::from_le_bytes(header[8..12].try_into().unwrap());
        let data_len = u32::from_le_bytes(header[12..16].try_into().unwrap());
        let data_checksum = u32::from_le_bytes(header[16..20].try_into().unwrap());
        let magic = u32::from_le_bytes(header[20..24].try_into().unwrap());

        if command_word ^ 0xffff_ffff != magic {
            return Err(AdbError::ProtocolError(ProtocolErrorReason::BadMagic));
        }
        let command = Command::from_u32(command_word).ok_or(AdbError::ProtocolError(
            ProtocolErrorReason::UnknownCommand(command_word),
        ))?;
        if data_len > max_data {
            return Err(AdbError::ProtocolError(ProtocolErrorReason::OversizePayload));
        }

        let mut payload = vec![0u8; data_len as usize];
        if data_len > 0 {
            transport.recv_exact(&mut payload)?;
        }

        let must_verify_checksum =
            active_version <= V_MIN || (command == Command::Cnxn && arg0 <= V_MIN);
        if must_verify_checksum && checksum(&payload) != data_checksum {
            return Err(AdbError::ProtocolError(ProtocolErrorReason::ChecksumMismatch));
        }

        Ok(Self {
            command,
            arg0,
            arg1,
            payload,
        })
    }

    /// Decode a frame from `r`, validating magic, command, size bound and (when
    /// required) checksum per §4.1.
    pub fn decode(r: &mut impl Read, active_version: u32, max_data: u32) -> Result<Self> {
        let command_word = r.read_u32::<LE>()?;
        let arg0 = r.read_u32::<LE>()?;
        let arg1 = r.read_u32::<LE>()?;
        let data_len = r.read_u32::<LE>()?;
        let data_checksum = r.read_u32::<LE>()?;
        let magic = r.read_u32::<LE>()?;

        if command_word ^ 0xffff_ffff != magic {
            return Err(AdbError::ProtocolError(ProtocolErrorReason::BadMagic));
        }
        let command = Command::from_u32(command_word).ok_or(AdbError::ProtocolError(
            ProtocolErrorReason::UnknownCommand(command_word),
        ))?;
        if data_len > max_data {
            return Err(AdbError::ProtocolError(ProtocolErrorReason::OversizePayload));
        }

        let mut payload = vec![0u8; data_len as usize];
        r.read_exact(&mut payload)?;

        let must_verify_checksum =
            active_version <= V_MIN || (command == Command::Cnxn && arg0 <= V_MIN);
        if must_verify_checksum && checksum(&payload) != data_checksum {
            return Err(AdbError::ProtocolError(ProtocolErrorReason::ChecksumMismatch));
        }

        Ok(Self {
            command,
            arg0,
            arg1,
            payload,
        })
    }
}
