//! Conversions between russh's typed request arguments and the RFC 4254
//! payloads the relay carries.
//!
//! russh parses channel and global requests before handing them to us and
//! expects typed arguments when sending them, while the relay core only
//! moves opaque payloads. Everything here is a plain encode/decode pair.

use bytes::{Bytes, BytesMut};
use russh::{Pty, Sig};

use crate::wire::{put_bool, put_string, put_u32, DecodeError, Reader};

/// Arguments of a `pty-req` request.
#[derive(Debug, Clone, PartialEq)]
pub struct PtyRequest {
    pub term: String,
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
    pub modes: Vec<(Pty, u32)>,
}

impl PtyRequest {
    pub fn encode(&self) -> Bytes {
        let mut modes = BytesMut::with_capacity(self.modes.len() * 5 + 1);
        for (op, value) in &self.modes {
            modes.extend_from_slice(&[*op as u8]);
            put_u32(&mut modes, *value);
        }
        modes.extend_from_slice(&[0]);

        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.term);
        put_u32(&mut buf, self.col_width);
        put_u32(&mut buf, self.row_height);
        put_u32(&mut buf, self.pix_width);
        put_u32(&mut buf, self.pix_height);
        put_string(&mut buf, &modes);
        buf.freeze()
    }

    /// Unknown terminal mode opcodes are dropped, as russh does.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        let term = r.read_str()?.to_string();
        let col_width = r.read_u32()?;
        let row_height = r.read_u32()?;
        let pix_width = r.read_u32()?;
        let pix_height = r.read_u32()?;

        let mut modes = Vec::new();
        let mut m = Reader::new(r.read_bytes()?);
        while !m.is_empty() {
            let op = m.read_u8()?;
            if op == 0 || op >= 160 {
                break;
            }
            let value = m.read_u32()?;
            if let Some(op) = Pty::from_u8(op) {
                modes.push((op, value));
            }
        }

        Ok(Self {
            term,
            col_width,
            row_height,
            pix_width,
            pix_height,
            modes,
        })
    }
}

/// Arguments of a `window-change` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowChange {
    pub col_width: u32,
    pub row_height: u32,
    pub pix_width: u32,
    pub pix_height: u32,
}

impl WindowChange {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        put_u32(&mut buf, self.col_width);
        put_u32(&mut buf, self.row_height);
        put_u32(&mut buf, self.pix_width);
        put_u32(&mut buf, self.pix_height);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            col_width: r.read_u32()?,
            row_height: r.read_u32()?,
            pix_width: r.read_u32()?,
            pix_height: r.read_u32()?,
        })
    }
}

/// Arguments of an `x11-req` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Request {
    pub single_connection: bool,
    pub auth_protocol: String,
    pub auth_cookie: String,
    pub screen_number: u32,
}

impl X11Request {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_bool(&mut buf, self.single_connection);
        put_string(&mut buf, &self.auth_protocol);
        put_string(&mut buf, &self.auth_cookie);
        put_u32(&mut buf, self.screen_number);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            single_connection: r.read_bool()?,
            auth_protocol: r.read_str()?.to_string(),
            auth_cookie: r.read_str()?.to_string(),
            screen_number: r.read_u32()?,
        })
    }
}

/// Arguments of an `exit-signal` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    pub signal_name: String,
    pub core_dumped: bool,
    pub error_message: String,
    pub lang_tag: String,
}

impl ExitSignal {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.signal_name);
        put_bool(&mut buf, self.core_dumped);
        put_string(&mut buf, &self.error_message);
        put_string(&mut buf, &self.lang_tag);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            signal_name: r.read_str()?.to_string(),
            core_dumped: r.read_bool()?,
            error_message: r.read_str()?.to_string(),
            lang_tag: r.read_str()?.to_string(),
        })
    }
}

/// Endpoints carried in the extra data of `direct-tcpip` and
/// `forwarded-tcpip` channel opens (RFC 4254 §7.1, §7.2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpipEndpoints {
    pub host: String,
    pub port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

impl TcpipEndpoints {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.host);
        put_u32(&mut buf, self.port);
        put_string(&mut buf, &self.originator_address);
        put_u32(&mut buf, self.originator_port);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            host: r.read_str()?.to_string(),
            port: r.read_u32()?,
            originator_address: r.read_str()?.to_string(),
            originator_port: r.read_u32()?,
        })
    }
}

/// Payload of `tcpip-forward` and `cancel-tcpip-forward`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRequest {
    pub address: String,
    pub port: u32,
}

impl ForwardRequest {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        put_string(&mut buf, &self.address);
        put_u32(&mut buf, self.port);
        buf.freeze()
    }

    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(payload);
        Ok(Self {
            address: r.read_str()?.to_string(),
            port: r.read_u32()?,
        })
    }
}

/// A payload made of one SSH string (`exec`, `subsystem`, `signal`).
pub fn string_payload(value: impl AsRef<[u8]>) -> Bytes {
    let value = value.as_ref();
    let mut buf = BytesMut::with_capacity(4 + value.len());
    put_string(&mut buf, value);
    buf.freeze()
}

pub fn read_string_payload(payload: &[u8]) -> Result<&[u8], DecodeError> {
    Reader::new(payload).read_bytes()
}

/// A payload made of one u32 (`exit-status`, the bound port of a
/// `tcpip-forward` reply).
pub fn u32_payload(value: u32) -> Bytes {
    let mut buf = BytesMut::with_capacity(4);
    put_u32(&mut buf, value);
    buf.freeze()
}

pub fn read_u32_payload(payload: &[u8]) -> Result<u32, DecodeError> {
    Reader::new(payload).read_u32()
}

/// A payload made of one boolean (`xon-xoff`).
pub fn bool_payload(value: bool) -> Bytes {
    let mut buf = BytesMut::with_capacity(1);
    put_bool(&mut buf, value);
    buf.freeze()
}

pub fn read_bool_payload(payload: &[u8]) -> Result<bool, DecodeError> {
    Reader::new(payload).read_bool()
}

/// Signal name without the `SIG` prefix, as sent on the wire.
pub fn sig_name(sig: &Sig) -> &str {
    match sig {
        Sig::ABRT => "ABRT",
        Sig::ALRM => "ALRM",
        Sig::FPE => "FPE",
        Sig::HUP => "HUP",
        Sig::ILL => "ILL",
        Sig::INT => "INT",
        Sig::KILL => "KILL",
        Sig::PIPE => "PIPE",
        Sig::QUIT => "QUIT",
        Sig::SEGV => "SEGV",
        Sig::TERM => "TERM",
        Sig::USR1 => "USR1",
        Sig::Custom(name) => name,
    }
}

pub fn sig_from_name(name: &str) -> Sig {
    match name {
        "ABRT" => Sig::ABRT,
        "ALRM" => Sig::ALRM,
        "FPE" => Sig::FPE,
        "HUP" => Sig::HUP,
        "ILL" => Sig::ILL,
        "INT" => Sig::INT,
        "KILL" => Sig::KILL,
        "PIPE" => Sig::PIPE,
        "QUIT" => Sig::QUIT,
        "SEGV" => Sig::SEGV,
        "TERM" => Sig::TERM,
        "USR1" => Sig::USR1,
        other => Sig::Custom(other.to_string()),
    }
}
