//! # Contacts
//!
//! A [`Contact`] is a node identity plus the address it can be reached at.
//! Contacts are plain values: they are copied wherever they travel and never
//! shared mutably.
//!
//! ## Wire forms
//!
//! | Form | Layout | Used by |
//! |------|--------|---------|
//! | list | `[id, "ip", port]` | `findNode` replies and `findValue` fallback |
//! | compact | `ip (4 or 16) ‖ port (u16 BE) ‖ id` | `findValue` replies that found the value |

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::bencode::Value;
use crate::bits::{Bitmap, NODE_ID_LENGTH};
use crate::messages::DecodeError;

/// Compact length of a contact with an IPv4 address.
pub const COMPACT_V4_LENGTH: usize = 4 + 2 + NODE_ID_LENGTH;

/// Compact length of a contact with an IPv6 address.
pub const COMPACT_V6_LENGTH: usize = 16 + 2 + NODE_ID_LENGTH;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Contact {
    pub id: Bitmap,
    pub ip: IpAddr,
    pub port: u16,
}

impl Contact {
    pub fn new(id: Bitmap, addr: SocketAddr) -> Self {
        Self {
            id,
            ip: addr.ip(),
            port: addr.port(),
        }
    }

    #[inline]
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Same reachability, ignoring the id.
    #[inline]
    pub fn same_addr(&self, addr: &SocketAddr) -> bool {
        self.ip == addr.ip() && self.port == addr.port()
    }

    pub fn to_bencode(&self) -> Value {
        Value::List(vec![
            Value::bytes(self.id.as_bytes().to_vec()),
            Value::bytes(self.ip.to_string()),
            Value::Int(i64::from(self.port)),
        ])
    }

    pub fn from_bencode(value: &Value) -> Result<Self, DecodeError> {
        let items = value
            .as_list()
            .ok_or_else(|| DecodeError::MalformedContact("contact is not a list".into()))?;
        let [id, ip, port] = items else {
            return Err(DecodeError::MalformedContact(format!(
                "contact has {} fields, expected 3",
                items.len()
            )));
        };
        let id = id
            .as_bytes()
            .ok_or_else(|| DecodeError::MalformedContact("contact id is not a string".into()))
            .and_then(|b| Bitmap::try_from_slice(b).map_err(DecodeError::from))?;
        let ip = ip
            .as_bytes()
            .and_then(|b| std::str::from_utf8(b).ok())
            .and_then(|s| s.parse::<IpAddr>().ok())
            .ok_or_else(|| DecodeError::MalformedContact("contact ip is not an address".into()))?;
        let port = port
            .as_int()
            .and_then(|p| u16::try_from(p).ok())
            .ok_or_else(|| DecodeError::MalformedContact("contact port out of range".into()))?;
        Ok(Self { id, ip, port })
    }

    pub fn marshal_compact(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(COMPACT_V6_LENGTH);
        match self.ip {
            IpAddr::V4(v4) => out.extend_from_slice(&v4.octets()),
            IpAddr::V6(v6) => out.extend_from_slice(&v6.octets()),
        }
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(self.id.as_bytes());
        out
    }

    pub fn unmarshal_compact(data: &[u8]) -> Result<Self, DecodeError> {
        let ip_len = match data.len() {
            COMPACT_V4_LENGTH => 4,
            COMPACT_V6_LENGTH => 16,
            other => {
                return Err(DecodeError::MalformedContact(format!(
                    "compact contact is {} bytes, expected {} or {}",
                    other, COMPACT_V4_LENGTH, COMPACT_V6_LENGTH
                )));
            }
        };
        let (ip_bytes, rest) = data.split_at(ip_len);
        let ip = if ip_len == 4 {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(ip_bytes);
            IpAddr::V4(Ipv4Addr::from(octets))
        } else {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(ip_bytes);
            IpAddr::V6(Ipv6Addr::from(octets))
        };
        let port = u16::from_be_bytes([rest[0], rest[1]]);
        let id = Bitmap::try_from_slice(&rest[2..])?;
        Ok(Self { id, ip, port })
    }
}

impl fmt::Debug for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Contact({}@{})", self.id.hex_short(), self.addr())
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id.hex_short(), self.addr())
    }
}
