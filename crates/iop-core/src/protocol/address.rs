//! JAUS component addresses.
//!
//! A JAUS address identifies one component as `subsystem.node.component`,
//! written in text as e.g. `127.100.1`.  On the wire it is a 32-bit
//! little-endian integer `subsystem << 16 | node << 8 | component`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid JAUS address `{0}` (expected subsystem.node.component, e.g. 127.100.1)")]
pub struct AddressParseError(pub String);

/// `subsystem.node.component` identifier of a JAUS component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct JausAddress {
    pub subsystem: u16,
    pub node: u8,
    pub component: u8,
}

impl JausAddress {
    /// Every component of every node of every subsystem.
    pub const BROADCAST: JausAddress = JausAddress::new(0xFFFF, 0xFF, 0xFF);

    pub const fn new(subsystem: u16, node: u8, component: u8) -> Self {
        Self {
            subsystem,
            node,
            component,
        }
    }

    pub fn to_u32(self) -> u32 {
        (u32::from(self.subsystem) << 16) | (u32::from(self.node) << 8) | u32::from(self.component)
    }

    pub fn from_u32(raw: u32) -> Self {
        Self {
            subsystem: (raw >> 16) as u16,
            node: (raw >> 8) as u8,
            component: raw as u8,
        }
    }

    pub fn to_le_bytes(self) -> [u8; 4] {
        self.to_u32().to_le_bytes()
    }

    pub fn from_le_bytes(bytes: [u8; 4]) -> Self {
        Self::from_u32(u32::from_le_bytes(bytes))
    }
}

impl fmt::Display for JausAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.subsystem, self.node, self.component)
    }
}

impl FromStr for JausAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || AddressParseError(s.to_string());
        let mut parts = s.trim().split('.');
        let (Some(subsystem), Some(node), Some(component), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(err());
        };
        Ok(Self {
            subsystem: subsystem.parse().map_err(|_| err())?,
            node: node.parse().map_err(|_| err())?,
            component: component.parse().map_err(|_| err())?,
        })
    }
}

impl TryFrom<String> for JausAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<JausAddress> for String {
    fn from(value: JausAddress) -> Self {
        value.to_string()
    }
}
