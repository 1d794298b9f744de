// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::ops::Deref;
use core::str::FromStr;
use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use std::net::Ipv6Addr;

/// A MAC address.
#[derive(Clone, Copy, Default, Eq, Ord, PartialEq, PartialOrd, Hash)]
pub struct MacAddr {
    inner: [u8; 6],
}

impl MacAddr {
    pub const BROADCAST: Self = Self { inner: [0xFF; 6] };
    pub const ZERO: Self = Self { inner: [0x00; 6] };

    /// The group bit. Used both as a value and as a mask to match
    /// any multicast or broadcast destination.
    pub const MULTICAST: Self = Self { inner: [0x01, 0, 0, 0, 0, 0] };

    /// Return the bytes of the MAC address.
    #[inline]
    pub fn bytes(&self) -> [u8; 6] {
        self.inner
    }

    pub const fn from_const(bytes: [u8; 6]) -> Self {
        Self { inner: bytes }
    }

    pub fn is_multicast(&self) -> bool {
        self.inner[0] & 0x01 != 0
    }

    /// The IPv6 link-local address derived from this MAC using the
    /// modified EUI-64 format (RFC 4291 §2.5.1).
    pub fn to_link_local(&self) -> Ipv6Addr {
        let m = self.inner;
        Ipv6Addr::from([
            0xfe,
            0x80,
            0,
            0,
            0,
            0,
            0,
            0,
            m[0] ^ 0x02,
            m[1],
            m[2],
            0xff,
            0xfe,
            m[3],
            m[4],
            m[5],
        ])
    }

    /// Pack the address into the low 48 bits of a `u64`, first octet
    /// in the least significant byte.
    pub fn to_u64_le(&self) -> u64 {
        let mut b = [0u8; 8];
        b[..6].copy_from_slice(&self.inner);
        u64::from_le_bytes(b)
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(bytes: [u8; 6]) -> Self {
        Self { inner: bytes }
    }
}

impl From<&[u8; 6]> for MacAddr {
    fn from(bytes: &[u8; 6]) -> Self {
        Self { inner: *bytes }
    }
}

impl AsRef<[u8]> for MacAddr {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}

impl Deref for MacAddr {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let octets: Vec<u8> = s
            .split(':')
            .map(|s| {
                u8::from_str_radix(s, 16).map_err(|_| format!("bad octet: {s}"))
            })
            .collect::<Result<Vec<u8>, _>>()?;

        let bytes: [u8; 6] = octets.as_slice().try_into().map_err(|_| {
            format!("incorrect number of bytes: {}", octets.len())
        })?;

        Ok(MacAddr { inner: bytes })
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.inner[0],
            self.inner[1],
            self.inner[2],
            self.inner[3],
            self.inner[4],
            self.inner[5]
        )
    }
}

// There's no reason to view the MAC address as its raw array, so just
// present it in a human-friendly manner.
impl Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MacAddr {{ inner: {self} }}")
    }
}

// Policy files carry MACs in their textual form.
impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
