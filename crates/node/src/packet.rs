//! Wire packet framing.
//!
//! Header layout (27 bytes), followed by the verb payload:
//!
//! ```text
//! [0..8)   packet ID (big-endian u64, nonzero)
//! [8..13)  destination address
//! [13..18) source address
//! [18]     verb
//! [19..27) auth tag (truncated HMAC-SHA256, zero when unarmored)
//! ```
//!
//! HELLO travels unarmored since it is what establishes the peer's identity
//! in the first place; everything else carries a tag keyed by the session
//! key agreed with the peer. The per-peer session machinery beyond key
//! agreement lives outside this crate.

use anyhow::{bail, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::constants::MAX_UDP_PAYLOAD;
use crate::identity::{Address, ADDRESS_LENGTH};

pub const HEADER_LENGTH: usize = 27;
const IDX_VERB: usize = 18;
const IDX_TAG: usize = 19;
const TAG_LENGTH: usize = 8;

/// Wire verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verb {
    Nop = 0x00,
    Hello = 0x01,
    Error = 0x02,
    Ok = 0x03,
    Whois = 0x04,
    Rendezvous = 0x05,
    Frame = 0x06,
    MulticastLike = 0x07,
    MulticastFrame = 0x08,
    NetworkConfigRequest = 0x09,
}

impl Verb {
    pub fn from_u8(v: u8) -> Option<Verb> {
        match v {
            0x00 => Some(Verb::Nop),
            0x01 => Some(Verb::Hello),
            0x02 => Some(Verb::Error),
            0x03 => Some(Verb::Ok),
            0x04 => Some(Verb::Whois),
            0x05 => Some(Verb::Rendezvous),
            0x06 => Some(Verb::Frame),
            0x07 => Some(Verb::MulticastLike),
            0x08 => Some(Verb::MulticastFrame),
            0x09 => Some(Verb::NetworkConfigRequest),
            _ => None,
        }
    }
}

/// Wire error codes carried in ERROR packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ErrorCode {
    None = 0x00,
    InvalidRequest = 0x01,
    UnsupportedOperation = 0x02,
    BadProtocolVersion = 0x03,
    ObjNotFound = 0x04,
}

impl ErrorCode {
    pub fn from_u8(v: u8) -> Option<ErrorCode> {
        match v {
            0x00 => Some(ErrorCode::None),
            0x01 => Some(ErrorCode::InvalidRequest),
            0x02 => Some(ErrorCode::UnsupportedOperation),
            0x03 => Some(ErrorCode::BadProtocolVersion),
            0x04 => Some(ErrorCode::ObjNotFound),
            _ => None,
        }
    }
}

/// A wire packet under construction or freshly parsed.
#[derive(Debug, Clone)]
pub struct Packet {
    buf: Vec<u8>,
}

impl Packet {
    pub fn new(dest: Address, source: Address, verb: Verb, packet_id: u64) -> Self {
        let mut buf = Vec::with_capacity(HEADER_LENGTH + 64);
        buf.extend_from_slice(&packet_id.to_be_bytes());
        buf.extend_from_slice(&dest.0);
        buf.extend_from_slice(&source.0);
        buf.push(verb as u8);
        buf.extend_from_slice(&[0u8; TAG_LENGTH]);
        Self { buf }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LENGTH {
            bail!("packet shorter than header ({} bytes)", data.len());
        }
        if data.len() > MAX_UDP_PAYLOAD {
            bail!("packet exceeds maximum size ({} bytes)", data.len());
        }
        if Verb::from_u8(data[IDX_VERB]).is_none() {
            bail!("unknown verb 0x{:02x}", data[IDX_VERB]);
        }
        Ok(Self { buf: data.to_vec() })
    }

    pub fn packet_id(&self) -> u64 {
        u64::from_be_bytes(self.buf[0..8].try_into().unwrap())
    }

    pub fn destination(&self) -> Address {
        let mut a = [0u8; ADDRESS_LENGTH];
        a.copy_from_slice(&self.buf[8..13]);
        Address(a)
    }

    pub fn source(&self) -> Address {
        let mut a = [0u8; ADDRESS_LENGTH];
        a.copy_from_slice(&self.buf[13..18]);
        Address(a)
    }

    pub fn verb(&self) -> Verb {
        // parse() and new() both guarantee a known verb byte
        Verb::from_u8(self.buf[IDX_VERB]).unwrap()
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_LENGTH..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn append_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn append_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn append_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn append_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn append_bytes(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }

    /// Stamp the auth tag using the given session key.
    pub fn armor(&mut self, key: &[u8; 32]) {
        self.buf[IDX_TAG..IDX_TAG + TAG_LENGTH].fill(0);
        let tag = self.compute_tag(key);
        self.buf[IDX_TAG..IDX_TAG + TAG_LENGTH].copy_from_slice(&tag);
    }

    /// Verify the auth tag in constant time.
    pub fn dearmor(&self, key: &[u8; 32]) -> bool {
        let mut copy = self.buf.clone();
        copy[IDX_TAG..IDX_TAG + TAG_LENGTH].fill(0);
        let expected = Self { buf: copy }.compute_tag(key);
        expected
            .ct_eq(&self.buf[IDX_TAG..IDX_TAG + TAG_LENGTH])
            .into()
    }

    /// True when the tag field is all zeros (HELLO and other pre-session
    /// traffic).
    pub fn is_unarmored(&self) -> bool {
        self.buf[IDX_TAG..IDX_TAG + TAG_LENGTH].iter().all(|b| *b == 0)
    }

    fn compute_tag(&self, key: &[u8; 32]) -> [u8; TAG_LENGTH] {
        let mut mac = Hmac::<Sha256>::new_from_slice(key).expect("hmac accepts any key length");
        mac.update(&self.buf);
        let full = mac.finalize().into_bytes();
        let mut tag = [0u8; TAG_LENGTH];
        tag.copy_from_slice(&full[..TAG_LENGTH]);
        tag
    }
}

/// Payload cursor for parsing verb bodies.
pub struct Reader<'a> {
    data: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, at: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.at
    }

    pub fn u8(&mut self) -> Result<u8> {
        let b = *self.data.get(self.at).ok_or_else(|| truncated())?;
        self.at += 1;
        Ok(b)
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(truncated());
        }
        let s = &self.data[self.at..self.at + n];
        self.at += n;
        Ok(s)
    }
}

fn truncated() -> anyhow::Error {
    anyhow::anyhow!("truncated packet payload")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(b: u8) -> Address {
        Address([b, b, b, b, b])
    }

    #[test]
    fn build_and_parse() {
        let mut p = Packet::new(addr(1), addr(2), Verb::Ok, 0x1122334455667788);
        p.append_u8(Verb::NetworkConfigRequest as u8);
        p.append_u64(0x1a);
        p.append_u64(0xdeadbeef);
        p.append_u16(3);
        p.append_bytes(b"abc");

        let parsed = Packet::parse(p.as_bytes()).unwrap();
        assert_eq!(parsed.packet_id(), 0x1122334455667788);
        assert_eq!(parsed.destination(), addr(1));
        assert_eq!(parsed.source(), addr(2));
        assert_eq!(parsed.verb(), Verb::Ok);

        let mut r = Reader::new(parsed.payload());
        assert_eq!(r.u8().unwrap(), Verb::NetworkConfigRequest as u8);
        assert_eq!(r.u64().unwrap(), 0x1a);
        assert_eq!(r.u64().unwrap(), 0xdeadbeef);
        let len = r.u16().unwrap() as usize;
        assert_eq!(r.take(len).unwrap(), b"abc");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn armor_round_trip_and_rejection() {
        let key = [7u8; 32];
        let mut p = Packet::new(addr(1), addr(2), Verb::Frame, 42);
        p.append_bytes(b"payload");
        assert!(p.is_unarmored());

        p.armor(&key);
        assert!(!p.is_unarmored());
        assert!(p.dearmor(&key));

        let wrong = [8u8; 32];
        assert!(!p.dearmor(&wrong));
    }

    #[test]
    fn short_and_unknown_packets_rejected() {
        assert!(Packet::parse(&[0u8; 10]).is_err());

        let mut raw = Packet::new(addr(1), addr(2), Verb::Nop, 1).as_bytes().to_vec();
        raw[18] = 0x7f; // not a verb
        assert!(Packet::parse(&raw).is_err());
    }
}
