//! RTP packet parsing and serialization (RFC 3550 fixed header).
//!
//! The bridge never decodes audio; packets are parsed only far enough to
//! relabel sequence numbers and payload types before forwarding.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, Result};

const FIXED_HEADER_LEN: usize = 12;

/// RTP fixed header plus contributing sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
    /// CSRC list; empty for every source this bridge talks to, but carried so
    /// forwarded packets survive re-serialization unchanged.
    pub csrcs: Vec<u32>,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32) -> Self {
        Self {
            version: 2,
            padding: false,
            extension: false,
            marker: false,
            payload_type,
            sequence,
            timestamp,
            ssrc,
            csrcs: Vec::new(),
        }
    }

    fn wire_len(&self) -> usize {
        FIXED_HEADER_LEN + self.csrcs.len() * 4
    }

    fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(Error::Media(format!(
                "rtp packet too short: {} bytes",
                data.len()
            )));
        }

        let first = data[0];
        let version = first >> 6;
        if version != 2 {
            return Err(Error::Media(format!("unsupported rtp version {version}")));
        }
        let padding = (first >> 5) & 1 == 1;
        let extension = (first >> 4) & 1 == 1;
        let csrc_count = (first & 0x0f) as usize;

        let second = data[1];
        let marker = (second >> 7) & 1 == 1;
        let payload_type = second & 0x7f;

        let header_len = FIXED_HEADER_LEN + csrc_count * 4;
        if data.len() < header_len {
            return Err(Error::Media(format!(
                "rtp packet truncated: {} bytes with {csrc_count} csrcs",
                data.len()
            )));
        }

        let sequence = u16::from_be_bytes([data[2], data[3]]);
        let timestamp = u32::from_be_bytes([data[4], data[5], data[6], data[7]]);
        let ssrc = u32::from_be_bytes([data[8], data[9], data[10], data[11]]);
        let csrcs = (0..csrc_count)
            .map(|index| {
                let at = FIXED_HEADER_LEN + index * 4;
                u32::from_be_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
            })
            .collect();

        Ok((
            Self {
                version,
                padding,
                extension,
                marker,
                payload_type,
                sequence,
                timestamp,
                ssrc,
                csrcs,
            },
            header_len,
        ))
    }

    fn write(&self, buf: &mut BytesMut) {
        let first = (self.version << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | (self.csrcs.len() as u8 & 0x0f);
        buf.put_u8(first);
        buf.put_u8(((self.marker as u8) << 7) | (self.payload_type & 0x7f));
        buf.put_u16(self.sequence);
        buf.put_u32(self.timestamp);
        buf.put_u32(self.ssrc);
        for csrc in &self.csrcs {
            buf.put_u32(*csrc);
        }
    }
}

/// One RTP packet: header plus opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Bytes,
}

impl RtpPacket {
    pub fn new(header: RtpHeader, payload: impl Into<Bytes>) -> Self {
        Self {
            header,
            payload: payload.into(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        let (header, header_len) = RtpHeader::parse(data)?;
        let payload = Bytes::copy_from_slice(&data[header_len..]);
        Ok(Self { header, payload })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.header.wire_len() + self.payload.len());
        self.header.write(&mut buf);
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_header_and_payload() {
        let packet = RtpPacket::new(RtpHeader::new(96, 4711, 960, 0xdead_beef), &b"opus"[..]);
        let parsed = RtpPacket::parse(&packet.to_bytes()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn round_trips_csrc_list() {
        let mut header = RtpHeader::new(0, 1, 2, 3);
        header.csrcs = vec![0x1111_1111, 0x2222_2222];
        let packet = RtpPacket::new(header, &b"pcm"[..]);
        let wire = packet.to_bytes();
        assert_eq!(wire.len(), 12 + 8 + 3);
        assert_eq!(RtpPacket::parse(&wire).unwrap(), packet);
    }

    #[test]
    fn rejects_short_packets() {
        assert!(RtpPacket::parse(&[0x80; 11]).is_err());
    }

    #[test]
    fn rejects_wrong_version() {
        let mut wire = RtpPacket::new(RtpHeader::new(96, 1, 2, 3), &b"x"[..]).to_bytes().to_vec();
        wire[0] = 0x40; // version 1
        assert!(RtpPacket::parse(&wire).is_err());
    }

    #[test]
    fn rejects_truncated_csrc_list() {
        let mut wire = RtpPacket::new(RtpHeader::new(96, 1, 2, 3), Bytes::new()).to_bytes().to_vec();
        wire[0] = 0x82; // claims two csrcs that are not present
        assert!(RtpPacket::parse(&wire).is_err());
    }
}
