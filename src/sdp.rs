//! SDP offer/answer handling for the single supported codec.
//!
//! The bridge negotiates exactly one codec (OPUS at 48 kHz stereo). Parsing a
//! remote description yields the peer's RTP destination and payload type, or
//! `None` when the description offers nothing usable. `None` means "no
//! acceptable codec", not a protocol error; callers turn it into a rejection
//! response or a call failure.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Payload type the bridge advertises for OPUS in its own descriptions.
pub const OPUS_PAYLOAD_TYPE: u8 = 96;

const SUPPORTED_CODEC: &str = "OPUS";

/// Remote audio endpoint extracted from a session description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMedia {
    pub address: IpAddr,
    pub port: u16,
    /// Payload type the peer maps to the supported codec.
    pub payload_type: u8,
}

impl RemoteMedia {
    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// Extract the audio destination for the supported codec from a remote SDP body.
///
/// Looks for the `m=audio` section, the `c=IN IP4` connection line (loopback
/// when absent) and an `a=rtpmap` entry naming the supported codec whose
/// payload type is also listed on the media line. The first such payload type
/// wins.
pub fn parse_remote_offer(body: &str) -> Option<RemoteMedia> {
    fn audio_media_line(line: &str) -> Option<(u16, Vec<u8>)> {
        let rest = line.strip_prefix("m=audio")?;
        let mut tokens = rest.split_whitespace();
        let port = tokens.next()?.parse::<u16>().ok()?;
        if !tokens.next()?.starts_with("RTP/") {
            return None;
        }
        let payload_types: Vec<u8> = tokens.filter_map(|token| token.parse().ok()).collect();
        if payload_types.is_empty() {
            return None;
        }
        Some((port, payload_types))
    }

    fn rtpmap_entry(line: &str) -> Option<(u8, &str)> {
        let rest = line.strip_prefix("a=rtpmap:")?;
        let (pt, mapping) = rest.split_once(char::is_whitespace)?;
        Some((pt.parse().ok()?, mapping.trim().split('/').next()?))
    }

    let lines: Vec<&str> = body.lines().map(str::trim).collect();

    let (port, payload_types) = lines.iter().find_map(|line| audio_media_line(line))?;

    let address = lines
        .iter()
        .find_map(|line| line.strip_prefix("c=IN IP4"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|token| token.parse::<IpAddr>().ok())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));

    let payload_type = lines.iter().find_map(|line| {
        let (pt, codec) = rtpmap_entry(line)?;
        (codec.eq_ignore_ascii_case(SUPPORTED_CODEC) && payload_types.contains(&pt)).then_some(pt)
    })?;

    Some(RemoteMedia {
        address,
        port,
        payload_type,
    })
}

/// Build the bridge's own session description.
///
/// The output is a fixed template (one OPUS audio section, a declined video
/// section) and is byte-identical for identical inputs, so the same answer can
/// be regenerated at any point of a call.
pub fn build_local_offer(session_id: u64, address: IpAddr, port: u16) -> String {
    [
        "v=0".to_string(),
        format!("o=- {session_id} {session_id} IN IP4 {address}"),
        "s=-".to_string(),
        format!("c=IN IP4 {address}"),
        "t=0 0".to_string(),
        format!("m=audio {port} RTP/AVP {OPUS_PAYLOAD_TYPE}"),
        format!("a=rtpmap:{OPUS_PAYLOAD_TYPE} OPUS/48000/2"),
        format!("a=fmtp:{OPUS_PAYLOAD_TYPE} useinbandfec=1;minptime=10"),
        "a=ptime:20".to_string(),
        "a=maxptime:150".to_string(),
        "a=sendrecv".to_string(),
        "m=video 0 RTP/AVP 99".to_string(),
        "a=inactive".to_string(),
    ]
    .join("\r\n")
        + "\r\n"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_offer_round_trips_through_parser() {
        let address: IpAddr = "192.0.2.10".parse().unwrap();
        let offer = build_local_offer(1234, address, 8000);
        let media = parse_remote_offer(&offer).expect("own offer must parse");
        assert_eq!(media.address, address);
        assert_eq!(media.port, 8000);
        assert_eq!(media.payload_type, OPUS_PAYLOAD_TYPE);
    }

    #[test]
    fn local_offer_is_byte_stable() {
        let address: IpAddr = "10.1.2.3".parse().unwrap();
        let expected = "v=0\r\n\
                        o=- 42 42 IN IP4 10.1.2.3\r\n\
                        s=-\r\n\
                        c=IN IP4 10.1.2.3\r\n\
                        t=0 0\r\n\
                        m=audio 8000 RTP/AVP 96\r\n\
                        a=rtpmap:96 OPUS/48000/2\r\n\
                        a=fmtp:96 useinbandfec=1;minptime=10\r\n\
                        a=ptime:20\r\n\
                        a=maxptime:150\r\n\
                        a=sendrecv\r\n\
                        m=video 0 RTP/AVP 99\r\n\
                        a=inactive\r\n";
        assert_eq!(build_local_offer(42, address, 8000), expected);
        assert_eq!(
            build_local_offer(42, address, 8000),
            build_local_offer(42, address, 8000)
        );
    }

    #[test]
    fn missing_audio_section_yields_none() {
        let sdp = "v=0\r\nc=IN IP4 203.0.113.5\r\nm=video 9 RTP/AVP 99\r\n";
        assert!(parse_remote_offer(sdp).is_none());
    }

    #[test]
    fn unsupported_codec_yields_none() {
        let sdp = "v=0\r\n\
                   c=IN IP4 203.0.113.5\r\n\
                   m=audio 49170 RTP/AVP 0 8\r\n\
                   a=rtpmap:0 PCMU/8000\r\n\
                   a=rtpmap:8 PCMA/8000\r\n";
        assert!(parse_remote_offer(sdp).is_none());
    }

    #[test]
    fn codec_match_is_case_insensitive() {
        let sdp = "v=0\r\n\
                   c=IN IP4 203.0.113.5\r\n\
                   m=audio 49170 RTP/AVP 111\r\n\
                   a=rtpmap:111 opus/48000/2\r\n";
        let media = parse_remote_offer(sdp).unwrap();
        assert_eq!(media.payload_type, 111);
        assert_eq!(media.port, 49170);
    }

    #[test]
    fn payload_type_must_be_listed_on_media_line() {
        let sdp = "v=0\r\n\
                   c=IN IP4 203.0.113.5\r\n\
                   m=audio 49170 RTP/AVP 0 8\r\n\
                   a=rtpmap:96 OPUS/48000/2\r\n";
        assert!(parse_remote_offer(sdp).is_none());
    }

    #[test]
    fn connection_line_defaults_to_loopback() {
        let sdp = "v=0\r\nm=audio 4000 RTP/AVP 96\r\na=rtpmap:96 OPUS/48000/2\r\n";
        let media = parse_remote_offer(sdp).unwrap();
        assert_eq!(media.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn first_matching_payload_type_wins() {
        let sdp = "v=0\r\n\
                   c=IN IP4 203.0.113.5\r\n\
                   m=audio 49170 RTP/AVP 96 111\r\n\
                   a=rtpmap:96 OPUS/48000/2\r\n\
                   a=rtpmap:111 OPUS/48000/2\r\n";
        assert_eq!(parse_remote_offer(sdp).unwrap().payload_type, 96);
    }

    #[test]
    fn malformed_media_line_yields_none() {
        assert!(parse_remote_offer("m=audio port RTP/AVP 96\r\n").is_none());
        assert!(parse_remote_offer("m=audio 4000 UDP/TLS 96\r\n").is_none());
        assert!(parse_remote_offer("m=audio 4000 RTP/AVP\r\n").is_none());
    }
}
