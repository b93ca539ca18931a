use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use ftth_rsipstack::rsip;
use rsip::Param;
use rsip::typed;

/// Render a socket address for a SIP header, bracketing IPv6 literals.
pub(super) fn format_socket_for_sip(addr: &SocketAddr) -> String {
    match addr.ip() {
        IpAddr::V4(ip) => format!("{ip}:{}", addr.port()),
        IpAddr::V6(ip) => format!("[{ip}]:{}", addr.port()),
    }
}

/// Drop `rport` from a Via so responses are routed by the address we put there.
pub(super) fn strip_rport_param(via: &mut typed::Via) {
    via.params.retain(|param| {
        !matches!(param, Param::Other(name, _) if name.value().eq_ignore_ascii_case("rport"))
    });
}

fn unix_nanos() -> u128 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos())
}

pub(super) fn generate_cnonce() -> String {
    format!("{:x}", unix_nanos())
}

pub(super) fn generate_call_id(domain: &str) -> rsip::headers::CallId {
    rsip::headers::CallId::from(format!("{:x}@{domain}", unix_nanos()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsip::headers::UntypedHeader;
    use std::net::{Ipv4Addr, Ipv6Addr};

    #[test]
    fn socket_formatting_brackets_ipv6() {
        let v4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(192, 0, 2, 10)), 5060);
        assert_eq!(format_socket_for_sip(&v4), "192.0.2.10:5060");

        let v6 = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 5080);
        assert_eq!(format_socket_for_sip(&v6), "[::1]:5080");
    }

    #[test]
    fn call_ids_are_unique_and_scoped_to_domain() {
        let first = generate_call_id("example.net");
        std::thread::sleep(std::time::Duration::from_millis(1));
        let second = generate_call_id("example.net");
        assert!(first.value().ends_with("@example.net"));
        assert_ne!(first.value(), second.value());
    }
}
