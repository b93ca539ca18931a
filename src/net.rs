use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::config::BindConfig;
use crate::error::{Error, Result};

#[cfg(any(target_os = "linux", target_os = "android"))]
use std::ffi::CString;
#[cfg(any(target_os = "linux", target_os = "android"))]
use std::os::fd::AsRawFd;

/// Bind a tokio UDP socket per a [`BindConfig`], overriding the configured port.
///
/// Used for the SIP listener, the RTP endpoint, and the tone injector socket;
/// all three need reuse-address and optional interface pinning before the
/// socket is handed to tokio.
pub fn bind_udp_socket(bind: &BindConfig, port: u16) -> Result<UdpSocket> {
    let domain = Domain::for_address(SocketAddr::new(bind.address, 0));
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    if let Some(iface) = &bind.interface {
        bind_to_device(&socket, iface)?;
    }

    let addr = SocketAddr::new(bind.address, port);
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

/// Pin a socket to a network interface with `SO_BINDTODEVICE`.
///
/// Only Linux/Android support this; elsewhere a configured interface is a
/// configuration error rather than a silent no-op.
fn bind_to_device(socket: &Socket, interface: &str) -> Result<()> {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        let c_iface = CString::new(interface.as_bytes()).map_err(|_| {
            Error::Configuration(format!(
                "interface name contains interior NUL bytes: {interface}"
            ))
        })?;
        // Safety: the CString outlives the call and the length matches it.
        let result = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                c_iface.as_ptr() as *const libc::c_void,
                c_iface.as_bytes_with_nul().len() as libc::socklen_t,
            )
        };
        if result != 0 {
            let io_err = std::io::Error::last_os_error();
            return Err(Error::Configuration(format!(
                "failed to bind socket to interface {interface}: {io_err}"
            )));
        }
        Ok(())
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        Err(Error::Configuration(format!(
            "interface binding not supported on this platform ({interface})"
        )))
    }
}
