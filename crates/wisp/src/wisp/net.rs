use std::{borrow::Cow, io, net::IpAddr};

use async_trait::async_trait;
use tokio::net::TcpSocket;

/// Normalize a bind/listen address.
///
/// Configs commonly use the shorthand `":PORT"` to mean "bind on all
/// interfaces". Tokio bind APIs do not accept `":PORT"`, so we normalize it to
/// `"0.0.0.0:PORT"`.
pub fn normalize_bind_addr(addr: &str) -> Cow<'_, str> {
    let addr = addr.trim();
    if addr.starts_with(':') {
        Cow::Owned(format!("0.0.0.0{addr}"))
    } else {
        Cow::Borrowed(addr)
    }
}

/// Split `host:port` (or `[v6]:port`) into its parts.
///
/// Returns `None` when the port is missing or not a number, or the host is
/// empty.
pub fn split_host_port(addr: &str) -> Option<(&str, u16)> {
    let addr = addr.trim();
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        (host, tail.strip_prefix(':')?)
    } else {
        let (host, port) = addr.rsplit_once(':')?;
        if host.contains(':') {
            // Bare IPv6 without brackets is ambiguous.
            return None;
        }
        (host, port)
    };
    if host.is_empty() {
        return None;
    }
    let port = port.parse().ok()?;
    Some((host, port))
}

/// Socket-level hook applied before every outbound connect and before the
/// local listener binds.
///
/// `before_connect` may talk to the host (VPN protection) and is therefore
/// async; `before_listen` only sets options.
#[async_trait]
pub trait ConnectHook: Send + Sync {
    async fn before_connect(&self, socket: &TcpSocket) -> io::Result<()>;
    fn before_listen(&self, socket: &TcpSocket) -> io::Result<()>;
}

/// Default hook: no-delay, optional TCP fast open, optional VPN protection.
#[derive(Debug, Clone, Default)]
pub struct SocketTuning {
    pub fast_open: bool,
    pub vpn_mode: bool,
}

const FAST_OPEN_QUEUE: libc::c_int = 256;

#[async_trait]
impl ConnectHook for SocketTuning {
    async fn before_connect(&self, socket: &TcpSocket) -> io::Result<()> {
        socket.set_nodelay(true)?;
        if self.fast_open {
            fast_open::enable_connect(socket)?;
        }
        if self.vpn_mode {
            protect::protect(socket).await?;
        }
        Ok(())
    }

    fn before_listen(&self, socket: &TcpSocket) -> io::Result<()> {
        socket.set_reuseaddr(true)?;
        if self.fast_open {
            fast_open::enable_listen(socket, FAST_OPEN_QUEUE)?;
        }
        Ok(())
    }
}

pub fn new_socket_for(ip: IpAddr) -> io::Result<TcpSocket> {
    match ip {
        IpAddr::V4(_) => TcpSocket::new_v4(),
        IpAddr::V6(_) => TcpSocket::new_v6(),
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod fast_open {
    use std::{io, os::fd::AsRawFd};

    use tokio::net::TcpSocket;

    // Not exported by libc for every linux-like target.
    const TCP_FASTOPEN_CONNECT: libc::c_int = 30;

    fn set_tcp_opt(socket: &TcpSocket, opt: libc::c_int, val: libc::c_int) -> io::Result<()> {
        // SAFETY: the fd is owned by `socket` and outlives this call; `val` is a
        // plain c_int passed by pointer with its exact size.
        let rc = unsafe {
            libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_TCP,
                opt,
                &val as *const libc::c_int as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn enable_connect(socket: &TcpSocket) -> io::Result<()> {
        set_tcp_opt(socket, TCP_FASTOPEN_CONNECT, 1)
    }

    pub fn enable_listen(socket: &TcpSocket, queue: libc::c_int) -> io::Result<()> {
        set_tcp_opt(socket, libc::TCP_FASTOPEN, queue)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
mod fast_open {
    use std::io;

    use tokio::net::TcpSocket;

    pub fn enable_connect(_socket: &TcpSocket) -> io::Result<()> {
        Ok(())
    }

    pub fn enable_listen(_socket: &TcpSocket, _queue: libc::c_int) -> io::Result<()> {
        Ok(())
    }
}

/// Hands outbound sockets to the host VPN service so their traffic bypasses
/// the tunnel interface.
///
/// The fd travels as SCM_RIGHTS ancillary data next to one dummy byte; the
/// host answers with a single byte, 0 meaning success.
#[cfg(unix)]
mod protect {
    use std::{
        io,
        os::fd::{AsRawFd, RawFd},
        path::Path,
        time::Duration,
    };

    use tokio::{
        io::{AsyncReadExt, Interest},
        net::{TcpSocket, UnixStream},
        time,
    };

    const PROTECT_PATH: &str = "protect_path";
    const PROTECT_TIMEOUT: Duration = Duration::from_secs(3);

    pub async fn protect(socket: &TcpSocket) -> io::Result<()> {
        protect_at(Path::new(PROTECT_PATH), socket.as_raw_fd()).await
    }

    pub async fn protect_at(path: &Path, fd: RawFd) -> io::Result<()> {
        time::timeout(PROTECT_TIMEOUT, exchange(path, fd))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "vpn: protect timed out"))?
    }

    async fn exchange(path: &Path, fd: RawFd) -> io::Result<()> {
        let mut conn = UnixStream::connect(path).await?;
        let raw = conn.as_raw_fd();
        conn.async_io(Interest::WRITABLE, || send_fd(raw, fd)).await?;

        let mut ack = [0u8; 1];
        conn.read_exact(&mut ack).await?;
        if ack[0] != 0 {
            return Err(io::Error::other(format!(
                "vpn: protect rejected by host (code {})",
                ack[0]
            )));
        }
        Ok(())
    }

    /// One non-blocking sendmsg; EAGAIN surfaces as `WouldBlock` so
    /// `async_io` waits for writability and retries.
    fn send_fd(conn: RawFd, fd: RawFd) -> io::Result<()> {
        let mut payload = [1u8; 1];
        let mut iov = libc::iovec {
            iov_base: payload.as_mut_ptr().cast(),
            iov_len: payload.len(),
        };
        // u64 backing keeps the control buffer aligned for cmsghdr.
        let mut control = [0u64; 8];
        let fd_len = std::mem::size_of::<RawFd>() as u32;

        // SAFETY: msghdr is plain data; every pointer stored in it refers to a
        // local that lives until sendmsg returns, and the control buffer is
        // larger than CMSG_SPACE(sizeof(int)).
        unsafe {
            let space = libc::CMSG_SPACE(fd_len) as usize;
            debug_assert!(space <= std::mem::size_of_val(&control));

            let mut msg: libc::msghdr = std::mem::zeroed();
            msg.msg_iov = &mut iov;
            msg.msg_iovlen = 1;
            msg.msg_control = control.as_mut_ptr().cast();
            msg.msg_controllen = space as _;

            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null() {
                return Err(io::Error::other("vpn: no room for control message"));
            }
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(fd_len) as _;
            std::ptr::write_unaligned(libc::CMSG_DATA(cmsg).cast::<RawFd>(), fd);

            if libc::sendmsg(conn, &msg, 0) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

}

#[cfg(not(unix))]
mod protect {
    use std::io;

    use tokio::net::TcpSocket;

    pub async fn protect(_socket: &TcpSocket) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "vpn mode is only available on unix",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_bind_addr, split_host_port};

    #[test]
    fn normalize_bind_addr_port_only() {
        assert_eq!(normalize_bind_addr(":8080").as_ref(), "0.0.0.0:8080");
        assert_eq!(normalize_bind_addr(" :7000 ").as_ref(), "0.0.0.0:7000");
    }

    #[test]
    fn normalize_bind_addr_passthrough() {
        assert_eq!(
            normalize_bind_addr("127.0.0.1:8080").as_ref(),
            "127.0.0.1:8080"
        );
        assert_eq!(normalize_bind_addr("[::]:8080").as_ref(), "[::]:8080");
    }

    #[test]
    fn split_host_port_variants() {
        assert_eq!(split_host_port("example.com:443"), Some(("example.com", 443)));
        assert_eq!(split_host_port("1.2.3.4:80"), Some(("1.2.3.4", 80)));
        assert_eq!(split_host_port("[::1]:8443"), Some(("::1", 8443)));
    }

    #[test]
    fn split_host_port_rejects_malformed() {
        assert_eq!(split_host_port("example.com"), None);
        assert_eq!(split_host_port(":443"), None);
        assert_eq!(split_host_port("example.com:https"), None);
        assert_eq!(split_host_port("::1:443"), None);
        assert_eq!(split_host_port("[::1]443"), None);
    }
}
