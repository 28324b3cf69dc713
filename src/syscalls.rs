use crate::config::SocketConfig;
use crate::error::KilnResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::SocketAddr;
use std::ptr;

// ---- Socket operations ----

/// Create a blocking TCP listen socket. The acceptor thread blocks in
/// accept(2); accepted sockets are switched to non-blocking for the poller.
pub fn create_listen_socket(addr: &SocketAddr, opts: &SocketConfig, backlog: i32) -> KilnResult<c_int> {
    let domain = if addr.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };

    unsafe {
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        if opts.reuse_address {
            let one: c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
        }

        if let Err(e) = bind_addr(fd, addr) {
            libc::close(fd);
            return Err(e);
        }

        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Validate and adopt a pre-bound listening socket inherited from the
/// invoking process. Fails unless the fd is a listening stream socket.
pub fn adopt_inherited_socket(fd: c_int) -> KilnResult<c_int> {
    unsafe {
        let mut sock_type: c_int = 0;
        let mut len = mem::size_of::<c_int>() as socklen_t;
        if libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut sock_type as *mut _ as *mut c_void,
            &mut len,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }
        if sock_type != libc::SOCK_STREAM {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "inherited fd is not a stream socket",
            )
            .into());
        }

        #[cfg(target_os = "linux")]
        {
            let mut accepting: c_int = 0;
            let mut len = mem::size_of::<c_int>() as socklen_t;
            if libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_ACCEPTCONN,
                &mut accepting as *mut _ as *mut c_void,
                &mut len,
            ) < 0
            {
                return Err(io::Error::last_os_error().into());
            }
            if accepting == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "inherited fd is not listening",
                )
                .into());
            }
        }

        // The acceptor expects blocking accept semantics.
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(fd)
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> KilnResult<()> {
    unsafe {
        match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    #[cfg(target_os = "macos")]
                    sin_len: mem::size_of::<libc::sockaddr_in>() as u8,
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                if libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error().into());
                }
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    #[cfg(target_os = "macos")]
                    sin6_len: mem::size_of::<libc::sockaddr_in6>() as u8,
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                if libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                ) < 0
                {
                    return Err(io::Error::last_os_error().into());
                }
            }
        }
        Ok(())
    }
}

/// Local address a socket is bound to (resolves port 0 after bind).
pub fn local_addr(fd: c_int) -> KilnResult<SocketAddr> {
    use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin = &*(&storage as *const _ as *const libc::sockaddr_in);
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr).to_be_bytes());
                Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                let sin6 = &*(&storage as *const _ as *const libc::sockaddr_in6);
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Ok(SocketAddr::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected address family {other}"),
            )
            .into()),
        }
    }
}

/// Accept one connection from a blocking listen socket. Returns None on
/// EWOULDBLOCK (listen socket raced into non-blocking mode during unlock).
pub fn accept_connection(listen_fd: c_int) -> KilnResult<Option<c_int>> {
    #[cfg(target_os = "linux")]
    unsafe {
        let fd = libc::accept4(listen_fd, ptr::null_mut(), ptr::null_mut(), libc::SOCK_NONBLOCK);
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(fd))
        }
    }

    #[cfg(target_os = "macos")]
    unsafe {
        let fd = libc::accept(listen_fd, ptr::null_mut(), ptr::null_mut());
        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            let flags = libc::fcntl(fd, libc::F_GETFL, 0);
            if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                let err = io::Error::last_os_error();
                libc::close(fd);
                return Err(err.into());
            }
            let one: c_int = 1;
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
            Ok(Some(fd))
        }
    }
}

/// Apply configured options to an accepted socket.
pub fn configure_socket(fd: c_int, opts: &SocketConfig) -> KilnResult<()> {
    unsafe {
        let one: c_int = 1;
        if opts.tcp_no_delay {
            libc::setsockopt(
                fd,
                libc::IPPROTO_TCP,
                libc::TCP_NODELAY,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
        }
        if opts.so_keep_alive {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_KEEPALIVE,
                &one as *const _ as *const c_void,
                mem::size_of_val(&one) as socklen_t,
            );
        }
        if opts.rcv_buf > 0 {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVBUF,
                &opts.rcv_buf as *const _ as *const c_void,
                mem::size_of_val(&opts.rcv_buf) as socklen_t,
            );
        }
        if opts.snd_buf > 0 {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &opts.snd_buf as *const _ as *const c_void,
                mem::size_of_val(&opts.snd_buf) as socklen_t,
            );
        }
        if opts.linger >= 0 {
            let lg = libc::linger {
                l_onoff: 1,
                l_linger: opts.linger,
            };
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_LINGER,
                &lg as *const _ as *const c_void,
                mem::size_of_val(&lg) as socklen_t,
            );
        }
    }
    Ok(())
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll operations (Linux) ----

#[cfg(target_os = "linux")]
pub use linux_epoll::*;

#[cfg(target_os = "linux")]
mod linux_epoll {
    use super::*;
    pub use libc::{epoll_event, EPOLLIN, EPOLLOUT};

    /// Level-triggered readiness selector. The poller removes ready ops
    /// from a key's interest before dispatch, so level-triggered semantics
    /// are required here.
    pub struct Epoll {
        pub fd: c_int,
    }

    impl Epoll {
        pub fn new() -> KilnResult<Self> {
            unsafe {
                let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> KilnResult<()> {
            let mut event = epoll_event {
                events: interests as u32,
                u64: token,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> KilnResult<()> {
            let mut event = epoll_event {
                events: interests as u32,
                u64: token,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_MOD, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: c_int) -> KilnResult<()> {
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err.into());
                    }
                }
            }
            Ok(())
        }

        /// Wait for readiness. timeout_ms of 0 polls without blocking,
        /// negative blocks indefinitely. EINTR reports zero events.
        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> KilnResult<usize> {
            unsafe {
                let res = libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as c_int, timeout_ms);
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }
                Ok(res as usize)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

// ---- Kqueue fallback for macOS development ----

#[cfg(target_os = "macos")]
pub use macos_epoll::*;

#[cfg(target_os = "macos")]
mod macos_epoll {
    use super::*;
    use libc::{kevent, kqueue, timespec, EVFILT_READ, EVFILT_WRITE, EV_ADD, EV_DELETE, EV_ENABLE};

    #[allow(non_camel_case_types)]
    #[derive(Clone, Copy)]
    pub struct epoll_event {
        pub events: u32,
        pub u64: u64,
    }

    pub const EPOLLIN: i32 = 1;
    pub const EPOLLOUT: i32 = 4;

    pub struct Epoll {
        pub fd: c_int,
    }

    impl Epoll {
        pub fn new() -> KilnResult<Self> {
            unsafe {
                let fd = kqueue();
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> KilnResult<()> {
            self.apply(fd, token, interests, EV_ADD | EV_ENABLE)
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> KilnResult<()> {
            // kqueue filters are independent; re-adding adjusts, and the
            // filter for a dropped interest must be removed explicitly.
            if interests & EPOLLIN == 0 {
                let _ = self.apply_filter(fd, 0, EVFILT_READ, EV_DELETE);
            }
            if interests & EPOLLOUT == 0 {
                let _ = self.apply_filter(fd, 0, EVFILT_WRITE, EV_DELETE);
            }
            self.apply(fd, token, interests, EV_ADD | EV_ENABLE)
        }

        pub fn delete(&self, fd: c_int) -> KilnResult<()> {
            let _ = self.apply_filter(fd, 0, EVFILT_READ, EV_DELETE);
            let _ = self.apply_filter(fd, 0, EVFILT_WRITE, EV_DELETE);
            Ok(())
        }

        fn apply(&self, fd: c_int, token: u64, interests: i32, action: u16) -> KilnResult<()> {
            if interests & EPOLLIN != 0 {
                self.apply_filter(fd, token, EVFILT_READ, action)?;
            }
            if interests & EPOLLOUT != 0 {
                self.apply_filter(fd, token, EVFILT_WRITE, action)?;
            }
            Ok(())
        }

        fn apply_filter(&self, fd: c_int, token: u64, filter: i16, action: u16) -> KilnResult<()> {
            let change = kevent {
                ident: fd as usize,
                filter,
                flags: action,
                fflags: 0,
                data: 0,
                udata: token as *mut c_void,
            };
            unsafe {
                let res = libc::kevent(self.fd, &change, 1, ptr::null_mut(), 0, ptr::null());
                if res < 0 && action != EV_DELETE {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> KilnResult<usize> {
            const MAX_BATCH: usize = 128;
            let mut kevents = [unsafe { mem::zeroed::<kevent>() }; MAX_BATCH];
            let batch = events.len().min(MAX_BATCH);

            let ts = if timeout_ms >= 0 {
                Some(timespec {
                    tv_sec: (timeout_ms / 1000) as libc::time_t,
                    tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
                })
            } else {
                None
            };
            let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const timespec);

            unsafe {
                let res = libc::kevent(self.fd, ptr::null(), 0, kevents.as_mut_ptr(), batch as c_int, ts_ptr);
                if res < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }
                let n = res as usize;
                for i in 0..n {
                    let mut ev = 0;
                    if kevents[i].filter == EVFILT_READ {
                        ev |= EPOLLIN;
                    }
                    if kevents[i].filter == EVFILT_WRITE {
                        ev |= EPOLLOUT;
                    }
                    events[i] = epoll_event {
                        events: ev as u32,
                        u64: kevents[i].udata as u64,
                    };
                }
                Ok(n)
            }
        }
    }

    impl Drop for Epoll {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

// ---- Non-blocking I/O ----

/// Read from a non-blocking fd. None means EWOULDBLOCK; Some(0) is EOF.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> KilnResult<Option<usize>> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Write to a non-blocking fd. None means EWOULDBLOCK.
pub fn write_nonblocking(fd: c_int, buf: &[u8]) -> KilnResult<Option<usize>> {
    unsafe {
        #[cfg(target_os = "linux")]
        let res = libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), libc::MSG_NOSIGNAL);
        #[cfg(target_os = "macos")]
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

/// Zero-copy file-to-socket transfer. None means the socket would block.
#[cfg(target_os = "linux")]
pub fn sendfile(socket_fd: c_int, file_fd: c_int, offset: u64, count: usize) -> KilnResult<Option<usize>> {
    unsafe {
        let mut off = offset as libc::off_t;
        let res = libc::sendfile(socket_fd, file_fd, &mut off, count);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(res as usize))
        }
    }
}

#[cfg(target_os = "macos")]
pub fn sendfile(socket_fd: c_int, file_fd: c_int, offset: u64, count: usize) -> KilnResult<Option<usize>> {
    unsafe {
        let mut len = count as libc::off_t;
        let res = libc::sendfile(file_fd, socket_fd, offset as libc::off_t, &mut len, ptr::null_mut(), 0);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                if len > 0 {
                    return Ok(Some(len as usize));
                }
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(len as usize))
        }
    }
}

// ---- Wake pipe ----

/// Create a pipe whose read end is non-blocking. Used to wake a selector
/// blocked in wait().
pub fn create_pipe() -> KilnResult<(c_int, c_int)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe(fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let flags = libc::fcntl(fds[0], libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fds[0]);
            libc::close(fds[1]);
            return Err(err.into());
        }
    }
    Ok((fds[0], fds[1]))
}

/// Write one byte into the wake pipe. Short or failed writes are harmless:
/// a full pipe already guarantees a pending wake-up.
pub fn wake_pipe(write_fd: c_int) {
    let byte = [1u8];
    unsafe {
        libc::write(write_fd, byte.as_ptr() as *const c_void, 1);
    }
}

/// Drain all pending bytes from the wake pipe's read end.
pub fn drain_pipe(read_fd: c_int) {
    let mut buf = [0u8; 64];
    unsafe {
        loop {
            let n = libc::read(read_fd, buf.as_mut_ptr() as *mut c_void, buf.len());
            if n <= 0 {
                break;
            }
        }
    }
}

/// Briefly connect to the local listen address to unblock a thread stuck
/// in accept(2). Errors are ignored: if the connect fails the acceptor is
/// not blocked on a live socket anyway.
pub fn unlock_accept(addr: &SocketAddr) {
    use std::net::TcpStream;
    use std::time::Duration;

    let target = if addr.ip().is_unspecified() {
        match addr {
            SocketAddr::V4(a) => SocketAddr::new("127.0.0.1".parse().unwrap(), a.port()),
            SocketAddr::V6(a) => SocketAddr::new("::1".parse().unwrap(), a.port()),
        }
    } else {
        *addr
    };
    if let Ok(stream) = TcpStream::connect_timeout(&target, Duration::from_millis(250)) {
        drop(stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_wakes_and_drains() {
        let (r, w) = create_pipe().unwrap();
        wake_pipe(w);
        wake_pipe(w);
        let mut buf = [0u8; 8];
        let n = unsafe { libc::read(r, buf.as_mut_ptr() as *mut c_void, buf.len()) };
        assert_eq!(n, 2);
        // Empty pipe must not block.
        drain_pipe(r);
        close_fd(r);
        close_fd(w);
    }

    #[test]
    fn epoll_reports_pipe_readable() {
        let epoll = Epoll::new().unwrap();
        let (r, w) = create_pipe().unwrap();
        epoll.add(r, 42, EPOLLIN).unwrap();

        let mut events = vec![epoll_event { events: 0, u64: 0 }; 4];
        let n = epoll.wait(&mut events, 0).unwrap();
        assert_eq!(n, 0);

        wake_pipe(w);
        let n = epoll.wait(&mut events, 1000).unwrap();
        assert_eq!(n, 1);
        let ev0_u64 = events[0].u64;
        assert_eq!(ev0_u64, 42);

        epoll.delete(r).unwrap();
        close_fd(r);
        close_fd(w);
    }
}
