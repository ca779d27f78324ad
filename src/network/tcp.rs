//! TCP Primitives
//!
//! Non-blocking socket natives: connect, listen, accept, send, recv,
//! close. Operations that would block register a pending-I/O record and
//! return a pending promise; fast paths return an already-settled
//! promise. DNS resolution uses the first IPv4 address (A records only).

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};

use crate::ast::types::Span;
use crate::event_loop::scheduler::{Interest, IoOp, PendingIo};
use crate::interpreter::errors::Control;
use crate::interpreter::stdlib::{want_int, want_str};
use crate::network::tls::{HsStep, TlsRecvResult, TlsSendResult};
use crate::network::types::*;
use crate::value::{NativeError, Value};
use crate::vm::Vm;

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

pub(crate) fn errno_str(errno: i32) -> String {
    std::io::Error::from_raw_os_error(errno).to_string()
}

fn would_block(errno: i32) -> bool {
    errno == libc::EAGAIN || errno == libc::EWOULDBLOCK
}

pub(crate) fn set_nonblocking(fd: i32) -> Result<(), i32> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(last_errno());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(last_errno());
        }
    }
    Ok(())
}

pub(crate) fn close_fd(fd: i32) {
    unsafe {
        libc::close(fd);
    }
}

/// The deferred error of a non-blocking connect.
fn socket_error(fd: i32) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        last_errno()
    } else {
        err
    }
}

/// Resolve a host to its first IPv4 address (A records only).
fn resolve_host(host: &str, port: u16) -> Option<SocketAddrV4> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Some(SocketAddrV4::new(ip, port));
    }
    (host, port)
        .to_socket_addrs()
        .ok()?
        .find_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(v4),
            SocketAddr::V6(_) => None,
        })
}

fn sockaddr_of(addr: &SocketAddrV4) -> libc::sockaddr_in {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = addr.port().to_be();
    sa.sin_addr.s_addr = u32::from_ne_bytes(addr.ip().octets());
    sa
}

fn want_port(args: &[Value], index: usize, what: &str) -> Result<u16, NativeError> {
    let port = want_int(args, index, what)?;
    if !(1..=65535).contains(&port) {
        return Err(NativeError::new(format!("{} must be in 1..65535", what)));
    }
    Ok(port as u16)
}

/// Optional trailing per-operation timeout argument; 0 falls back to
/// the VM default.
fn opt_timeout(args: &[Value], index: usize) -> Result<u64, NativeError> {
    match args.get(index) {
        None => Ok(0),
        Some(Value::Int(ms)) if *ms >= 0 => Ok(*ms as u64),
        Some(_) => Err(NativeError::new("timeout must be a non-negative integer")),
    }
}

// ----------------------------------------------------------------------
// Natives
// ----------------------------------------------------------------------

// tcp_connect(host, port[, timeout_ms]) -> promise<socket>
fn nf_tcp_connect(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let host = want_str(args, 0, "tcp_connect() host")?;
    let port = want_port(args, 1, "tcp_connect() port")?;
    let timeout_ms = opt_timeout(args, 2)?;

    let addr = match resolve_host(&host, port) {
        Some(a) => a,
        None => {
            return Ok(vm.rejected_promise("tcp_connect() failed to resolve host", NET_RESOLVE));
        }
    };

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Ok(vm.rejected_promise("tcp_connect() failed to create socket", NET_CONNECT));
    }
    if set_nonblocking(fd).is_err() {
        close_fd(fd);
        return Ok(vm.rejected_promise("tcp_connect() failed to set non-blocking", NET_CONNECT));
    }

    let sa = sockaddr_of(&addr);
    let rc = unsafe {
        libc::connect(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };

    if rc == 0 {
        let sock = vm.make_socket_map(fd, "tcp", &host, port as i64);
        return Ok(vm.resolved_promise(sock));
    }

    let errno = last_errno();
    if errno == libc::EINPROGRESS {
        let promise = vm.new_promise();
        let sock = vm.make_socket_map(fd, "tcp", &host, port as i64);
        vm.add_pending_io(fd, Interest::Write, promise.clone(), IoOp::Connect { sock }, timeout_ms);
        return Ok(Value::Promise(promise));
    }

    close_fd(fd);
    let msg = format!("tcp_connect() failed: {}", errno_str(errno));
    Ok(vm.rejected_promise(&msg, NET_CONNECT))
}

// tcp_listen(host, port) -> socket
// Port 0 binds an ephemeral port; the socket map's `port` key reports
// the actual one.
fn nf_tcp_listen(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let host = want_str(args, 0, "tcp_listen() host")?;
    let port = want_int(args, 1, "tcp_listen() port")?;
    if !(0..=65535).contains(&port) {
        return Err(NativeError::new("tcp_listen() port must be in 0..65535"));
    }
    let port = port as u16;

    let ip = if host.is_empty() || host == "0.0.0.0" {
        Ipv4Addr::UNSPECIFIED
    } else {
        match resolve_host(&host, port) {
            Some(a) => *a.ip(),
            None => {
                return Err(NativeError::new("tcp_listen() failed to resolve host"));
            }
        }
    };

    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(NativeError::new("tcp_listen() failed to create socket"));
    }

    let one: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let sa = sockaddr_of(&SocketAddrV4::new(ip, port));
    let rc = unsafe {
        libc::bind(
            fd,
            &sa as *const libc::sockaddr_in as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        let errno = last_errno();
        close_fd(fd);
        return Err(NativeError::new(format!(
            "tcp_listen() failed to bind: {}",
            errno_str(errno)
        )));
    }

    if unsafe { libc::listen(fd, 128) } < 0 {
        let errno = last_errno();
        close_fd(fd);
        return Err(NativeError::new(format!(
            "tcp_listen() failed to listen: {}",
            errno_str(errno)
        )));
    }
    if set_nonblocking(fd).is_err() {
        close_fd(fd);
        return Err(NativeError::new("tcp_listen() failed to set non-blocking"));
    }

    // Report the actual port when an ephemeral one was requested.
    let mut bound_port = port;
    if port == 0 {
        let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(
                fd,
                &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
                &mut len,
            )
        };
        if rc == 0 {
            bound_port = u16::from_be(sa.sin_port);
        }
    }

    Ok(vm.make_socket_map(fd, "tcp_server", &host, bound_port as i64))
}

fn accept_client(vm: &mut Vm, fd: i32) -> Result<Option<Value>, (String, &'static str)> {
    let mut sa: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    let client = unsafe {
        libc::accept(
            fd,
            &mut sa as *mut libc::sockaddr_in as *mut libc::sockaddr,
            &mut len,
        )
    };
    if client >= 0 {
        let _ = set_nonblocking(client);
        let peer = Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes());
        let port = u16::from_be(sa.sin_port);
        return Ok(Some(vm.make_socket_map(
            client,
            "tcp",
            &peer.to_string(),
            port as i64,
        )));
    }
    let errno = last_errno();
    if would_block(errno) {
        return Ok(None);
    }
    Err((format!("socket_accept() failed: {}", errno_str(errno)), NET_CONNECT))
}

// socket_accept(server[, timeout_ms]) -> promise<socket>
fn nf_socket_accept(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let server = args
        .first()
        .cloned()
        .ok_or_else(|| NativeError::new("socket_accept() requires a socket"))?;
    let fd = socket_map_fd(&server)
        .ok_or_else(|| NativeError::new("socket_accept() invalid socket"))?;
    let timeout_ms = opt_timeout(args, 1)?;

    match accept_client(vm, fd) {
        Ok(Some(client)) => Ok(vm.resolved_promise(client)),
        Ok(None) => {
            let promise = vm.new_promise();
            vm.add_pending_io(
                fd,
                Interest::Read,
                promise.clone(),
                IoOp::Accept { sock: server },
                timeout_ms,
            );
            Ok(Value::Promise(promise))
        }
        Err((msg, code)) => Ok(vm.rejected_promise(&msg, code)),
    }
}

// socket_send(sock, data[, timeout_ms]) -> promise<int>
fn nf_socket_send(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let sock = args
        .first()
        .cloned()
        .ok_or_else(|| NativeError::new("socket_send() requires a socket"))?;
    let data = want_str(args, 1, "socket_send() data")?;
    let timeout_ms = opt_timeout(args, 2)?;
    let fd =
        socket_map_fd(&sock).ok_or_else(|| NativeError::new("socket_send() invalid socket"))?;

    let bytes = data.into_bytes();

    // Secured socket: buffer plaintext into the TLS session, then flush.
    if vm.tls_sessions.contains_key(&fd) {
        let total = bytes.len();
        let step = {
            let sess = vm.tls_sessions.get_mut(&fd).unwrap();
            sess.buffer(&bytes);
            sess.flush(fd)
        };
        return Ok(match step {
            TlsSendResult::Flushed => vm.resolved_promise(Value::Int(total as i64)),
            TlsSendResult::WantRead | TlsSendResult::WantWrite => {
                let interest = if matches!(step, TlsSendResult::WantRead) {
                    Interest::Read
                } else {
                    Interest::Write
                };
                let promise = vm.new_promise();
                vm.add_pending_io(
                    fd,
                    interest,
                    promise.clone(),
                    IoOp::Send { sock, data: bytes, buffered: true },
                    timeout_ms,
                );
                Value::Promise(promise)
            }
            TlsSendResult::Error(msg) => vm.rejected_promise(&msg, TLS_WRITE),
        });
    }

    let sent = unsafe {
        libc::send(fd, bytes.as_ptr() as *const libc::c_void, bytes.len(), SEND_FLAGS)
    };
    if sent >= 0 {
        return Ok(vm.resolved_promise(Value::Int(sent as i64)));
    }

    let errno = last_errno();
    if would_block(errno) {
        let promise = vm.new_promise();
        vm.add_pending_io(
            fd,
            Interest::Write,
            promise.clone(),
            IoOp::Send { sock, data: bytes, buffered: false },
            timeout_ms,
        );
        return Ok(Value::Promise(promise));
    }

    let msg = format!("socket_send() failed: {}", errno_str(errno));
    Ok(vm.rejected_promise(&msg, NET_SEND))
}

// socket_recv(sock, max_bytes[, timeout_ms]) -> promise<string>
fn nf_socket_recv(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let sock = args
        .first()
        .cloned()
        .ok_or_else(|| NativeError::new("socket_recv() requires a socket"))?;
    let max = want_int(args, 1, "socket_recv() max_bytes")?;
    if !(1..=1_048_576).contains(&max) {
        return Err(NativeError::new(
            "socket_recv() max_bytes must be between 1 and 1048576",
        ));
    }
    let max = max as usize;
    let timeout_ms = opt_timeout(args, 2)?;
    let fd =
        socket_map_fd(&sock).ok_or_else(|| NativeError::new("socket_recv() invalid socket"))?;

    if vm.tls_sessions.contains_key(&fd) {
        let step = vm.tls_sessions.get_mut(&fd).unwrap().read_plaintext(fd, max);
        return Ok(match step {
            TlsRecvResult::Data(bytes) => {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                vm.resolved_promise(Value::from(text))
            }
            TlsRecvResult::Closed => vm.rejected_promise("connection closed", NET_CLOSED),
            TlsRecvResult::WantRead | TlsRecvResult::WantWrite => {
                let interest = if matches!(step, TlsRecvResult::WantRead) {
                    Interest::Read
                } else {
                    Interest::Write
                };
                let promise = vm.new_promise();
                vm.add_pending_io(
                    fd,
                    interest,
                    promise.clone(),
                    IoOp::Recv { sock, max },
                    timeout_ms,
                );
                Value::Promise(promise)
            }
            TlsRecvResult::Error(msg) => vm.rejected_promise(&msg, TLS_READ),
        });
    }

    let mut buf = vec![0u8; max];
    let received =
        unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, max, 0) };

    if received > 0 {
        buf.truncate(received as usize);
        let text = String::from_utf8_lossy(&buf).into_owned();
        return Ok(vm.resolved_promise(Value::from(text)));
    }
    if received == 0 {
        return Ok(vm.rejected_promise("connection closed", NET_CLOSED));
    }

    let errno = last_errno();
    if would_block(errno) {
        let promise = vm.new_promise();
        vm.add_pending_io(
            fd,
            Interest::Read,
            promise.clone(),
            IoOp::Recv { sock, max },
            timeout_ms,
        );
        return Ok(Value::Promise(promise));
    }

    let msg = format!("socket_recv() failed: {}", errno_str(errno));
    Ok(vm.rejected_promise(&msg, NET_RECV))
}

// socket_close(sock) -> nil
fn nf_socket_close(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let sock = args
        .first()
        .cloned()
        .ok_or_else(|| NativeError::new("socket_close() requires a socket"))?;
    if let Some(fd) = socket_map_fd(&sock) {
        vm.remove_pending_io(fd);
        vm.tls_sessions.remove(&fd);
        close_fd(fd);
        sock.map_set(KEY_FD, Value::Int(-1));
    }
    Ok(Value::Nil)
}

// net_set_default_timeout(ms) -> nil
fn nf_net_set_default_timeout(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let ms = want_int(args, 0, "net_set_default_timeout() ms")?;
    if ms < 0 {
        return Err(NativeError::new("net_set_default_timeout() ms must be >= 0"));
    }
    vm.net_default_timeout_ms = ms as u64;
    Ok(Value::Nil)
}

pub fn register_net_stdlib(vm: &mut Vm) {
    vm.register_native("tcp_connect", nf_tcp_connect);
    vm.register_native("tcp_listen", nf_tcp_listen);
    vm.register_native("socket_accept", nf_socket_accept);
    vm.register_native("socket_send", nf_socket_send);
    vm.register_native("socket_recv", nf_socket_recv);
    vm.register_native("socket_close", nf_socket_close);
    vm.register_native("net_set_default_timeout", nf_net_set_default_timeout);
}

// ----------------------------------------------------------------------
// Readiness handlers
// ----------------------------------------------------------------------

impl Vm {
    /// Re-register a record with a (possibly new) interest mask without
    /// resetting its timeout clock.
    fn rearm(
        &mut self,
        fd: i32,
        interest: Interest,
        promise: std::rc::Rc<crate::event_loop::promise::Promise>,
        op: IoOp,
        timeout_ms: u64,
        start_ms: u64,
    ) {
        self.pending_io.push(PendingIo { fd, interest, promise, op, timeout_ms, start_ms });
    }

    /// Invoked by the event loop when a pending record's fd is ready.
    /// Settles the promise, or re-registers the record (TLS sessions
    /// flip between read and write interest mid-operation).
    pub(crate) fn handle_ready_io(&mut self, io: PendingIo, _span: Span) -> Result<(), Control> {
        let PendingIo { fd, interest: _, promise, op, timeout_ms, start_ms } = io;
        match op {
            IoOp::Connect { sock } => {
                let err = socket_error(fd);
                if err == 0 {
                    promise.resolve(sock);
                } else {
                    close_fd(fd);
                    sock.map_set(KEY_FD, Value::Int(-1));
                    let msg = format!("tcp_connect() failed: {}", errno_str(err));
                    let err = self.net_error_value(&msg, NET_CONNECT);
                    promise.reject(err);
                }
                Ok(())
            }

            IoOp::Send { sock, data, buffered } => {
                if self.tls_sessions.contains_key(&fd) {
                    let total = data.len();
                    let step = {
                        let sess = self.tls_sessions.get_mut(&fd).unwrap();
                        if !buffered {
                            sess.buffer(&data);
                        }
                        sess.flush(fd)
                    };
                    match step {
                        TlsSendResult::Flushed => {
                            promise.resolve(Value::Int(total as i64));
                        }
                        TlsSendResult::WantRead | TlsSendResult::WantWrite => {
                            let interest = if matches!(step, TlsSendResult::WantRead) {
                                Interest::Read
                            } else {
                                Interest::Write
                            };
                            self.rearm(
                                fd,
                                interest,
                                promise,
                                IoOp::Send { sock, data, buffered: true },
                                timeout_ms,
                                start_ms,
                            );
                        }
                        TlsSendResult::Error(msg) => {
                            let err = self.net_error_value(&msg, TLS_WRITE);
                            promise.reject(err);
                        }
                    }
                    return Ok(());
                }

                let sent = unsafe {
                    libc::send(fd, data.as_ptr() as *const libc::c_void, data.len(), SEND_FLAGS)
                };
                if sent >= 0 {
                    promise.resolve(Value::Int(sent as i64));
                    return Ok(());
                }
                let errno = last_errno();
                if would_block(errno) {
                    self.rearm(
                        fd,
                        Interest::Write,
                        promise,
                        IoOp::Send { sock, data, buffered },
                        timeout_ms,
                        start_ms,
                    );
                    return Ok(());
                }
                let msg = format!("socket_send() failed: {}", errno_str(errno));
                let err = self.net_error_value(&msg, NET_SEND);
                promise.reject(err);
                Ok(())
            }

            IoOp::Recv { sock, max } => {
                if self.tls_sessions.contains_key(&fd) {
                    let step =
                        self.tls_sessions.get_mut(&fd).unwrap().read_plaintext(fd, max);
                    match step {
                        TlsRecvResult::Data(bytes) => {
                            let text = String::from_utf8_lossy(&bytes).into_owned();
                            promise.resolve(Value::from(text));
                        }
                        TlsRecvResult::Closed => {
                            let err = self.net_error_value("connection closed", NET_CLOSED);
                            promise.reject(err);
                        }
                        TlsRecvResult::WantRead | TlsRecvResult::WantWrite => {
                            let interest = if matches!(step, TlsRecvResult::WantRead) {
                                Interest::Read
                            } else {
                                Interest::Write
                            };
                            self.rearm(
                                fd,
                                interest,
                                promise,
                                IoOp::Recv { sock, max },
                                timeout_ms,
                                start_ms,
                            );
                        }
                        TlsRecvResult::Error(msg) => {
                            let err = self.net_error_value(&msg, TLS_READ);
                            promise.reject(err);
                        }
                    }
                    return Ok(());
                }

                let mut buf = vec![0u8; max];
                let received =
                    unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, max, 0) };
                if received > 0 {
                    buf.truncate(received as usize);
                    let text = String::from_utf8_lossy(&buf).into_owned();
                    promise.resolve(Value::from(text));
                    return Ok(());
                }
                if received == 0 {
                    let err = self.net_error_value("connection closed", NET_CLOSED);
                    promise.reject(err);
                    return Ok(());
                }
                let errno = last_errno();
                if would_block(errno) {
                    self.rearm(
                        fd,
                        Interest::Read,
                        promise,
                        IoOp::Recv { sock, max },
                        timeout_ms,
                        start_ms,
                    );
                    return Ok(());
                }
                let msg = format!("socket_recv() failed: {}", errno_str(errno));
                let err = self.net_error_value(&msg, NET_RECV);
                promise.reject(err);
                Ok(())
            }

            IoOp::Accept { sock } => {
                match accept_client(self, fd) {
                    Ok(Some(client)) => {
                        promise.resolve(client);
                    }
                    Ok(None) => {
                        // Spurious wakeup; re-arm.
                        self.rearm(
                            fd,
                            Interest::Read,
                            promise,
                            IoOp::Accept { sock },
                            timeout_ms,
                            start_ms,
                        );
                    }
                    Err((msg, code)) => {
                        let err = self.net_error_value(&msg, code);
                        promise.reject(err);
                    }
                }
                Ok(())
            }

            IoOp::TlsConnect { sock, hostname, connected } => {
                if !connected {
                    let err = socket_error(fd);
                    if err != 0 {
                        close_fd(fd);
                        sock.map_set(KEY_FD, Value::Int(-1));
                        let msg = format!("tls_connect() failed: {}", errno_str(err));
                        let err = self.net_error_value(&msg, NET_CONNECT);
                        promise.reject(err);
                        return Ok(());
                    }
                    match crate::network::tls::TlsSession::new(&hostname) {
                        Ok(sess) => {
                            self.tls_sessions.insert(fd, sess);
                        }
                        Err(msg) => {
                            let err = self.net_error_value(&msg, TLS_INIT);
                            promise.reject(err);
                            return Ok(());
                        }
                    }
                }
                self.continue_handshake(fd, promise, sock, hostname, false, timeout_ms, start_ms)
            }

            IoOp::TlsUpgrade { sock, hostname } => {
                self.continue_handshake(fd, promise, sock, hostname, true, timeout_ms, start_ms)
            }
        }
    }

    /// Drive a TLS handshake step; re-register on want-read/want-write,
    /// settle on completion or failure.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn continue_handshake(
        &mut self,
        fd: i32,
        promise: std::rc::Rc<crate::event_loop::promise::Promise>,
        sock: Value,
        hostname: String,
        upgrade: bool,
        timeout_ms: u64,
        start_ms: u64,
    ) -> Result<(), Control> {
        let step = match self.tls_sessions.get_mut(&fd) {
            Some(sess) => sess.handshake(fd),
            None => HsStep::Error("TLS session missing".to_string()),
        };

        match step {
            HsStep::Complete => {
                sock.map_set(KEY_TLS, Value::Int(1));
                sock.map_set(KEY_SECURE, Value::Bool(true));
                if upgrade {
                    promise.resolve(Value::Nil);
                } else {
                    promise.resolve(sock);
                }
            }
            HsStep::WantRead | HsStep::WantWrite => {
                let interest = if matches!(step, HsStep::WantRead) {
                    Interest::Read
                } else {
                    Interest::Write
                };
                let op = if upgrade {
                    IoOp::TlsUpgrade { sock, hostname }
                } else {
                    IoOp::TlsConnect { sock, hostname, connected: true }
                };
                self.rearm(fd, interest, promise, op, timeout_ms, start_ms);
            }
            HsStep::CertError(msg) => {
                self.tls_sessions.remove(&fd);
                let err = self.net_error_value(&msg, TLS_CERT);
                promise.reject(err);
            }
            HsStep::Error(msg) => {
                self.tls_sessions.remove(&fd);
                let err = self.net_error_value(&msg, TLS_HANDSHAKE);
                promise.reject(err);
            }
        }
        Ok(())
    }
}
