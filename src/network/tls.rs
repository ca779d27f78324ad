//! TLS Layer
//!
//! Client-side TLS over the non-blocking sockets, built on rustls. The
//! rustls connection is sans-IO: it tells us whether it wants to read
//! or write, which maps directly onto the pending-I/O re-registration
//! the event loop performs. Certificate verification runs against the
//! platform trust roots and is always on; a failed verification rejects
//! the handshake promise with `TLS_CERT`.
//!
//! Sessions live in a VM-side table keyed by fd; the socket map's
//! `_tls` key marks the socket as secured and `_secure` flips true only
//! after a completed, verified handshake.

use std::io::{Read, Write};
use std::sync::Arc;

use lazy_static::lazy_static;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, RootCertStore};

use crate::event_loop::scheduler::{Interest, IoOp};
use crate::interpreter::stdlib::want_str;
use crate::network::types::*;
use crate::value::{NativeError, Value};
use crate::vm::Vm;

lazy_static! {
    /// Shared client configuration: platform roots, peer verification
    /// on, no client certificates. Built once per process.
    static ref TLS_CONFIG: Result<Arc<ClientConfig>, String> = build_client_config();
}

fn build_client_config() -> Result<Arc<ClientConfig>, String> {
    let mut roots = RootCertStore::empty();
    let certs = rustls_native_certs::load_native_certs()
        .map_err(|e| format!("failed to load system trust roots: {}", e))?;
    for cert in certs {
        let _ = roots.add(cert);
    }
    if roots.is_empty() {
        return Err("no usable system trust roots".to_string());
    }
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Raw-fd adapter for rustls' record I/O. EAGAIN surfaces as
/// `WouldBlock`, which the callers translate into re-registration.
struct FdIo(i32);

impl Read for FdIo {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = unsafe { libc::read(self.0, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }
}

impl Write for FdIo {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = unsafe { libc::write(self.0, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(n as usize)
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Outcome of one handshake step.
pub(crate) enum HsStep {
    Complete,
    WantRead,
    WantWrite,
    CertError(String),
    Error(String),
}

pub(crate) enum TlsSendResult {
    Flushed,
    WantRead,
    WantWrite,
    Error(String),
}

pub(crate) enum TlsRecvResult {
    Data(Vec<u8>),
    Closed,
    WantRead,
    WantWrite,
    Error(String),
}

/// One TLS session bound to a socket fd.
pub struct TlsSession {
    conn: ClientConnection,
}

impl TlsSession {
    pub(crate) fn new(hostname: &str) -> Result<Self, String> {
        let config = match &*TLS_CONFIG {
            Ok(c) => c.clone(),
            Err(e) => return Err(e.clone()),
        };
        let name = ServerName::try_from(hostname.to_string())
            .map_err(|_| format!("invalid TLS server name '{}'", hostname))?;
        let conn = ClientConnection::new(config, name)
            .map_err(|e| format!("failed to create TLS session: {}", e))?;
        Ok(Self { conn })
    }

    /// Advance the handshake as far as the socket allows.
    pub(crate) fn handshake(&mut self, fd: i32) -> HsStep {
        loop {
            while self.conn.wants_write() {
                match self.conn.write_tls(&mut FdIo(fd)) {
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        return HsStep::WantWrite;
                    }
                    Err(e) => return HsStep::Error(format!("TLS write failed: {}", e)),
                }
            }

            if !self.conn.is_handshaking() {
                return HsStep::Complete;
            }

            if self.conn.wants_read() {
                match self.conn.read_tls(&mut FdIo(fd)) {
                    Ok(0) => return HsStep::Error("connection closed during handshake".into()),
                    Ok(_) => match self.conn.process_new_packets() {
                        Ok(_) => {}
                        Err(rustls::Error::InvalidCertificate(e)) => {
                            return HsStep::CertError(format!(
                                "certificate verification failed: {:?}",
                                e
                            ));
                        }
                        Err(e) => return HsStep::Error(format!("TLS handshake failed: {}", e)),
                    },
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        return HsStep::WantRead;
                    }
                    Err(e) => return HsStep::Error(format!("TLS read failed: {}", e)),
                }
            }
        }
    }

    /// Queue plaintext for encryption. rustls buffers it internally; the
    /// encrypted records go out via `flush`.
    pub(crate) fn buffer(&mut self, data: &[u8]) {
        let _ = self.conn.writer().write_all(data);
    }

    /// Push buffered TLS records to the socket.
    pub(crate) fn flush(&mut self, fd: i32) -> TlsSendResult {
        while self.conn.wants_write() {
            match self.conn.write_tls(&mut FdIo(fd)) {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return TlsSendResult::WantWrite;
                }
                Err(e) => return TlsSendResult::Error(format!("TLS write failed: {}", e)),
            }
        }
        TlsSendResult::Flushed
    }

    /// Read up to `max` decrypted bytes, pulling TLS records off the
    /// socket as needed.
    pub(crate) fn read_plaintext(&mut self, fd: i32, max: usize) -> TlsRecvResult {
        loop {
            let mut buf = vec![0u8; max];
            match self.conn.reader().read(&mut buf) {
                Ok(0) => return TlsRecvResult::Closed,
                Ok(n) => {
                    buf.truncate(n);
                    return TlsRecvResult::Data(buf);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    // No plaintext buffered; try to pull records.
                }
                Err(e) => return TlsRecvResult::Error(format!("TLS read failed: {}", e)),
            }

            match self.conn.read_tls(&mut FdIo(fd)) {
                Ok(0) => return TlsRecvResult::Closed,
                Ok(_) => match self.conn.process_new_packets() {
                    Ok(_) => {}
                    Err(e) => return TlsRecvResult::Error(format!("TLS record error: {}", e)),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    return TlsRecvResult::WantRead;
                }
                Err(e) => return TlsRecvResult::Error(format!("TLS read failed: {}", e)),
            }
        }
    }

    /// Negotiated protocol and cipher names, once the handshake is done.
    pub(crate) fn info(&self) -> (String, String) {
        let protocol = match self.conn.protocol_version() {
            Some(rustls::ProtocolVersion::TLSv1_3) => "TLSv1.3".to_string(),
            Some(rustls::ProtocolVersion::TLSv1_2) => "TLSv1.2".to_string(),
            Some(other) => format!("{:?}", other),
            None => "unknown".to_string(),
        };
        let cipher = match self.conn.negotiated_cipher_suite() {
            Some(suite) => format!("{:?}", suite.suite()),
            None => "unknown".to_string(),
        };
        (protocol, cipher)
    }
}

// ----------------------------------------------------------------------
// Natives
// ----------------------------------------------------------------------

// tls_connect(host, port[, timeout_ms]) -> promise<socket>
fn nf_tls_connect(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let host = want_str(args, 0, "tls_connect() host")?;

    // Establish the TCP leg with the shared connect logic, then layer
    // the handshake over it.
    let connect_result = vm.call("tcp_connect", args);
    let promise_value = match connect_result {
        Ok(v) => v,
        Err(e) => return Err(NativeError::new(e.to_string())),
    };

    let inner = match &promise_value {
        Value::Promise(p) => p.clone(),
        _ => return Err(NativeError::new("tls_connect() internal error")),
    };

    // Fast path: the TCP connect finished (or failed) synchronously.
    if let Some(settlement) = inner.settlement() {
        return match settlement {
            Ok(sock) => {
                let fd = socket_map_fd(&sock)
                    .ok_or_else(|| NativeError::new("tls_connect() invalid socket"))?;
                start_handshake(vm, sock, fd, &host, false)
            }
            Err(err) => {
                let p = vm.new_promise();
                p.reject(err);
                Ok(Value::Promise(p))
            }
        };
    }

    // Connect is in flight: retarget its pending record into the TLS
    // connect state machine so the handshake starts on writability.
    let promise = vm.new_promise();
    let mut retargeted = false;
    for io in vm.pending_io.iter_mut() {
        if std::rc::Rc::ptr_eq(&io.promise, &inner) {
            if let IoOp::Connect { sock } = &io.op {
                io.op = IoOp::TlsConnect {
                    sock: sock.clone(),
                    hostname: host.clone(),
                    connected: false,
                };
                io.promise = promise.clone();
                retargeted = true;
            }
            break;
        }
    }
    if !retargeted {
        return Err(NativeError::new("tls_connect() internal error"));
    }
    Ok(Value::Promise(promise))
}

fn start_handshake(
    vm: &mut Vm,
    sock: Value,
    fd: i32,
    hostname: &str,
    upgrade: bool,
) -> Result<Value, NativeError> {
    let sess = match TlsSession::new(hostname) {
        Ok(s) => s,
        Err(msg) => return Ok(vm.rejected_promise(&msg, TLS_INIT)),
    };
    vm.tls_sessions.insert(fd, sess);

    let step = vm.tls_sessions.get_mut(&fd).unwrap().handshake(fd);
    match step {
        HsStep::Complete => {
            sock.map_set(KEY_TLS, Value::Int(1));
            sock.map_set(KEY_SECURE, Value::Bool(true));
            let result = if upgrade { Value::Nil } else { sock };
            Ok(vm.resolved_promise(result))
        }
        HsStep::WantRead | HsStep::WantWrite => {
            let interest = if matches!(step, HsStep::WantRead) {
                Interest::Read
            } else {
                Interest::Write
            };
            let promise = vm.new_promise();
            let op = if upgrade {
                IoOp::TlsUpgrade { sock, hostname: hostname.to_string() }
            } else {
                IoOp::TlsConnect { sock, hostname: hostname.to_string(), connected: true }
            };
            vm.add_pending_io(fd, interest, promise.clone(), op, 0);
            Ok(Value::Promise(promise))
        }
        HsStep::CertError(msg) => {
            vm.tls_sessions.remove(&fd);
            Ok(vm.rejected_promise(&msg, TLS_CERT))
        }
        HsStep::Error(msg) => {
            vm.tls_sessions.remove(&fd);
            Ok(vm.rejected_promise(&msg, TLS_HANDSHAKE))
        }
    }
}

// tls_upgrade(sock, hostname) -> promise<nil>
fn nf_tls_upgrade(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let sock = args
        .first()
        .cloned()
        .ok_or_else(|| NativeError::new("tls_upgrade() requires a socket"))?;
    let hostname = want_str(args, 1, "tls_upgrade() hostname")?;
    let fd =
        socket_map_fd(&sock).ok_or_else(|| NativeError::new("tls_upgrade() invalid socket"))?;
    if vm.tls_sessions.contains_key(&fd) {
        return Err(NativeError::new("tls_upgrade() socket is already secured"));
    }
    start_handshake(vm, sock, fd, &hostname, true)
}

// socket_is_secure(sock) -> bool
fn nf_socket_is_secure(_vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let sock = args
        .first()
        .cloned()
        .ok_or_else(|| NativeError::new("socket_is_secure() requires a socket"))?;
    Ok(Value::Bool(sock.map_get(KEY_SECURE).is_truthy()))
}

// tls_info(sock) -> { protocol, cipher } | nil
fn nf_tls_info(vm: &mut Vm, args: &[Value]) -> Result<Value, NativeError> {
    let sock = args
        .first()
        .cloned()
        .ok_or_else(|| NativeError::new("tls_info() requires a socket"))?;
    let fd = match socket_map_fd(&sock) {
        Some(fd) => fd,
        None => return Ok(Value::Nil),
    };
    let (protocol, cipher) = match vm.tls_sessions.get(&fd) {
        Some(sess) => sess.info(),
        None => return Ok(Value::Nil),
    };
    let info = vm.new_map();
    info.map_set("protocol", Value::from(protocol));
    info.map_set("cipher", Value::from(cipher));
    Ok(info)
}

pub fn register_tls_stdlib(vm: &mut Vm) {
    vm.register_native("tls_connect", nf_tls_connect);
    vm.register_native("tls_upgrade", nf_tls_upgrade);
    vm.register_native("socket_is_secure", nf_socket_is_secure);
    vm.register_native("tls_info", nf_tls_info);
}
