//! Networking Types and Conventions
//!
//! The socket map is the canonical reference to a socket: a plain map
//! whose well-known keys the networking natives interpret. Errors cross
//! into script as maps `{ msg, code }` carried by rejected promises.

use crate::value::Value;
use crate::vm::Vm;

/// Well-known socket map keys.
pub const KEY_FD: &str = "_fd";
pub const KEY_TYPE: &str = "_type";
pub const KEY_TLS: &str = "_tls";
pub const KEY_SECURE: &str = "_secure";
pub const KEY_HOST: &str = "host";
pub const KEY_PORT: &str = "port";

/// Documented error codes on rejected promises.
pub const NET_RESOLVE: &str = "NET_RESOLVE";
pub const NET_CONNECT: &str = "NET_CONNECT";
pub const NET_SEND: &str = "NET_SEND";
pub const NET_RECV: &str = "NET_RECV";
pub const NET_CLOSED: &str = "NET_CLOSED";
pub const NET_TIMEOUT: &str = "NET_TIMEOUT";
pub const TLS_INIT: &str = "TLS_INIT";
pub const TLS_HANDSHAKE: &str = "TLS_HANDSHAKE";
pub const TLS_CERT: &str = "TLS_CERT";
pub const TLS_READ: &str = "TLS_READ";
pub const TLS_WRITE: &str = "TLS_WRITE";

/// The fd a socket map refers to, or `None` when the map is not a
/// socket or has been closed (`_fd = -1`).
pub fn socket_map_fd(sock: &Value) -> Option<i32> {
    match sock {
        Value::Map(_) => match sock.map_get(KEY_FD) {
            Value::Int(fd) if fd >= 0 => Some(fd as i32),
            _ => None,
        },
        _ => None,
    }
}

impl Vm {
    /// `{ msg, code }` error map for promise rejections.
    pub(crate) fn net_error_value(&mut self, msg: &str, code: &str) -> Value {
        let err = self.new_map();
        err.map_set("msg", Value::str(msg));
        err.map_set("code", Value::str(code));
        err
    }

    pub(crate) fn make_socket_map(
        &mut self,
        fd: i32,
        socket_type: &str,
        host: &str,
        port: i64,
    ) -> Value {
        let sock = self.new_map();
        sock.map_set(KEY_FD, Value::Int(fd as i64));
        sock.map_set(KEY_TYPE, Value::str(socket_type));
        if !host.is_empty() {
            sock.map_set(KEY_HOST, Value::str(host));
        }
        if port > 0 {
            sock.map_set(KEY_PORT, Value::Int(port));
        }
        sock
    }

    /// A promise already settled with `value`; the synchronous fast path
    /// of socket operations.
    pub(crate) fn resolved_promise(&mut self, value: Value) -> Value {
        let p = self.new_promise();
        p.resolve(value);
        Value::Promise(p)
    }

    pub(crate) fn rejected_promise(&mut self, msg: &str, code: &str) -> Value {
        let err = self.net_error_value(msg, code);
        let p = self.new_promise();
        p.reject(err);
        Value::Promise(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_map_fd() {
        let mut vm = Vm::new();
        let sock = vm.make_socket_map(7, "tcp", "example.com", 80);
        assert_eq!(socket_map_fd(&sock), Some(7));
        assert_eq!(sock.map_get(KEY_TYPE).as_str(), Some("tcp"));
        assert_eq!(sock.map_get(KEY_PORT).as_int(), Some(80));

        sock.map_set(KEY_FD, Value::Int(-1));
        assert_eq!(socket_map_fd(&sock), None);
        assert_eq!(socket_map_fd(&Value::Int(3)), None);
    }

    #[test]
    fn test_error_value_shape() {
        let mut vm = Vm::new();
        let err = vm.net_error_value("boom", NET_RECV);
        assert_eq!(err.map_get("msg").as_str(), Some("boom"));
        assert_eq!(err.map_get("code").as_str(), Some("NET_RECV"));
    }
}
