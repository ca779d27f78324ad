//! Cooperative Scheduler
//!
//! Single-threaded event loop colocated with the interpreter. Script
//! tasks run in FIFO order, timers settle in due-time order (insertion
//! order breaks ties), and pending socket I/O is polled with `poll(2)`.
//! `await` pumps this loop until the awaited promise settles; I/O
//! callbacks run synchronously inside the pass that observed readiness.

use std::rc::Rc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::ast::types::Span;
use crate::event_loop::promise::Promise;
use crate::interpreter::errors::Control;
use crate::value::{Function, Value};
use crate::vm::Vm;

/// Upper bound on one blocking poll/sleep so interrupt and timeout
/// checks keep flowing while the loop waits.
const POLL_SLICE_MS: u64 = 50;

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A queued script task: an async function call and the promise that
/// observes its outcome.
pub(crate) struct Task {
    pub func: Rc<Function>,
    pub args: Vec<Value>,
    pub promise: Rc<Promise>,
}

pub(crate) struct Timer {
    pub due_ms: u64,
    /// Insertion order, to break due-time ties deterministically.
    pub seq: u64,
    pub promise: Rc<Promise>,
}

/// Readiness interest of one pending I/O record.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Interest {
    Read,
    Write,
}

/// Operation-specific state of a suspended socket operation.
#[cfg(unix)]
pub(crate) enum IoOp {
    Connect { sock: Value },
    Send { sock: Value, data: Vec<u8>, buffered: bool },
    Recv { sock: Value, max: usize },
    Accept { sock: Value },
    TlsConnect { sock: Value, hostname: String, connected: bool },
    TlsUpgrade { sock: Value, hostname: String },
}

#[cfg(unix)]
impl IoOp {
    pub(crate) fn socket_value(&self) -> Value {
        match self {
            IoOp::Connect { sock }
            | IoOp::Send { sock, .. }
            | IoOp::Recv { sock, .. }
            | IoOp::Accept { sock }
            | IoOp::TlsConnect { sock, .. }
            | IoOp::TlsUpgrade { sock, .. } => sock.clone(),
        }
    }
}

/// One registered pending I/O: `(fd, interest, promise, op, timeout)`.
#[cfg(unix)]
pub(crate) struct PendingIo {
    pub fd: i32,
    pub interest: Interest,
    pub promise: Rc<Promise>,
    pub op: IoOp,
    /// 0 means "use the VM default".
    pub timeout_ms: u64,
    pub start_ms: u64,
}

impl Vm {
    pub(crate) fn schedule_timer(&mut self, promise: Rc<Promise>, due_ms: u64) {
        self.timer_seq += 1;
        self.timers.push(Timer { due_ms, seq: self.timer_seq, promise });
    }

    #[cfg(unix)]
    pub(crate) fn add_pending_io(
        &mut self,
        fd: i32,
        interest: Interest,
        promise: Rc<Promise>,
        op: IoOp,
        timeout_ms: u64,
    ) {
        self.pending_io.push(PendingIo {
            fd,
            interest,
            promise,
            op,
            timeout_ms,
            start_ms: now_millis(),
        });
    }

    /// Drop every pending record for an fd. Their promises stay pending
    /// for any remaining holders.
    #[cfg(unix)]
    pub(crate) fn remove_pending_io(&mut self, fd: i32) {
        self.pending_io.retain(|io| io.fd != fd);
    }

    /// Pump the loop until `promise` settles. Rejections re-throw into
    /// the awaiting script; a provably stuck wait is a runtime error.
    pub(crate) fn wait_promise(
        &mut self,
        promise: &Rc<Promise>,
        span: Span,
    ) -> Result<Value, Control> {
        loop {
            if let Some(settlement) = promise.settlement() {
                return match settlement {
                    Ok(v) => Ok(v),
                    Err(e) => Err(Control::Throw(e)),
                };
            }
            self.check_safepoint(span)?;
            let progressed = self.pump_once(span)?;
            if !progressed && promise.is_pending() && self.scheduler_idle() {
                return Err(self.error("deadlock: awaited promise can never settle", span));
            }
        }
    }

    fn scheduler_idle(&self) -> bool {
        self.tasks.is_empty() && self.timers.is_empty() && self.io_idle()
    }

    #[cfg(unix)]
    fn io_idle(&self) -> bool {
        self.pending_io.is_empty()
    }

    #[cfg(not(unix))]
    fn io_idle(&self) -> bool {
        true
    }

    /// One event-loop pass: run one ready task, settle due timers, poll
    /// pending I/O. Returns whether anything made progress.
    pub(crate) fn pump_once(&mut self, span: Span) -> Result<bool, Control> {
        let mut progressed = false;

        if let Some(task) = self.tasks.pop_front() {
            self.run_task(task, span)?;
            progressed = true;
        }

        if self.settle_due_timers() {
            progressed = true;
        }

        if let Some(io_progressed) = self.poll_io_pass(span)? {
            return Ok(progressed || io_progressed);
        }

        // Nothing pollable: if only timers remain, sleep toward the next
        // deadline (bounded) so the wait loop advances.
        if !progressed && !self.timers.is_empty() {
            let now = now_millis();
            let next = self.timers.iter().map(|t| t.due_ms).min().unwrap_or(now);
            let wait = next.saturating_sub(now).min(POLL_SLICE_MS);
            std::thread::sleep(Duration::from_millis(wait.max(1)));
            progressed = true;
        }

        Ok(progressed)
    }

    /// Poll pending I/O if any exists. `None` means there was nothing
    /// to poll and the caller should fall back to timer sleeping.
    #[cfg(unix)]
    fn poll_io_pass(&mut self, span: Span) -> Result<Option<bool>, Control> {
        if self.pending_io.is_empty() {
            return Ok(None);
        }
        let timeout = self.compute_poll_timeout();
        Ok(Some(self.poll_pending_io(timeout, span)?))
    }

    #[cfg(not(unix))]
    fn poll_io_pass(&mut self, _span: Span) -> Result<Option<bool>, Control> {
        Ok(None)
    }

    fn run_task(&mut self, task: Task, span: Span) -> Result<(), Control> {
        match self.invoke_function(&task.func, task.args, span) {
            Ok(v) => {
                task.promise.resolve(v);
                Ok(())
            }
            Err(Control::Throw(v)) => {
                task.promise.reject(v);
                Ok(())
            }
            Err(Control::Error(e)) => {
                let err = self.new_map();
                err.map_set("msg", Value::str(&e.message));
                err.map_set("code", Value::str("RUNTIME"));
                task.promise.reject(err);
                Ok(())
            }
            // Safety aborts tear down the whole loop.
            Err(other) => Err(other),
        }
    }

    /// Resolve every timer whose deadline has passed, in due-time order
    /// with insertion order breaking ties.
    fn settle_due_timers(&mut self) -> bool {
        let now = now_millis();
        let mut due: Vec<Timer> = Vec::new();
        let mut i = 0;
        while i < self.timers.len() {
            if self.timers[i].due_ms <= now {
                due.push(self.timers.remove(i));
            } else {
                i += 1;
            }
        }
        if due.is_empty() {
            return false;
        }
        due.sort_by_key(|t| (t.due_ms, t.seq));
        for timer in due {
            timer.promise.resolve(Value::Nil);
        }
        true
    }

    #[cfg(unix)]
    fn compute_poll_timeout(&self) -> i32 {
        if !self.tasks.is_empty() {
            return 0;
        }
        let mut timeout = POLL_SLICE_MS;
        if let Some(next) = self.timers.iter().map(|t| t.due_ms).min() {
            timeout = timeout.min(next.saturating_sub(now_millis()));
        }
        timeout as i32
    }

    #[cfg(unix)]
    fn poll_pending_io(&mut self, timeout_ms: i32, span: Span) -> Result<bool, Control> {
        if self.pending_io.is_empty() {
            return Ok(false);
        }

        let mut fds: Vec<libc::pollfd> = self
            .pending_io
            .iter()
            .map(|io| libc::pollfd {
                fd: io.fd,
                events: match io.interest {
                    Interest::Read => libc::POLLIN,
                    Interest::Write => libc::POLLOUT,
                },
                revents: 0,
            })
            .collect();

        let ret = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };

        let now = now_millis();
        let mut progressed = false;
        let ios = std::mem::take(&mut self.pending_io);
        let mut keep = Vec::new();

        for (idx, io) in ios.into_iter().enumerate() {
            let ready = ret > 0 && fds[idx].revents != 0;
            if ready {
                // Handlers settle the record or re-register it with a
                // fresh interest mask.
                self.handle_ready_io(io, span)?;
                progressed = true;
                continue;
            }
            let timeout = if io.timeout_ms != 0 {
                io.timeout_ms
            } else {
                self.net_default_timeout_ms
            };
            if timeout != 0 && now.saturating_sub(io.start_ms) >= timeout {
                let err = self.net_error_value("operation timed out", "NET_TIMEOUT");
                io.promise.reject(err);
                progressed = true;
            } else {
                keep.push(io);
            }
        }

        // Records the handlers re-armed were pushed onto the (empty)
        // live list; keep the untouched ones ahead of them.
        let rearmed = std::mem::replace(&mut self.pending_io, keep);
        self.pending_io.extend(rearmed);

        Ok(progressed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_millis_monotonic_enough() {
        let a = now_millis();
        let b = now_millis();
        assert!(b >= a);
    }
}
