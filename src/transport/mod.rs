//! Line transports: the adapters that pump bytes between the outside
//! world (TCP sockets, UARTs) and the pipe plane. Three variants share one
//! lifecycle: attach on connect, pump while up, detach on hangup. `local`
//! lines have no transport at all; the desktop shell drives them.

pub mod telnet;

#[cfg(feature = "serial")]
pub mod serial;

use std::sync::atomic::{AtomicBool, Ordering};

use crate::config::LineType;

/// Per-line flags shared between the transport task and the scheduler.
/// This is deliberately tiny: everything else flows through the pipes.
pub struct LineShared {
    pub line_type: LineType,
    pub enabled: bool,
    connected: AtomicBool,
    transfer_active: AtomicBool,
    cancel: AtomicBool,
}

impl LineShared {
    pub fn new(line_type: LineType, enabled: bool) -> Self {
        LineShared {
            line_type,
            enabled,
            connected: AtomicBool::new(false),
            transfer_active: AtomicBool::new(false),
            cancel: AtomicBool::new(false),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Claim the line for a new connection; false if already taken.
    pub fn claim(&self) -> bool {
        self.connected
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn release(&self) {
        self.connected.store(false, Ordering::Release);
        self.cancel.store(false, Ordering::Release);
        self.transfer_active.store(false, Ordering::Release);
    }

    pub fn transfer_active(&self) -> bool {
        self.transfer_active.load(Ordering::Acquire)
    }

    pub fn set_transfer_active(&self, active: bool) {
        self.transfer_active.store(active, Ordering::Release);
    }

    /// Ask the transport (and scheduler) to drop the line.
    pub fn request_cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }
}

/// All lines plus the global accept toggle.
pub struct LineTable {
    pub lines: Vec<LineShared>,
    accepting: AtomicBool,
}

impl LineTable {
    pub fn new(lines: Vec<LineShared>) -> Self {
        LineTable { lines, accepting: AtomicBool::new(true) }
    }

    pub fn accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn set_accepting(&self, on: bool) {
        self.accepting.store(on, Ordering::Release);
    }

    /// Claim the first free, enabled line of the given type.
    pub fn claim_free(&self, line_type: LineType) -> Option<usize> {
        self.lines
            .iter()
            .enumerate()
            .find(|(_, l)| l.line_type == line_type && l.enabled && l.claim())
            .map(|(i, _)| i)
    }
}

/// Events from transports toward the session scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected { line: usize, peer: String },
    Disconnected { line: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_is_exclusive() {
        let table = LineTable::new(vec![
            LineShared::new(LineType::Local, true),
            LineShared::new(LineType::Telnet, true),
            LineShared::new(LineType::Telnet, false),
        ]);
        // Only the enabled telnet line is claimable, and only once.
        assert_eq!(table.claim_free(LineType::Telnet), Some(1));
        assert_eq!(table.claim_free(LineType::Telnet), None);
        table.lines[1].release();
        assert_eq!(table.claim_free(LineType::Telnet), Some(1));
    }

    #[test]
    fn release_clears_flags() {
        let shared = LineShared::new(LineType::Telnet, true);
        assert!(shared.claim());
        shared.set_transfer_active(true);
        shared.request_cancel();
        shared.release();
        assert!(!shared.is_connected());
        assert!(!shared.transfer_active());
        assert!(!shared.cancel_requested());
    }
}
