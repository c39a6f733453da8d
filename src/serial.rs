//! Serial receive path: realtime character pick-off and line assembly.
//!
//! Bytes arrive on the receive side (an ISR on boards, any thread on hosts)
//! and are pushed into [`SerialRx`]. Realtime command characters never reach
//! the buffer: they flip executor flag bits inline and vanish. Everything
//! else queues for the protocol loop, which drains bytes through a
//! [`LineAssembler`] into clean, upper-cased, comment-free lines.

use std::sync::Arc;

use heapless::Deque;
use parking_lot::Mutex;

use crate::status::Status;
use crate::system::{RtExec, RtOverride, RtSignals};

/// Maximum accepted input line length, comments and spaces excluded.
pub const LINE_BUFFER_SIZE: usize = 80;

/// Receive ring capacity in bytes.
pub const RX_BUFFER_SIZE: usize = 256;

// Realtime command bytes.
pub const CMD_RESET: u8 = 0x18;
pub const CMD_STATUS_REPORT: u8 = b'?';
pub const CMD_CYCLE_START: u8 = b'~';
pub const CMD_FEED_HOLD: u8 = b'!';
pub const CMD_JOG_CANCEL: u8 = 0x85;
pub const CMD_FEED_OVR_RESET: u8 = 0x90;
pub const CMD_FEED_OVR_COARSE_PLUS: u8 = 0x91;
pub const CMD_FEED_OVR_COARSE_MINUS: u8 = 0x92;
pub const CMD_FEED_OVR_FINE_PLUS: u8 = 0x93;
pub const CMD_FEED_OVR_FINE_MINUS: u8 = 0x94;
pub const CMD_RAPID_OVR_RESET: u8 = 0x95;
pub const CMD_RAPID_OVR_MEDIUM: u8 = 0x96;
pub const CMD_RAPID_OVR_LOW: u8 = 0x97;

struct RxInner {
    queue: Deque<u8, RX_BUFFER_SIZE>,
    overflowed: bool,
}

/// Shared receive buffer with inline realtime extraction.
pub struct SerialRx {
    signals: Arc<RtSignals>,
    inner: Mutex<RxInner>,
}

impl SerialRx {
    pub fn new(signals: Arc<RtSignals>) -> Self {
        SerialRx {
            signals,
            inner: Mutex::new(RxInner {
                queue: Deque::new(),
                overflowed: false,
            }),
        }
    }

    /// Receive-side entry point for one byte.
    pub fn push(&self, byte: u8) {
        match byte {
            CMD_RESET => self.signals.set_state(RtExec::RESET),
            CMD_STATUS_REPORT => self.signals.set_state(RtExec::STATUS_REPORT),
            CMD_CYCLE_START => self.signals.set_state(RtExec::CYCLE_START),
            CMD_FEED_HOLD => self.signals.set_state(RtExec::FEED_HOLD),
            CMD_JOG_CANCEL => self.signals.set_state(RtExec::MOTION_CANCEL),
            CMD_FEED_OVR_RESET => self.signals.set_override(RtOverride::FEED_RESET),
            CMD_FEED_OVR_COARSE_PLUS => self.signals.set_override(RtOverride::FEED_COARSE_PLUS),
            CMD_FEED_OVR_COARSE_MINUS => self.signals.set_override(RtOverride::FEED_COARSE_MINUS),
            CMD_FEED_OVR_FINE_PLUS => self.signals.set_override(RtOverride::FEED_FINE_PLUS),
            CMD_FEED_OVR_FINE_MINUS => self.signals.set_override(RtOverride::FEED_FINE_MINUS),
            CMD_RAPID_OVR_RESET => self.signals.set_override(RtOverride::RAPID_RESET),
            CMD_RAPID_OVR_MEDIUM => self.signals.set_override(RtOverride::RAPID_MEDIUM),
            CMD_RAPID_OVR_LOW => self.signals.set_override(RtOverride::RAPID_LOW),
            // Remaining extended-ASCII codes are reserved realtime space.
            b if b > 0x7f => {}
            b => {
                let mut inner = self.inner.lock();
                if inner.queue.push_back(b).is_err() {
                    inner.overflowed = true;
                }
            }
        }
    }

    pub fn push_str(&self, text: &str) {
        for byte in text.bytes() {
            self.push(byte);
        }
    }

    /// Protocol-side read of one buffered byte.
    pub fn read(&self) -> Option<u8> {
        self.inner.lock().queue.pop_front()
    }

    /// Bytes free in the receive ring, reported in the status frame.
    pub fn available(&self) -> usize {
        RX_BUFFER_SIZE - self.inner.lock().queue.len()
    }

    /// True once if the ring dropped bytes since the last call.
    pub fn take_overflow(&self) -> bool {
        let mut inner = self.inner.lock();
        std::mem::replace(&mut inner.overflowed, false)
    }
}

/// Builds execution-ready lines: upper-cased, whitespace stripped, `(...)`
/// and `;` comments removed, length-capped.
pub struct LineAssembler {
    line: heapless::String<LINE_BUFFER_SIZE>,
    in_paren_comment: bool,
    in_semi_comment: bool,
    overflow: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        LineAssembler {
            line: heapless::String::new(),
            in_paren_comment: false,
            in_semi_comment: false,
            overflow: false,
        }
    }

    /// Feeds one byte; yields a finished line at each terminator.
    pub fn accept(&mut self, byte: u8) -> Option<Result<String, Status>> {
        match byte {
            b'\n' | b'\r' => {
                let result = if self.overflow {
                    Err(Status::Overflow)
                } else {
                    Ok(self.line.as_str().to_owned())
                };
                self.line.clear();
                self.in_paren_comment = false;
                self.in_semi_comment = false;
                self.overflow = false;
                // Blank terminators (the \n of a \r\n pair) produce empty
                // lines; the caller skips those.
                Some(result)
            }
            _ if self.in_semi_comment => None,
            b')' if self.in_paren_comment => {
                self.in_paren_comment = false;
                None
            }
            _ if self.in_paren_comment => None,
            b'(' => {
                self.in_paren_comment = true;
                None
            }
            b';' => {
                self.in_semi_comment = true;
                None
            }
            b' ' | b'\t' => None,
            b => {
                let c = (b as char).to_ascii_uppercase();
                if self.line.push(c).is_err() {
                    self.overflow = true;
                }
                None
            }
        }
    }
}

impl Default for LineAssembler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(input: &str) -> Vec<Result<String, Status>> {
        let mut assembler = LineAssembler::new();
        input
            .bytes()
            .filter_map(|b| assembler.accept(b))
            .filter(|r| !matches!(r, Ok(s) if s.is_empty()))
            .collect()
    }

    #[test]
    fn strips_spaces_and_uppercases() {
        let lines = assemble("g1 x10 y-2.5 f600\n");
        assert_eq!(lines, vec![Ok("G1X10Y-2.5F600".to_owned())]);
    }

    #[test]
    fn removes_comments() {
        let lines = assemble("G1 (move) X1 ; trailing words\nG0X0\n");
        assert_eq!(
            lines,
            vec![Ok("G1X1".to_owned()), Ok("G0X0".to_owned())]
        );
    }

    #[test]
    fn crlf_yields_single_line() {
        let lines = assemble("G0X1\r\n");
        assert_eq!(lines, vec![Ok("G0X1".to_owned())]);
    }

    #[test]
    fn long_line_reports_overflow() {
        let mut input = String::from("G1X");
        input.push_str(&"9".repeat(LINE_BUFFER_SIZE + 8));
        input.push('\n');
        let lines = assemble(&input);
        assert_eq!(lines, vec![Err(Status::Overflow)]);
    }

    #[test]
    fn realtime_bytes_bypass_buffer() {
        let signals = Arc::new(RtSignals::new());
        let rx = SerialRx::new(signals.clone());
        rx.push_str("G1");
        rx.push(CMD_FEED_HOLD);
        rx.push_str("X5\n");
        assert!(signals.state().contains(RtExec::FEED_HOLD));
        let mut collected = Vec::new();
        while let Some(b) = rx.read() {
            collected.push(b);
        }
        assert_eq!(collected, b"G1X5\n");
    }

    #[test]
    fn override_bytes_set_flags() {
        let signals = Arc::new(RtSignals::new());
        let rx = SerialRx::new(signals.clone());
        rx.push(CMD_FEED_OVR_COARSE_PLUS);
        rx.push(CMD_RAPID_OVR_LOW);
        let taken = signals.take_overrides();
        assert!(taken.contains(RtOverride::FEED_COARSE_PLUS | RtOverride::RAPID_LOW));
        assert!(rx.read().is_none());
    }
}
