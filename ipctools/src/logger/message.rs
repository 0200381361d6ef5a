//! The fixed-size log record and its category/level masks.

use std::fmt::{self, Write as _};
use std::mem;
use std::ops::{BitAnd, BitOr, Not};
use std::ptr;

use chrono::{DateTime, Local};
use serde_derive::{Deserialize, Serialize};

pub const ORIGINATOR_LEN: usize = 32;
pub const TIME_LEN: usize = 32;
pub const MESSAGE_LEN: usize = 256;

/// RFC 3164 facility 1, user-level messages.
pub const SYSLOG_FACILITY: u8 = 1;

macro_rules! mask_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            pub const NONE: $name = $name(0);
            pub const ALL: $name = $name(0xffff_ffff);

            pub const fn bits(self) -> u32 {
                self.0
            }

            pub const fn intersects(self, other: $name) -> bool {
                self.0 & other.0 != 0
            }

            pub const fn contains(self, other: $name) -> bool {
                self.0 & other.0 == other.0
            }
        }

        impl BitOr for $name {
            type Output = $name;

            fn bitor(self, rhs: $name) -> $name {
                $name(self.0 | rhs.0)
            }
        }

        impl BitAnd for $name {
            type Output = $name;

            fn bitand(self, rhs: $name) -> $name {
                $name(self.0 & rhs.0)
            }
        }

        impl Not for $name {
            type Output = $name;

            fn not(self) -> $name {
                $name(!self.0)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }
    };
}

mask_type!(
    /// Application-defined category bits. These never map to syslog.
    Category
);

mask_type!(
    /// Severity bits, one per RFC 3164 severity.
    Level
);

impl Category {
    pub const FAULT: Category = Category(1 << 0);
    pub const MODULE: Category = Category(1 << 1);
    pub const PROCESS_ONE: Category = Category(1 << 4);
}

impl Level {
    pub const EMERG: Level = Level(1 << 0);
    pub const ALERT: Level = Level(1 << 1);
    pub const CRIT: Level = Level(1 << 2);
    pub const ERROR: Level = Level(1 << 3);
    pub const WARNING: Level = Level(1 << 4);
    pub const NOTICE: Level = Level(1 << 5);
    pub const INFO: Level = Level(1 << 6);
    pub const DEBUG: Level = Level(1 << 7);

    /// Syslog severity of the most severe bit set, DEBUG when none is.
    pub const fn severity(self) -> u8 {
        let low = self.0 & 0xff;
        if low == 0 {
            7
        } else {
            low.trailing_zeros() as u8
        }
    }
}

/// One log record as it sits in a queue block.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LogMessage {
    cmask: u32,
    lmask: u32,
    originator: [u8; ORIGINATOR_LEN],
    time: [u8; TIME_LEN],
    message: [u8; MESSAGE_LEN],
}

pub const WIRE_SIZE: usize = mem::size_of::<LogMessage>();

const _: () = assert!(WIRE_SIZE == 8 + ORIGINATOR_LEN + TIME_LEN + MESSAGE_LEN);

/// Writes into a fixed buffer, cutting on a character boundary and keeping
/// one byte for the terminator.
struct FixedWriter<'b> {
    buf: &'b mut [u8],
    len: usize,
}

impl<'b> FixedWriter<'b> {
    fn new(buf: &'b mut [u8]) -> FixedWriter<'b> {
        buf.fill(0);
        FixedWriter { buf, len: 0 }
    }
}

impl fmt::Write for FixedWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = self.buf.len().saturating_sub(self.len + 1);
        let mut take = s.len().min(room);
        while !s.is_char_boundary(take) {
            take -= 1;
        }
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        Ok(())
    }
}

fn copy_text(buf: &mut [u8], text: &str) {
    let _ = FixedWriter::new(buf).write_str(text);
}

fn text(buf: &[u8]) -> &str {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    match std::str::from_utf8(&buf[..end]) {
        Ok(text) => text,
        Err(e) => std::str::from_utf8(&buf[..e.valid_up_to()]).unwrap_or_default(),
    }
}

/// `Mmm dd hh:mm:ss:mmm`, the RFC 3164 timestamp plus milliseconds.
pub fn format_timestamp(at: &DateTime<Local>) -> String {
    format!("{}:{:03}", at.format("%b %e %H:%M:%S"), at.timestamp_subsec_millis())
}

impl LogMessage {
    pub fn new(
        category: Category,
        level: Level,
        originator: &str,
        time: &str,
        body: fmt::Arguments<'_>,
    ) -> LogMessage {
        let mut msg = LogMessage {
            cmask: category.0,
            lmask: level.0,
            originator: [0; ORIGINATOR_LEN],
            time: [0; TIME_LEN],
            message: [0; MESSAGE_LEN],
        };
        copy_text(&mut msg.originator, originator);
        copy_text(&mut msg.time, time);
        let _ = FixedWriter::new(&mut msg.message).write_fmt(body);
        msg
    }

    /// Copies a message out of a payload that is at least [`WIRE_SIZE`] bytes.
    pub(crate) fn read_from(payload: &[u8]) -> Option<LogMessage> {
        if payload.len() < WIRE_SIZE {
            return None;
        }
        // SAFETY: length checked; every bit pattern is a valid LogMessage.
        Some(unsafe { ptr::read_unaligned(payload.as_ptr() as *const LogMessage) })
    }

    pub(crate) fn write_to(&self, payload: &mut [u8]) {
        payload[..WIRE_SIZE].copy_from_slice(&self.to_wire());
    }

    pub fn category(&self) -> Category {
        Category(self.cmask)
    }

    pub fn level(&self) -> Level {
        Level(self.lmask)
    }

    pub fn originator(&self) -> &str {
        text(&self.originator)
    }

    pub fn time(&self) -> &str {
        text(&self.time)
    }

    pub fn message(&self) -> &str {
        text(&self.message)
    }

    /// `facility * 8 + severity`. Categories play no part.
    pub fn syslog_priority(&self) -> u8 {
        SYSLOG_FACILITY * 8 + self.level().severity()
    }

    /// A line for a remote syslog collector: milliseconds are dropped.
    pub fn syslog_line(&self, hostname: &str) -> String {
        let time = self.time();
        let stamp = match time.rsplit_once(':') {
            Some((stamp, millis)) if millis.len() == 3 => stamp,
            _ => time,
        };
        format!(
            "<{}>{} {} {}: {}",
            self.syslog_priority(),
            stamp,
            hostname,
            self.originator(),
            self.message()
        )
    }

    /// The record in its native `#[repr(C)]` layout.
    pub fn to_wire(&self) -> [u8; WIRE_SIZE] {
        let mut wire = [0u8; WIRE_SIZE];
        // SAFETY: LogMessage is WIRE_SIZE bytes of plain data with no padding.
        unsafe { ptr::copy_nonoverlapping(self as *const LogMessage as *const u8, wire.as_mut_ptr(), WIRE_SIZE) };
        wire
    }

    pub fn from_wire(wire: &[u8; WIRE_SIZE]) -> LogMessage {
        // SAFETY: as in `read_from`.
        unsafe { ptr::read_unaligned(wire.as_ptr() as *const LogMessage) }
    }
}

impl fmt::Display for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} [{:#010x}/{:#04x}] {}",
            self.time(),
            self.originator(),
            self.cmask,
            self.lmask,
            self.message()
        )
    }
}

impl fmt::Debug for LogMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogMessage")
            .field("category", &self.category())
            .field("level", &self.level())
            .field("originator", &self.originator())
            .field("time", &self.time())
            .field("message", &self.message())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn message(level: Level, body: &str) -> LogMessage {
        LogMessage::new(Category::MODULE, level, "tester", "Jan  5 09:03:07:042", format_args!("{}", body))
    }

    #[test]
    fn wire_size_is_fixed() {
        assert_eq!(WIRE_SIZE, 328);
    }

    #[test]
    fn severity_follows_most_severe_bit() {
        assert_eq!(message(Level::ERROR, "x").syslog_priority(), 8 + 3);
        assert_eq!(message(Level::EMERG, "x").syslog_priority(), 8);
        assert_eq!(message(Level::DEBUG, "x").syslog_priority(), 8 + 7);
        assert_eq!(message(Level::WARNING | Level::CRIT, "x").syslog_priority(), 8 + 2);
        assert_eq!(message(Level::NONE, "x").syslog_priority(), 8 + 7);

        let mut fault = message(Level::ERROR, "x");
        fault.cmask = Category::ALL.bits();
        assert_eq!(fault.syslog_priority(), 11);
    }

    #[test]
    fn long_fields_truncate_on_char_boundary() {
        let body = "é".repeat(200);
        let msg = LogMessage::new(
            Category::FAULT,
            Level::INFO,
            &"p".repeat(40),
            "t",
            format_args!("{}", body),
        );
        assert_eq!(msg.originator().len(), ORIGINATOR_LEN - 1);
        assert!(msg.message().len() <= MESSAGE_LEN - 1);
        assert!(msg.message().chars().all(|c| c == 'é'));
        assert_eq!(msg.message().len() % 2, 0);
    }

    #[test]
    fn formatted_body() {
        let msg = LogMessage::new(
            Category::FAULT,
            Level::WARNING,
            "daemon",
            "t",
            format_args!("disk {} at {}%", "sda", 91),
        );
        assert_eq!(msg.message(), "disk sda at 91%");
    }

    #[test]
    fn timestamp_has_milliseconds() {
        let at = Local.with_ymd_and_hms(2024, 3, 7, 14, 5, 9).unwrap();
        assert_eq!(format_timestamp(&at), "Mar  7 14:05:09:000");
    }

    #[test]
    fn syslog_line_strips_milliseconds() {
        let msg = message(Level::ERROR, "link down");
        assert_eq!(msg.syslog_line("host1"), "<11>Jan  5 09:03:07 host1 tester: link down");
        assert!(msg.to_string().contains("[0x00000002/0x08] link down"));
    }

    #[test]
    fn wire_bytes_round_trip() {
        let msg = message(Level::NOTICE, "hello");
        let wire = msg.to_wire();
        assert_eq!(&wire[..4], &Category::MODULE.bits().to_ne_bytes());
        let back = LogMessage::from_wire(&wire);
        assert_eq!(back.message(), "hello");
        assert_eq!(back.level(), Level::NOTICE);
    }

    #[test]
    fn masks_combine() {
        let mask = Category::FAULT | Category::PROCESS_ONE;
        assert!(mask.intersects(Category::FAULT));
        assert!(!mask.intersects(Category::MODULE));
        assert_eq!(mask & !Category::FAULT, Category::PROCESS_ONE);
        assert!(Category::ALL.contains(mask));
    }
}
