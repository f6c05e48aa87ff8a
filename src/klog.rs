//! Structured Logging
//!
//! Event-style logging for every subsystem:
//!
//! ```text
//! <ms> <LVL> <subsys> <event> key=val ...
//! ```
//!
//! `<ms>` is milliseconds since the first record. The active level is read
//! once from the `VMPAGER_LOG` environment variable (`error`, `warn`,
//! `info`, `debug`, `trace`; default `warn`). Records above the active
//! level cost one atomic load and nothing else — key/value expressions are
//! not evaluated.
//!
//! # Example
//! ```ignore
//! vinfo!("fault", "swap_in"; pid = pid, frame = frame);
//! vwarn!("segment", "overlap_rejected"; pid = pid, start = hex32(start));
//! ```

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

// ============================================================================
// Levels
// ============================================================================

/// Log levels from most to least severe.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Level {
    /// Operation failed, degraded behavior likely
    Error = 0,
    /// Unexpected but recoverable
    Warn = 1,
    /// Major lifecycle events
    Info = 2,
    /// Diagnostic, state transitions
    Debug = 3,
    /// Very verbose, per-operation
    Trace = 4,
}

impl Level {
    pub const fn as_str(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN ",
            Level::Info => "INFO ",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    fn from_env(val: &str) -> Option<Self> {
        match val.to_ascii_lowercase().as_str() {
            "error" => Some(Level::Error),
            "warn" => Some(Level::Warn),
            "info" => Some(Level::Info),
            "debug" => Some(Level::Debug),
            "trace" => Some(Level::Trace),
            _ => None,
        }
    }
}

// ============================================================================
// Filter state
// ============================================================================

static ACTIVE: AtomicU8 = AtomicU8::new(Level::Warn as u8);
static INIT_DONE: AtomicBool = AtomicBool::new(false);

fn epoch() -> &'static Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now)
}

fn active_level() -> Level {
    if !INIT_DONE.load(Ordering::Acquire) {
        let lvl = std::env::var("VMPAGER_LOG")
            .ok()
            .and_then(|v| Level::from_env(&v))
            .unwrap_or(Level::Warn);
        ACTIVE.store(lvl as u8, Ordering::Relaxed);
        INIT_DONE.store(true, Ordering::Release);
    }
    match ACTIVE.load(Ordering::Relaxed) {
        0 => Level::Error,
        1 => Level::Warn,
        2 => Level::Info,
        3 => Level::Debug,
        _ => Level::Trace,
    }
}

/// True if a record at `lvl` would be emitted. Used by the macros to skip
/// argument evaluation entirely.
#[inline]
pub fn enabled(lvl: Level) -> bool {
    lvl <= active_level()
}

/// Override the active level. Mainly for tests.
pub fn set_level(lvl: Level) {
    ACTIVE.store(lvl as u8, Ordering::Relaxed);
    INIT_DONE.store(true, Ordering::Release);
}

// ============================================================================
// Emission
// ============================================================================

/// Emit one record on stderr. Called by the macros, not directly.
pub fn emit(lvl: Level, subsys: &str, event: &str, kvs: &[(&str, &dyn std::fmt::Display)]) {
    let ms = epoch().elapsed().as_millis();
    let mut line = String::with_capacity(64);
    let _ = write!(line, "{:>6} {} {} {}", ms, lvl.as_str(), subsys, event);
    for (k, v) in kvs {
        let _ = write!(line, " {}={}", k, v);
    }
    eprintln!("{}", line);
}

/// Hexadecimal display wrapper for 32-bit values.
pub fn hex32(v: u32) -> Hex32 {
    Hex32(v)
}

pub struct Hex32(pub u32);

impl std::fmt::Display for Hex32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

#[macro_export]
macro_rules! vlog {
    ($lvl:expr, $subsys:expr, $event:expr $(; $($key:ident = $val:expr),+ $(,)?)?) => {
        if $crate::klog::enabled($lvl) {
            $crate::klog::emit(
                $lvl,
                $subsys,
                $event,
                &[$($((stringify!($key), &$val as &dyn ::std::fmt::Display)),+)?],
            );
        }
    };
}

#[macro_export]
macro_rules! verror {
    ($($t:tt)*) => { $crate::vlog!($crate::klog::Level::Error, $($t)*) };
}

#[macro_export]
macro_rules! vwarn {
    ($($t:tt)*) => { $crate::vlog!($crate::klog::Level::Warn, $($t)*) };
}

#[macro_export]
macro_rules! vinfo {
    ($($t:tt)*) => { $crate::vlog!($crate::klog::Level::Info, $($t)*) };
}

#[macro_export]
macro_rules! vdebug {
    ($($t:tt)*) => { $crate::vlog!($crate::klog::Level::Debug, $($t)*) };
}

#[macro_export]
macro_rules! vtrace {
    ($($t:tt)*) => { $crate::vlog!($crate::klog::Level::Trace, $($t)*) };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_ordering() {
        assert!(Level::Error < Level::Warn);
        assert!(Level::Debug < Level::Trace);
    }

    #[test]
    fn level_parse() {
        assert_eq!(Level::from_env("trace"), Some(Level::Trace));
        assert_eq!(Level::from_env("WARN"), Some(Level::Warn));
        assert_eq!(Level::from_env("bogus"), None);
    }

    // Single test for everything that touches the global filter, because
    // tests in this binary run concurrently.
    #[test]
    fn filter_and_macros() {
        set_level(Level::Info);
        assert!(enabled(Level::Error));
        assert!(enabled(Level::Info));
        assert!(!enabled(Level::Debug));

        // Must compile in all arities; filtered out, so nothing is printed.
        vdebug!("klog", "no_kvs");
        vdebug!("klog", "one_kv"; a = 1);
        vdebug!("klog", "many_kvs"; a = 1, b = hex32(0x10), c = "s");
        set_level(Level::Warn);
    }

    #[test]
    fn hex_formatting() {
        assert_eq!(format!("{}", hex32(0x400)), "0x400");
    }
}
