//! # Clock, Alignment and Process Metadata Helpers
//!
//! Small free functions shared across the bus core: high-precision clock
//! reads for timestamp items and deadlines, 8-byte alignment arithmetic for
//! the wire format, and `/proc` readers used to assemble per-destination
//! sender metadata.

use std::fs;
use std::sync::OnceLock;

use nix::time::{clock_gettime, ClockId};

/// Round `v` up to the next multiple of 8.
#[inline]
pub fn align8(v: usize) -> usize {
    (v + 7) & !7
}

/// Whether `v` is a multiple of 8.
#[inline]
pub fn is_aligned8(v: u64) -> bool {
    v & 7 == 0
}

/// System page size, cached after the first query.
pub fn page_size() -> usize {
    static PAGE: OnceLock<usize> = OnceLock::new();
    *PAGE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz as usize
        } else {
            4096
        }
    })
}

/// Monotonic clock in nanoseconds; basis for deadlines and the monotonic
/// half of timestamp items.
pub fn now_monotonic_ns() -> u64 {
    clock_gettime(ClockId::CLOCK_MONOTONIC)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
        .unwrap_or(0)
}

/// Wall clock in nanoseconds since the epoch.
pub fn now_realtime_ns() -> u64 {
    clock_gettime(ClockId::CLOCK_REALTIME)
        .map(|ts| ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
        .unwrap_or(0)
}

fn read_proc_trimmed(path: &str) -> Option<String> {
    let s = fs::read_to_string(path).ok()?;
    let s = s.trim_end_matches(['\n', '\0']).to_string();
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Short process name of the calling task (`/proc/self/comm`).
pub fn process_comm() -> String {
    read_proc_trimmed("/proc/self/comm").unwrap_or_default()
}

/// Absolute path of the executable, if resolvable.
pub fn process_exe() -> Option<String> {
    std::env::current_exe()
        .ok()
        .map(|p| p.to_string_lossy().into_owned())
}

/// Raw command line, NUL-separated as the kernel stores it.
pub fn process_cmdline() -> Vec<u8> {
    fs::read("/proc/self/cmdline").unwrap_or_default()
}

/// Cgroup path of the calling process (first hierarchy listed).
pub fn process_cgroup() -> Option<String> {
    let data = fs::read_to_string("/proc/self/cgroup").ok()?;
    let line = data.lines().next()?;
    // lines look like "0::/user.slice/..."; the path is the third field
    let path = line.splitn(3, ':').nth(2)?;
    if path.is_empty() {
        None
    } else {
        Some(path.to_string())
    }
}

/// Capability quadruple of the calling process: inheritable, permitted,
/// effective and bounding set, read from `/proc/self/status`.
pub fn process_caps() -> Option<[u64; 4]> {
    let status = fs::read_to_string("/proc/self/status").ok()?;
    parse_caps(&status)
}

pub(crate) fn parse_caps(status: &str) -> Option<[u64; 4]> {
    let mut caps = [None; 4];
    for line in status.lines() {
        let (key, value) = match line.split_once(':') {
            Some(kv) => kv,
            None => continue,
        };
        let slot = match key {
            "CapInh" => 0,
            "CapPrm" => 1,
            "CapEff" => 2,
            "CapBnd" => 3,
            _ => continue,
        };
        caps[slot] = u64::from_str_radix(value.trim(), 16).ok();
    }
    Some([caps[0]?, caps[1]?, caps[2]?, caps[3]?])
}

/// Audit session id and login uid, if the kernel exposes them.
pub fn process_audit() -> Option<(u32, u32)> {
    let session = read_proc_trimmed("/proc/self/sessionid")?.parse().ok()?;
    let loginuid = read_proc_trimmed("/proc/self/loginuid")?.parse().ok()?;
    Some((session, loginuid))
}

/// LSM security label of the calling process, without the trailing NUL.
pub fn process_seclabel() -> Option<Vec<u8>> {
    let mut label = fs::read("/proc/self/attr/current").ok()?;
    while label.last() == Some(&0) || label.last() == Some(&b'\n') {
        label.pop();
    }
    if label.is_empty() {
        None
    } else {
        Some(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align8_rounds_up() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(8), 8);
        assert_eq!(align8(17), 24);
    }

    #[test]
    fn monotonic_clock_advances() {
        let a = now_monotonic_ns();
        let b = now_monotonic_ns();
        assert!(b >= a);
        assert!(a > 0);
    }

    #[test]
    fn caps_parse_from_status_snippet() {
        let status = "Name:\tcap\nCapInh:\t0000000000000000\nCapPrm:\t000001ffffffffff\n\
                      CapEff:\t000001ffffffffff\nCapBnd:\t000001ffffffffff\nCapAmb:\t0\n";
        let caps = parse_caps(status).unwrap();
        assert_eq!(caps[0], 0);
        assert_eq!(caps[2], 0x000001ffffffffff);
    }

    #[test]
    fn comm_is_nonempty_on_linux() {
        assert!(!process_comm().is_empty());
    }
}
