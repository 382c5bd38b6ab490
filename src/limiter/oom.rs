//! Kernel OOM-killer records

use std::process::Command;

use tracing::debug;

/// Fallback kernel log when `dmesg` is not readable
const KERN_LOG: &str = "/var/log/kern.log";

/// One OOM kill of a process, as reported by the kernel
#[derive(Debug, Clone, PartialEq)]
pub struct OomRecord {
    pub pid: u32,
    pub anon_rss_kb: Option<u64>,
    pub line: String,
}

/// Last OOM kill of `pid` in `log`
///
/// Matches both `Killed process <pid> (...)` and the older
/// `Kill process <pid> (...)` phrasings.
pub fn find_oom_record(log: &str, pid: u32) -> Option<OomRecord> {
    let needles = [format!("Killed process {} ", pid), format!("Kill process {} ", pid)];
    log.lines()
        .rev()
        .find(|line| needles.iter().any(|n| line.contains(n.as_str())))
        .map(|line| OomRecord {
            pid,
            anon_rss_kb: field_kb(line, "anon-rss:"),
            line: line.trim().to_string(),
        })
}

/// Value of a `<key><digits>kB` field
fn field_kb(line: &str, key: &str) -> Option<u64> {
    let start = line.find(key)? + key.len();
    let digits: String = line[start..].chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

/// Current kernel ring buffer, or the kernel log file
pub fn read_kernel_log() -> Option<String> {
    if !cfg!(target_os = "linux") {
        return None;
    }
    match Command::new("dmesg").output() {
        Ok(out) if out.status.success() && !out.stdout.is_empty() => {
            Some(String::from_utf8_lossy(&out.stdout).into_owned())
        }
        _ => {
            debug!(path = KERN_LOG, "dmesg unavailable, reading kernel log file");
            std::fs::read_to_string(KERN_LOG).ok()
        }
    }
}

/// OOM record for `pid` from the live kernel log
pub fn lookup(pid: u32) -> Option<OomRecord> {
    read_kernel_log().and_then(|log| find_oom_record(&log, pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOG: &str = "\
[ 100.1] kolosal-spawn-s invoked oom-killer: gfp_mask=0x100cca
[ 100.2] Out of memory: Killed process 4242 (kolosal-spawn-s) total-vm:9000000kB, anon-rss:8123456kB, file-rss:0kB, shmem-rss:0kB
[ 200.0] Memory cgroup out of memory: Killed process 4243 (python) total-vm:10kB, anon-rss:5kB
[ 300.0] Out of memory: Kill process 77 (old) score 900 or sacrifice child
";

    #[test]
    fn test_finds_record_with_rss() {
        let rec = find_oom_record(LOG, 4242).unwrap();
        assert_eq!(rec.anon_rss_kb, Some(8_123_456));
        assert!(rec.line.contains("kolosal-spawn-s"));
    }

    #[test]
    fn test_pid_must_match_exactly() {
        assert!(find_oom_record(LOG, 424).is_none());
        assert_eq!(find_oom_record(LOG, 4243).unwrap().anon_rss_kb, Some(5));
    }

    #[test]
    fn test_old_phrasing_without_rss() {
        let rec = find_oom_record(LOG, 77).unwrap();
        assert_eq!(rec.anon_rss_kb, None);
    }
}
