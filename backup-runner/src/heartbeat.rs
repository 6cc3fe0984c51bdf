//! Best-effort heartbeat metrics for the running `borg` child (§4.7 step 6).
//!
//! Parsed by hand from `/proc`: none of the corpus pulls in a
//! `sysinfo`/`procfs` crate for this kind of one-off process sampling, so
//! this is the one place this workspace reaches for raw `/proc` parsing
//! instead of an ecosystem crate.

use std::path::Path;
use std::time::Duration;

use clippy_utilities::NumericCast;
use tokio::time::sleep;
use tracing::info;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);
/// Linux's near-universal clock tick rate. `sysconf(_SC_CLK_TCK)` is not
/// worth a `libc` dependency for a single constant that has been 100 on
/// every mainstream distribution for two decades.
const CLK_TCK: f64 = 100.0;

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    cpu_ticks: u64,
    read_bytes: u64,
    write_bytes: u64,
    rss_kb: u64,
    net_bytes: u64,
}

/// Print a heartbeat line every 60s for as long as `pid` stays alive.
/// Meant to be run as its own task and aborted by the caller once the
/// monitored child has exited.
pub async fn run(pid: u32) {
    let mut previous = sample(pid);
    loop {
        sleep(HEARTBEAT_INTERVAL).await;
        let Some(current) = sample(pid) else {
            break;
        };
        if let Some(prev) = previous {
            let cpu_delta_secs = current.cpu_ticks.saturating_sub(prev.cpu_ticks).numeric_cast::<f64>() / CLK_TCK;
            let read_delta_bytes = current.read_bytes.saturating_sub(prev.read_bytes);
            let write_delta_bytes = current.write_bytes.saturating_sub(prev.write_bytes);
            let net_delta_bytes = current.net_bytes.saturating_sub(prev.net_bytes);
            info!(
                cpu_delta_secs,
                read_delta_bytes,
                write_delta_bytes,
                rss_kb = current.rss_kb,
                net_delta_bytes,
                "heartbeat"
            );
        }
        previous = Some(current);
    }
}

fn sample(pid: u32) -> Option<Sample> {
    if !Path::new(&format!("/proc/{pid}")).exists() {
        return None;
    }
    let (read_bytes, write_bytes) = read_io_bytes(pid).unwrap_or((0, 0));
    Some(Sample {
        cpu_ticks: read_stat_ticks(pid).unwrap_or(0),
        read_bytes,
        write_bytes,
        rss_kb: read_status_rss_kb(pid).unwrap_or(0),
        net_bytes: read_net_dev_bytes().unwrap_or(0),
    })
}

/// Sum of utime+stime (field 14/15 of `/proc/<pid>/stat`) in clock ticks.
/// The comm field may itself contain spaces or parentheses, so the stable
/// fields are located by splitting from the last `)` rather than by index
/// from the start of the line.
fn read_stat_ticks(pid: u32) -> Option<u64> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    let after_comm = content.rsplit_once(')')?.1;
    let fields: Vec<&str> = after_comm.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

fn read_io_bytes(pid: u32) -> Option<(u64, u64)> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/io")).ok()?;
    let mut read_bytes = 0u64;
    let mut write_bytes = 0u64;
    for line in content.lines() {
        if let Some(value) = line.strip_prefix("read_bytes:") {
            read_bytes = value.trim().parse().unwrap_or(0);
        } else if let Some(value) = line.strip_prefix("write_bytes:") {
            write_bytes = value.trim().parse().unwrap_or(0);
        }
    }
    Some((read_bytes, write_bytes))
}

fn read_status_rss_kb(pid: u32) -> Option<u64> {
    let content = std::fs::read_to_string(format!("/proc/{pid}/status")).ok()?;
    content.lines().find_map(|line| {
        line.strip_prefix("VmRSS:")
            .and_then(|value| value.trim().trim_end_matches("kB").trim().parse().ok())
    })
}

/// Best-effort total bytes (rx+tx) across all interfaces visible in this
/// pod's network namespace. This is process-wide rather than per-pid, an
/// adequate proxy for "how much this runner has moved" as long as the
/// repository transfer is the only network activity in the pod.
fn read_net_dev_bytes() -> Option<u64> {
    let content = std::fs::read_to_string("/proc/net/dev").ok()?;
    let mut total = 0u64;
    for line in content.lines().skip(2) {
        let Some((_, rest)) = line.split_once(':') else {
            continue;
        };
        let fields: Vec<&str> = rest.split_whitespace().collect();
        let rx: u64 = fields.first().and_then(|v| v.parse().ok()).unwrap_or(0);
        let tx: u64 = fields.get(8).and_then(|v| v.parse().ok()).unwrap_or(0);
        total += rx + tx;
    }
    Some(total)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_stat_ticks_with_parens_in_comm() {
        let stat = "1234 (borg (helper)) R 1 1234 1234 0 -1 4194304 100 0 0 0 55 20 0 0 20 0 1 0 12345 0 0 18446744073709551615 0 0 0 0 0 0 0 0 0 0 0 0 17 3 0 0 0 0 0";
        let after_comm = stat.rsplit_once(')').unwrap().1;
        let fields: Vec<&str> = after_comm.split_whitespace().collect();
        let utime: u64 = fields[11].parse().unwrap();
        let stime: u64 = fields[12].parse().unwrap();
        assert_eq!(utime, 55);
        assert_eq!(stime, 20);
    }

    #[test]
    fn parses_io_bytes() {
        let io = "rchar: 100\nwchar: 200\nsyscr: 1\nsyscw: 1\nread_bytes: 4096\nwrite_bytes: 8192\ncancelled_write_bytes: 0\n";
        let mut read_bytes = 0u64;
        let mut write_bytes = 0u64;
        for line in io.lines() {
            if let Some(value) = line.strip_prefix("read_bytes:") {
                read_bytes = value.trim().parse().unwrap();
            } else if let Some(value) = line.strip_prefix("write_bytes:") {
                write_bytes = value.trim().parse().unwrap();
            }
        }
        assert_eq!(read_bytes, 4096);
        assert_eq!(write_bytes, 8192);
    }

    #[test]
    fn parses_vmrss_from_status() {
        let status = "Name:\tborg\nVmPeak:\t  123456 kB\nVmRSS:\t   54321 kB\nThreads:\t1\n";
        let rss = status.lines().find_map(|line| {
            line.strip_prefix("VmRSS:")
                .and_then(|v| v.trim().trim_end_matches("kB").trim().parse::<u64>().ok())
        });
        assert_eq!(rss, Some(54321));
    }
}
