use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};

static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Check whether we have sufficient privileges and tools (`ip`, `tc`) to
/// create network namespaces. Returns `false` if the test environment cannot
/// support namespace-based tests.
///
/// `ip netns list` succeeds for unprivileged users, so this probes by
/// actually adding and removing a namespace.
pub fn check_privileges() -> bool {
    let probe = unique_ns_name("hb_probe");
    let added = match Command::new("ip").args(["netns", "add", &probe]).output() {
        Ok(o) => o.status.success(),
        Err(_) => false,
    };
    if !added {
        return false;
    }
    let _ = Command::new("ip").args(["netns", "del", &probe]).output();
    Command::new("tc")
        .arg("-V")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Namespace name unique to this test process and call, at most 15 bytes
/// so it can double as an interface name.
pub fn unique_ns_name(prefix: &str) -> String {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut name = format!("{prefix}_{:x}_{seq}", std::process::id() % 0xFFFF);
    name.truncate(15);
    name
}
