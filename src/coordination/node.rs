use std::sync::LazyLock;

static NODE_ID: LazyLock<String> = LazyLock::new(|| {
    std::env::var("GIT_CDN_NODE_ID").unwrap_or_else(|_| {
        let suffix = &uuid::Uuid::new_v4().to_string()[..8];
        format!("{}-{suffix}", hostname())
    })
});

/// Identifier of this worker process.
///
/// Prefers `GIT_CDN_NODE_ID`.  Falls back to `<hostname>-<random-8-chars>` so
/// that every process sharing a cache root gets a distinct id even on the same
/// host.
pub fn node_id() -> &'static str {
    &NODE_ID
}

pub fn hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// Whether a process with `pid` exists on this host.
#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    // Zombies keep /proc/{pid} but lose most of it; stat is enough here.
    pid != 0 && std::path::Path::new(&format!("/proc/{pid}/stat")).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn process_alive(pid: u32) -> bool {
    pid != 0
        && std::process::Command::new("kill")
            .args(["-0", &pid.to_string()])
            .output()
            .map(|o| o.status.success())
            .unwrap_or(true)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}
