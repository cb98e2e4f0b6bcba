use std::time::Duration;

/// User plus system CPU time consumed by this process.
#[cfg(unix)]
pub fn process_cpu_time() -> Option<Duration> {
    let usage = rusage_self()?;
    Some(timeval_to_duration(usage.ru_utime) + timeval_to_duration(usage.ru_stime))
}

#[cfg(not(unix))]
pub fn process_cpu_time() -> Option<Duration> {
    None
}

/// Current resident set size in bytes.
#[cfg(target_os = "linux")]
pub fn resident_memory() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    // SAFETY: sysconf has no preconditions.
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    u64::try_from(page_size).ok().map(|size| pages * size)
}

// Peak rather than current RSS where procfs is unavailable.
#[cfg(all(unix, not(target_os = "linux")))]
pub fn resident_memory() -> Option<u64> {
    let max_rss = u64::try_from(rusage_self()?.ru_maxrss).ok()?;
    if cfg!(target_os = "macos") {
        Some(max_rss)
    } else {
        Some(max_rss * 1024)
    }
}

#[cfg(not(unix))]
pub fn resident_memory() -> Option<u64> {
    None
}

#[cfg(unix)]
fn rusage_self() -> Option<libc::rusage> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage only writes into the provided struct.
    let ret = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if ret != 0 {
        return None;
    }
    // SAFETY: initialised by the successful call above.
    Some(unsafe { usage.assume_init() })
}

#[cfg(unix)]
fn timeval_to_duration(tv: libc::timeval) -> Duration {
    let secs = u64::try_from(tv.tv_sec).unwrap_or_default();
    let micros = u32::try_from(tv.tv_usec).unwrap_or_default();
    Duration::from_secs(secs) + Duration::from_micros(u64::from(micros))
}
