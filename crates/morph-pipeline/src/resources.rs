//! Process resource limits.

/// Cap the data segment at `gib` GiB. `0` leaves the limit untouched.
#[cfg(unix)]
pub fn limit_memory(gib: u64) -> Result<(), nix::Error> {
    use nix::sys::resource::{setrlimit, Resource};

    if gib == 0 {
        return Ok(());
    }
    let bytes = gib.saturating_mul(1024 * 1024 * 1024);
    setrlimit(Resource::RLIMIT_DATA, bytes, bytes)?;
    tracing::info!(gib, "memory limit applied");
    Ok(())
}

#[cfg(not(unix))]
pub fn limit_memory(gib: u64) -> Result<(), std::io::Error> {
    if gib > 0 {
        tracing::warn!(gib, "memory limits are not supported on this platform");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_noop() {
        assert!(limit_memory(0).is_ok());
    }
}
