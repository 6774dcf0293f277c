//! Resident memory of the worker process.

/// Source of the process's resident set size.
pub trait MemoryProbe: Send + Sync {
    /// Resident memory in bytes, or `None` when the platform cannot report it.
    fn resident_bytes(&self) -> Option<u64>;

    fn resident_megabytes(&self) -> Option<f64> {
        self.resident_bytes()
            .map(|bytes| bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Reads `VmRSS` from `/proc/self/status`. Reports nothing off Linux.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcMemoryProbe;

impl MemoryProbe for ProcMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kilobytes: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kilobytes * 1024)
}

/// A probe reporting a fixed value.
#[derive(Debug, Clone, Copy)]
pub struct FixedMemoryProbe(pub Option<u64>);

impl FixedMemoryProbe {
    pub fn megabytes(mb: u64) -> Self {
        Self(Some(mb * 1024 * 1024))
    }
}

impl MemoryProbe for FixedMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        self.0
    }
}
