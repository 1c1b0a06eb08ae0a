use std::time::Duration;

/// Kernel probe: a BPF program and the symbols it may attach to.
///
/// Symbols are tried in order; the first one the running kernel exports
/// wins. Compilers rename some static functions (`.isra.0` clones), so
/// those carry a fallback.
#[derive(Debug, Clone, Copy)]
pub struct KprobeSpec {
    pub program: &'static str,
    pub symbols: &'static [&'static str],
}

/// Every probe the profiler needs. All of them must attach.
pub const KPROBES: [KprobeSpec; 5] = [
    KprobeSpec {
        program: "trace_ctx_switches",
        symbols: &["finish_task_switch.isra.0", "finish_task_switch"],
    },
    KprobeSpec {
        program: "trace_page_faults",
        symbols: &["handle_mm_fault"],
    },
    KprobeSpec {
        program: "trace_memory_allocation",
        symbols: &["__kmalloc"],
    },
    KprobeSpec {
        program: "trace_fs_read",
        symbols: &["vfs_read"],
    },
    KprobeSpec {
        program: "trace_fs_write",
        symbols: &["vfs_write"],
    },
];

/// Name of the BPF array holding [`ProfilerConfig`].
pub const CONFIG_MAP: &str = "profiler_config";

/// Producer settings shared with the BPF programs.
///
/// Layout matches `struct profiler_config` in `bpf/nodeprof.bpf.c`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfilerConfig {
    /// Bucket width in nanoseconds.
    pub interval_ns: u64,
    /// Added to `bpf_ktime_get_boot_ns()` to obtain Unix time.
    pub wall_offset_ns: u64,
}

impl ProfilerConfig {
    /// Builds the config from the bucket interval and the clock readings
    /// `realtime` (since the Unix epoch) and `boottime` (since boot).
    pub fn new(interval: Duration, realtime: Duration, boottime: Duration) -> Self {
        Self {
            interval_ns: duration_ns(interval),
            wall_offset_ns: duration_ns(realtime.saturating_sub(boottime)),
        }
    }
}

fn duration_ns(d: Duration) -> u64 {
    u64::try_from(d.as_nanos()).unwrap_or(u64::MAX)
}
