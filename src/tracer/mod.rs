//! Kernel instrumentation: the producer side of the bucket table.
//!
//! The BPF programs in `bpf/nodeprof.bpf.c` increment the record of the
//! current bucket; this module loads them, seeds their config, and exposes
//! their hash map through [`crate::table::BucketTable`].

pub mod probes;

#[cfg(feature = "bpf")]
pub mod bpf;
