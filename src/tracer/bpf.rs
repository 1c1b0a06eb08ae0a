//! BPF program loading, attachment and bucket map access.
//!
//! All code is gated behind `#[cfg(feature = "bpf")]`.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use aya::maps::hash_map::HashMap as BpfHashMap;
use aya::maps::{Array, MapData, MapError};
use aya::programs::KProbe;
use aya::Ebpf;
use parking_lot::Mutex;

use crate::export::health::HealthMetrics;
use crate::table::{BucketKey, BucketTable, TableError, RECORD_SIZE};

use super::probes::{KprobeSpec, ProfilerConfig, CONFIG_MAP, KPROBES};

/// Compiled BPF object, embedded at build time.
///
/// `include_bytes_aligned!` keeps the ELF 32-byte aligned; aya's parser
/// rejects unaligned object data.
const BPF_OBJ: &[u8] = aya::include_bytes_aligned!(concat!(env!("OUT_DIR"), "/nodeprof.bpf.o"));

// SAFETY: ProfilerConfig is repr(C) with two u64 fields and no padding.
unsafe impl aya::Pod for ProfilerConfig {}

/// Loaded and attached BPF programs.
///
/// Dropping the tracer detaches every program and closes the maps.
pub struct BpfTracer {
    ebpf: Ebpf,
}

impl BpfTracer {
    /// Loads the embedded object, seeds the producer config and attaches
    /// every kprobe. Fails on the first probe that cannot attach.
    pub fn load(bucket_interval: Duration, health: &HealthMetrics) -> Result<Self> {
        let mut ebpf = Ebpf::load(BPF_OBJ).context("loading BPF objects")?;

        let cfg = ProfilerConfig::new(
            bucket_interval,
            clock_now(libc::CLOCK_REALTIME)?,
            clock_now(libc::CLOCK_BOOTTIME)?,
        );
        write_config(&mut ebpf, cfg)?;

        for spec in &KPROBES {
            match attach_kprobe(&mut ebpf, spec) {
                Ok(symbol) => {
                    health
                        .probes_attached
                        .with_label_values(&[spec.program])
                        .set(1.0);
                    tracing::debug!(program = spec.program, symbol, "attached kprobe");
                }
                Err(e) => {
                    health
                        .probes_attached
                        .with_label_values(&[spec.program])
                        .set(0.0);
                    return Err(e);
                }
            }
        }

        tracing::info!(
            kprobes = KPROBES.len(),
            interval_ns = cfg.interval_ns,
            "BPF tracer started"
        );

        Ok(Self { ebpf })
    }

    /// Takes ownership of the bucket hash map.
    pub fn bucket_table(&mut self, map_name: &str) -> Result<BpfBucketTable> {
        let map = self
            .ebpf
            .take_map(map_name)
            .ok_or_else(|| anyhow!("{map_name} map not found"))?;

        let map = BpfHashMap::<MapData, u64, [u8; RECORD_SIZE]>::try_from(map)
            .with_context(|| format!("opening {map_name} as bucket hash map"))?;

        Ok(BpfBucketTable {
            map: Mutex::new(map),
        })
    }
}

fn write_config(ebpf: &mut Ebpf, cfg: ProfilerConfig) -> Result<()> {
    let map = ebpf
        .map_mut(CONFIG_MAP)
        .ok_or_else(|| anyhow!("{CONFIG_MAP} map not found"))?;

    let mut array: Array<_, ProfilerConfig> =
        Array::try_from(map).with_context(|| format!("opening {CONFIG_MAP} array"))?;

    array
        .set(0, cfg, 0)
        .with_context(|| format!("writing {CONFIG_MAP}"))
}

/// Loads the program and attaches it to the first symbol that accepts it.
fn attach_kprobe(ebpf: &mut Ebpf, spec: &KprobeSpec) -> Result<&'static str> {
    let prog: &mut KProbe = ebpf
        .program_mut(spec.program)
        .ok_or_else(|| anyhow!("kprobe program '{}' not found", spec.program))?
        .try_into()
        .with_context(|| format!("'{}' is not a kprobe program", spec.program))?;

    prog.load()
        .with_context(|| format!("loading kprobe program {}", spec.program))?;

    let mut last_err = None;
    for &symbol in spec.symbols {
        match prog.attach(symbol, 0) {
            Ok(_) => return Ok(symbol),
            Err(e) => {
                tracing::debug!(program = spec.program, symbol, error = %e, "kprobe symbol rejected");
                last_err = Some(e);
            }
        }
    }

    let cause = last_err.map_or_else(|| "no symbols".to_string(), |e| e.to_string());
    Err(anyhow!(
        "attaching kprobe {} to any of {:?}: {cause}",
        spec.program,
        spec.symbols
    ))
}

fn clock_now(clock: libc::clockid_t) -> Result<Duration> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };

    // SAFETY: ts is a valid, writable timespec.
    let rc = unsafe { libc::clock_gettime(clock, &mut ts) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error()).context("reading clock");
    }

    Ok(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
}

/// Bucket table backed by the kernel hash map.
pub struct BpfBucketTable {
    map: Mutex<BpfHashMap<MapData, u64, [u8; RECORD_SIZE]>>,
}

impl BucketTable for BpfBucketTable {
    fn keys(&self) -> Result<Vec<BucketKey>, TableError> {
        let map = self.map.lock();
        map.keys()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| TableError::List(e.to_string()))
    }

    fn get(&self, key: BucketKey) -> Result<Option<Vec<u8>>, TableError> {
        let map = self.map.lock();
        match map.get(&key, 0) {
            Ok(value) => Ok(Some(value.to_vec())),
            Err(MapError::KeyNotFound) => Ok(None),
            Err(e) => Err(TableError::Lookup {
                key,
                message: e.to_string(),
            }),
        }
    }

    fn remove(&self, key: BucketKey) -> Result<(), TableError> {
        let mut map = self.map.lock();
        match map.remove(&key) {
            Ok(()) | Err(MapError::KeyNotFound) => Ok(()),
            Err(e) => Err(TableError::Remove {
                key,
                message: e.to_string(),
            }),
        }
    }
}
