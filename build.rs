use std::env;
use std::error::Error;
use std::path::{Path, PathBuf};
use std::process::Command;

const BPF_SOURCE: &str = "bpf/nodeprof.bpf.c";
const BPF_OBJECT: &str = "nodeprof.bpf.o";

fn main() -> Result<(), Box<dyn Error>> {
    println!("cargo:rerun-if-changed=bpf/");
    println!("cargo:rerun-if-changed=build.rs");

    if env::var_os("CARGO_FEATURE_BPF").is_none() {
        return Ok(());
    }
    if env::var("CARGO_CFG_TARGET_OS")? != "linux" {
        println!("cargo:warning=bpf feature ignored: kprobes need a linux target");
        return Ok(());
    }

    let src = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?).join(BPF_SOURCE);
    let out = PathBuf::from(env::var("OUT_DIR")?).join(BPF_OBJECT);
    let arch = bpf_target_arch(&env::var("CARGO_CFG_TARGET_ARCH")?)?;

    compile_bpf(&src, &out, arch)
}

/// Maps a Rust target arch to the `__TARGET_ARCH_*` suffix libbpf's
/// tracing macros expect.
fn bpf_target_arch(rust_arch: &str) -> Result<&'static str, Box<dyn Error>> {
    match rust_arch {
        "x86_64" => Ok("x86"),
        "aarch64" => Ok("arm64"),
        other => Err(format!("no BPF target mapping for arch {other}").into()),
    }
}

fn compile_bpf(src: &Path, out: &Path, arch: &str) -> Result<(), Box<dyn Error>> {
    let status = Command::new("clang")
        .args(["-O2", "-g", "-Wall", "-target", "bpf"])
        .arg(format!("-D__TARGET_ARCH_{arch}"))
        .arg("-c")
        .arg(src)
        .arg("-o")
        .arg(out)
        .status()
        .map_err(|e| format!("running clang for {}: {e}", src.display()))?;

    if !status.success() {
        return Err(format!("clang exited with {status} compiling {}", src.display()).into());
    }

    Ok(())
}
