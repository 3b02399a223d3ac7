//! Build script for prism-capture-ebpf
//!
//! On Linux, this embeds the two probe objects (ring buffer and perf buffer
//! variants). They are built separately with
//! `cargo build -p prism-ebpf-probe --target bpfel-unknown-none -Z build-std=core --release`.
//! When they are missing the sensor loads them from `capture.probe_dir` at runtime.

use std::env;
use std::path::{Path, PathBuf};

const OBJECTS: [&str; 2] = ["prism-probe-ringbuf", "prism-probe-perf"];

fn main() {
    // Tell cargo about our custom cfg flags
    println!("cargo::rustc-check-cfg=cfg(embedded_probe)");

    println!("cargo:rerun-if-env-changed=PRISM_PROBE_DIR");

    // Only embed on Linux
    if env::var("CARGO_CFG_TARGET_OS").unwrap_or_default() != "linux" {
        return;
    }

    if let Err(e) = embed_probes() {
        println!(
            "cargo:warning=Probe objects not embedded: {}. \
             Sensor will load them from capture.probe_dir at runtime.",
            e
        );
    }
}

fn embed_probes() -> Result<(), String> {
    let out_dir = PathBuf::from(env::var("OUT_DIR").map_err(|e| format!("OUT_DIR not set: {}", e))?);
    let source_dir = find_probe_dir()?;

    for name in OBJECTS {
        let src = source_dir.join(name);
        println!("cargo:rerun-if-changed={}", src.display());
        std::fs::copy(&src, out_dir.join(name))
            .map_err(|e| format!("Failed to copy {}: {}", src.display(), e))?;
    }

    println!("cargo:rustc-cfg=embedded_probe");
    Ok(())
}

fn find_probe_dir() -> Result<PathBuf, String> {
    // Explicit path via environment variable
    if let Ok(path) = env::var("PRISM_PROBE_DIR") {
        let dir = PathBuf::from(&path);
        if has_all_objects(&dir) {
            return Ok(dir);
        }
        return Err(format!("PRISM_PROBE_DIR={} does not hold both objects", path));
    }

    // Default cargo output for the BPF target
    let manifest_dir = env::var("CARGO_MANIFEST_DIR")
        .map_err(|e| format!("CARGO_MANIFEST_DIR not set: {}", e))?;
    let workspace_root = Path::new(&manifest_dir)
        .parent() // crates/
        .and_then(|p| p.parent())
        .ok_or("Failed to find workspace root")?;
    let dir = workspace_root
        .join("target")
        .join("bpfel-unknown-none")
        .join("release");
    if has_all_objects(&dir) {
        return Ok(dir);
    }

    Err(format!(
        "probe objects not found. Looked in:\n  \
         - PRISM_PROBE_DIR env var\n  \
         - {:?}",
        dir
    ))
}

fn has_all_objects(dir: &Path) -> bool {
    OBJECTS.iter().all(|name| dir.join(name).exists())
}
