//! Location and validation of the precompiled seccomp artifacts.
//!
//! The BPF program (deny `socket(AF_UNIX, …)` with EPERM, allow everything
//! else) and the applier binary (`PR_SET_NO_NEW_PRIVS` + `PR_SET_SECCOMP`,
//! then `execvp`) are built out of band and shipped per architecture.
//! This module only finds and sanity-checks them.

use std::path::Path;
use std::path::PathBuf;
use tracing::warn;

/// Overrides the vendored artifact directory, mainly for tests.
pub const SECCOMP_DIR_ENV: &str = "VSBX_SECCOMP_DIR";

pub const BPF_FILE: &str = "unix-block.bpf";
pub const APPLIER_FILE: &str = "apply-seccomp";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeccompArtifacts {
    pub bpf_path: PathBuf,
    pub applier_path: PathBuf,
}

/// Artifact key for the current CPU, or `None` on architectures we ship
/// no filter for.
pub fn artifact_arch() -> Option<&'static str> {
    match std::env::consts::ARCH {
        "x86_64" => Some("x64"),
        "aarch64" => Some("arm64"),
        _ => None,
    }
}

/// Find the artifacts for the current architecture, returning `None` (with
/// a warning) when either file is missing or malformed. The sandbox then
/// runs without Unix-socket blocking.
pub fn locate_artifacts() -> Option<SeccompArtifacts> {
    let arch = artifact_arch()?;
    for base in candidate_dirs() {
        let dir = base.join(arch);
        if let Some(artifacts) = artifacts_in(&dir) {
            return Some(artifacts);
        }
    }
    warn!(
        arch,
        "seccomp artifacts not found; unix sockets will not be blocked"
    );
    None
}

fn candidate_dirs() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    if let Ok(dir) = std::env::var(SECCOMP_DIR_ENV) {
        dirs.push(PathBuf::from(dir));
    }
    if let Ok(exe) = std::env::current_exe() {
        if let Some(exe_dir) = exe.parent() {
            dirs.push(exe_dir.join("vendor/seccomp"));
            if let Some(install_root) = exe_dir.parent() {
                dirs.push(install_root.join("vendor/seccomp"));
            }
        }
    }
    dirs.push(PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../vendor/seccomp"));
    dirs
}

fn artifacts_in(dir: &Path) -> Option<SeccompArtifacts> {
    let bpf_path = dir.join(BPF_FILE);
    let applier_path = dir.join(APPLIER_FILE);
    if !bpf_path.is_file() || !applier_path.is_file() {
        return None;
    }
    if !bpf_is_well_formed(&bpf_path) {
        warn!(path = %bpf_path.display(), "ignoring malformed BPF filter");
        return None;
    }
    Some(SeccompArtifacts {
        bpf_path,
        applier_path,
    })
}

/// A BPF program is an array of 8-byte sock_filter structs; anything else
/// was truncated or corrupted.
fn bpf_is_well_formed(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(metadata) => metadata.len() > 0 && metadata.len() % 8 == 0,
        Err(_) => false,
    }
}
