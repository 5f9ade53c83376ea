use std::path::{Path, PathBuf};
use std::sync::RwLock;

use thiserror::Error;
use tracing::{info, warn};

/// Plugin module names an operation may never request from the host.
const DENIED_MODULES: &[&str] = &["process", "shell", "net", "dlopen", "ptrace", "signal"];

/// Only these path prefixes accept writes; reads are unrestricted so
/// handlers can load read-only model assets from anywhere.
const WRITE_PREFIXES: &[&str] = &["/tmp/lattice", "/var/lib/lattice"];

/// Raised when operation code trips the allow/deny filter. Kept separate
/// from runtime failures so callers can tell "blocked by policy" apart
/// from "failed while running".
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SandboxViolation {
    #[error("module '{0}' is denied by sandbox policy")]
    ModuleDenied(String),
    #[error("write access to '{0}' is denied by sandbox policy")]
    WriteDenied(PathBuf),
}

#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub denied_modules: Vec<String>,
    pub write_prefixes: Vec<PathBuf>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            denied_modules: DENIED_MODULES.iter().map(|name| name.to_string()).collect(),
            write_prefixes: WRITE_PREFIXES.iter().map(|prefix| PathBuf::from(*prefix)).collect(),
        }
    }
}

static ACTIVE: RwLock<Option<SandboxPolicy>> = RwLock::new(None);

/// Install the default policy process-wide. Idempotent: the policy from
/// the first activation stays in force, later calls are no-ops.
///
/// This is an allow/deny filter against accidental or casual misuse by
/// operation code, NOT a hardened sandbox; it does not resist an
/// adversarial escape.
pub fn enable() {
    enable_with(SandboxPolicy::default());
}

pub fn enable_with(policy: SandboxPolicy) {
    let mut active = ACTIVE.write().unwrap();
    if active.is_some() {
        return;
    }
    info!(
        denied = policy.denied_modules.len(),
        prefixes = policy.write_prefixes.len(),
        "sandbox enabled"
    );
    *active = Some(policy);
}

/// Remove the installed policy. Exists for test teardown only.
pub fn disable() {
    let mut active = ACTIVE.write().unwrap();
    if active.take().is_some() {
        info!("sandbox disabled");
    }
}

/// Check whether a dynamically requested plugin module may be loaded.
/// The deny-list matches on the leading name segment, so "net.http"
/// is covered by denying "net".
pub fn check_module(name: &str) -> Result<(), SandboxViolation> {
    let active = ACTIVE.read().unwrap();
    let Some(policy) = active.as_ref() else {
        return Ok(());
    };
    let root = name.split('.').next().unwrap_or(name);
    if policy.denied_modules.iter().any(|denied| denied == root) {
        warn!(module = name, "blocked module load");
        return Err(SandboxViolation::ModuleDenied(name.to_string()));
    }
    Ok(())
}

/// Check whether `path` accepts write/append/create access.
pub fn check_write(path: &Path) -> Result<(), SandboxViolation> {
    let active = ACTIVE.read().unwrap();
    let Some(policy) = active.as_ref() else {
        return Ok(());
    };
    if policy.write_prefixes.iter().any(|prefix| path.starts_with(prefix)) {
        return Ok(());
    }
    warn!(path = %path.display(), "blocked file write");
    Err(SandboxViolation::WriteDenied(path.to_path_buf()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Policy state is process-wide; serialize the tests that touch it.
    static GUARD: Mutex<()> = Mutex::new(());

    #[test]
    fn denied_module_is_blocked_allowed_passes() {
        let _guard = GUARD.lock().unwrap();
        enable();

        assert_eq!(
            check_module("net"),
            Err(SandboxViolation::ModuleDenied("net".to_string()))
        );
        assert_eq!(
            check_module("net.http"),
            Err(SandboxViolation::ModuleDenied("net.http".to_string()))
        );
        assert!(check_module("tensor_math").is_ok());
        assert!(check_module("sampler.diffusion").is_ok());

        disable();
        assert!(check_module("net").is_ok());
    }

    #[test]
    fn write_outside_prefixes_is_blocked() {
        let _guard = GUARD.lock().unwrap();
        enable();

        assert!(check_write(Path::new("/tmp/lattice/scratch.bin")).is_ok());
        assert!(check_write(Path::new("/var/lib/lattice/cache/weights.bin")).is_ok());
        assert!(matches!(
            check_write(Path::new("/etc/passwd")),
            Err(SandboxViolation::WriteDenied(_))
        ));

        disable();
    }

    #[test]
    fn violation_surfaces_through_dispatch() {
        use crate::arena::{Arena, TENSOR_REGION_OFFSET};
        use crate::{executor::ExecutorRegistry, ops};
        use shared::tensor::{DType, Params, TensorHandle, Value};
        use std::collections::HashMap;

        let _guard = GUARD.lock().unwrap();
        enable();

        let name = format!("/lattice-sandbox-{}", std::process::id());
        let arena = Arena::open_or_create(&name, TENSOR_REGION_OFFSET + 4 * 1024 * 1024).unwrap();
        let mut registry = ExecutorRegistry::new();
        ops::register_builtin(&mut registry);

        let mut inputs = HashMap::new();
        inputs.insert(
            "samples".to_string(),
            TensorHandle {
                offset: TENSOR_REGION_OFFSET as u64,
                size_bytes: 2 * 4 * 64 * 64,
                dtype: DType::F16,
                shape: vec![1, 4, 64, 64],
            },
        );
        let mut params = Params::new();
        params.insert("save_path".into(), Value::Str("/etc/out.png".into()));

        let dispatched = registry.dispatch("decoder.vae", &arena, &inputs, &params);
        let err = dispatched.outcome.unwrap_err();
        assert_eq!(err.code(), "SANDBOX_VIOLATION");

        params.insert("save_path".into(), Value::Str("/tmp/lattice/out.png".into()));
        let dispatched = registry.dispatch("decoder.vae", &arena, &inputs, &params);
        assert!(dispatched.outcome.is_ok());

        // A denied module is blocked before registry lookup.
        let dispatched = registry.dispatch("net.fetch", &arena, &inputs, &Params::new());
        assert_eq!(dispatched.outcome.unwrap_err().code(), "SANDBOX_VIOLATION");

        disable();
        Arena::unlink(&name).unwrap();
    }

    #[test]
    fn enable_is_idempotent_and_first_policy_wins() {
        let _guard = GUARD.lock().unwrap();
        enable_with(SandboxPolicy {
            denied_modules: vec!["alpha".to_string()],
            write_prefixes: vec![],
        });
        // Second activation must not replace the first policy.
        enable_with(SandboxPolicy {
            denied_modules: vec!["beta".to_string()],
            write_prefixes: vec![],
        });

        assert!(check_module("alpha").is_err());
        assert!(check_module("beta").is_ok());

        disable();
    }
}
