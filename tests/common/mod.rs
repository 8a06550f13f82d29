#![allow(dead_code)]

use mir::{Arch, Builder, PinningStrategy, PolicyKind, Runtime};
use std::process::{Command, Output, Stdio};

/// Set in the child process started by [`run_in_child`].
const CHILD_VAR: &str = "MIR_TEST_CHILD";

/// True when this test binary was started by [`run_in_child`].
pub fn in_child() -> bool {
    std::env::var_os(CHILD_VAR).is_some()
}

/// Runs the single test `name` of this test binary in a child process, for
/// behavior that ends the process.
pub fn run_in_child(name: &str) -> Output {
    let exe = std::env::current_exe().unwrap();
    Command::new(exe)
        .args([name, "--exact", "--test-threads=1", "--nocapture"])
        .env(CHILD_VAR, "1")
        .stdin(Stdio::null())
        .output()
        .unwrap()
}

/// Asserts the child run of `name` aborted with a diagnostic containing
/// `message`.
pub fn assert_aborts(name: &str, message: &str) {
    let output = run_in_child(name);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(!output.status.success(), "{name} exited normally:\n{stderr}");
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        assert_eq!(output.status.signal(), Some(6), "{name} was not aborted");
    }
    assert!(stderr.contains(message), "{name} stderr:\n{stderr}");
}

/// A runtime of `workers` unpinned workers on a synthetic single-node
/// machine, so tests run the same on any host.
pub fn runtime(workers: usize, policy: PolicyKind) -> Builder {
    Runtime::builder()
        .workers(workers)
        .policy(policy)
        .pinning(PinningStrategy::None)
        .arch(Arch::uniform("test", workers))
}

/// Two nodes of two cores each.
pub fn two_nodes() -> Arch {
    Arch::builder("two-nodes", 2)
        .cores_per_node(2)
        .llc_size_kb(4)
        .build()
}
