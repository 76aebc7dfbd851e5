//! Clients for the controller's external collaborators: artifact store,
//! VCS hosts, the local container engine, the image registry, the signer,
//! the scanner containers and the notification service.

pub mod artifact_store;
pub mod container;
pub mod git;
pub mod notifier;
pub mod registry;
pub mod scanner;
pub mod signer;

use std::process::Output;

/// Combined stdout+stderr of a finished tool invocation, for error capture.
pub(crate) fn tool_log(output: &Output) -> String {
    let mut log = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !log.is_empty() {
            log.push('\n');
        }
        log.push_str(stderr.trim());
    }
    log
}
