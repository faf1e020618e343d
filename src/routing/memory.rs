//! In-memory routing backend
//!
//! Simulates kernel state so the routing lifecycle can be exercised without
//! privileges. Installing an artifact that already exists fails with
//! `Conflict`, like the kernel's "File exists", so a duplicate install is
//! visible to tests instead of silently absorbed.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::os::fd::AsRawFd;

use parking_lot::Mutex;
use socket2::Socket;

use super::backend::{RoutingBackend, RoutingRule};
use crate::error::{ArtifactKind, BackendError};

/// Artifact identity: (kind, exit address, table id)
type ArtifactKey = (ArtifactKind, IpAddr, u32);

#[derive(Debug, Default)]
struct MemoryState {
    installed: HashMap<ArtifactKey, RoutingRule>,
    created: u64,
    removed: u64,
    /// raw fd -> mark
    marks: HashMap<i32, u32>,
    marks_applied: u64,
    fail_install: HashSet<(IpAddr, ArtifactKind)>,
    fail_remove: HashSet<(IpAddr, ArtifactKind)>,
    fail_mark: HashSet<IpAddr>,
    missing_interfaces: HashSet<String>,
    deny_all: bool,
}

/// Test double counting artifacts, with failure injection
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make installing `kind` for `exit` fail
    pub fn fail_install(&self, exit: IpAddr, kind: ArtifactKind) {
        self.state.lock().fail_install.insert((exit, kind));
    }

    /// Make removing `kind` for `exit` fail
    pub fn fail_remove(&self, exit: IpAddr, kind: ArtifactKind) {
        self.state.lock().fail_remove.insert((exit, kind));
    }

    /// Make marking sockets for `exit` fail
    pub fn fail_mark(&self, exit: IpAddr) {
        self.state.lock().fail_mark.insert(exit);
    }

    /// Pretend `interface` does not exist
    pub fn remove_interface(&self, interface: impl Into<String>) {
        self.state.lock().missing_interfaces.insert(interface.into());
    }

    /// Refuse every operation as if unprivileged
    pub fn deny_all(&self, deny: bool) {
        self.state.lock().deny_all = deny;
    }

    /// Clear all injected failures
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.fail_install.clear();
        state.fail_remove.clear();
        state.fail_mark.clear();
        state.missing_interfaces.clear();
        state.deny_all = false;
    }

    /// Artifacts currently installed
    #[must_use]
    pub fn installed_count(&self) -> usize {
        self.state.lock().installed.len()
    }

    /// Installed artifacts belonging to `exit`
    #[must_use]
    pub fn installed_for(&self, exit: IpAddr) -> Vec<ArtifactKind> {
        let mut kinds: Vec<ArtifactKind> = self
            .state
            .lock()
            .installed
            .keys()
            .filter(|(_, addr, _)| *addr == exit)
            .map(|(kind, _, _)| *kind)
            .collect();
        kinds.sort_by_key(|k| *k as u8);
        kinds
    }

    /// Whether `kind` for `exit` is installed
    #[must_use]
    pub fn is_installed(&self, exit: IpAddr, kind: ArtifactKind) -> bool {
        self.state
            .lock()
            .installed
            .keys()
            .any(|(k, addr, _)| *k == kind && *addr == exit)
    }

    /// Total successful installs
    #[must_use]
    pub fn created(&self) -> u64 {
        self.state.lock().created
    }

    /// Total successful removals
    #[must_use]
    pub fn removed(&self) -> u64 {
        self.state.lock().removed
    }

    /// Total successful `mark_socket` calls
    #[must_use]
    pub fn marks_applied(&self) -> u64 {
        self.state.lock().marks_applied
    }

    /// Mark recorded for a socket
    #[must_use]
    pub fn mark_of(&self, socket: &Socket) -> Option<u32> {
        self.state.lock().marks.get(&socket.as_raw_fd()).copied()
    }
}

impl RoutingBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn install(&self, kind: ArtifactKind, rule: &RoutingRule) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.deny_all {
            return Err(BackendError::PermissionDenied(format!("install {kind}")));
        }
        if kind == ArtifactKind::Route && state.missing_interfaces.contains(&rule.interface) {
            return Err(BackendError::MissingInterface(rule.interface.clone()));
        }
        if state.fail_install.contains(&(rule.address, kind)) {
            return Err(BackendError::Rejected(format!(
                "injected install failure: {kind} for {}",
                rule.address
            )));
        }

        let key = (kind, rule.address, rule.table_id);
        if state.installed.contains_key(&key) {
            return Err(BackendError::Conflict(format!("{kind} for {rule} exists")));
        }
        state.installed.insert(key, rule.clone());
        state.created += 1;
        Ok(())
    }

    fn remove(&self, kind: ArtifactKind, rule: &RoutingRule) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.deny_all {
            return Err(BackendError::PermissionDenied(format!("remove {kind}")));
        }
        if state.fail_remove.contains(&(rule.address, kind)) {
            return Err(BackendError::Rejected(format!(
                "injected remove failure: {kind} for {}",
                rule.address
            )));
        }

        if state
            .installed
            .remove(&(kind, rule.address, rule.table_id))
            .is_some()
        {
            state.removed += 1;
        }
        Ok(())
    }

    fn mark_socket(&self, socket: &Socket, rule: &RoutingRule) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        if state.deny_all {
            return Err(BackendError::PermissionDenied("SO_MARK".into()));
        }
        if state.fail_mark.contains(&rule.address) {
            return Err(BackendError::socket_option(
                "SO_MARK",
                format!("injected mark failure for {}", rule.address),
            ));
        }
        state.marks.insert(socket.as_raw_fd(), rule.fwmark);
        state.marks_applied += 1;
        Ok(())
    }
}
