//! Port and credential allocation for managed instances.
//!
//! A single allocator serves every project. Reservations are tracked in memory and,
//! when enabled, a candidate port is also test-bound on the host so ports held by
//! unrelated processes are skipped.

use crate::error::AppError;
use crate::registry::{generate_password, generate_username, Secret};
use crate::settings::LifecycleSettings;
use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

struct Reservations {
    ports: HashSet<u16>,
    /// Where the next scan starts; spreads reuse of released ports.
    cursor: u16,
}

pub struct ResourceAllocator {
    start: u16,
    end: u16,
    check_host: bool,
    state: Mutex<Reservations>,
}

impl ResourceAllocator {
    pub fn new(settings: &LifecycleSettings) -> Self {
        Self {
            start: settings.port_range_start,
            end: settings.port_range_end,
            check_host: settings.check_host_ports,
            state: Mutex::new(Reservations {
                ports: HashSet::new(),
                cursor: settings.port_range_start,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Reservations> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn host_port_free(&self, port: u16) -> bool {
        !self.check_host || TcpListener::bind(("0.0.0.0", port)).is_ok()
    }

    /// Reserve a free port in the configured range.
    pub fn reserve_port(&self) -> Result<u16, AppError> {
        let mut state = self.lock();
        let span = u32::from(self.end - self.start) + 1;
        for step in 0..span {
            let offset = (u32::from(state.cursor - self.start) + step) % span;
            let port = self.start + offset as u16;
            if state.ports.contains(&port) || !self.host_port_free(port) {
                continue;
            }
            state.ports.insert(port);
            state.cursor = if port == self.end { self.start } else { port + 1 };
            debug!(port, "port reserved");
            return Ok(port);
        }
        Err(AppError::Provisioning(format!(
            "no free port in {}..={}",
            self.start, self.end
        )))
    }

    pub fn release_port(&self, port: u16) {
        if self.lock().ports.remove(&port) {
            debug!(port, "port released");
        }
    }

    /// Re-reserve a port recorded for an existing instance. False if already taken.
    pub fn restore_port(&self, port: u16) -> bool {
        if port < self.start || port > self.end {
            return false;
        }
        self.lock().ports.insert(port)
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.lock().ports.contains(&port)
    }

    pub fn reserved_count(&self) -> usize {
        self.lock().ports.len()
    }

    /// Fresh username and password for a new instance.
    pub fn credentials(&self) -> (String, Secret) {
        let _serialized = self.lock();
        (generate_username(), generate_password())
    }
}
