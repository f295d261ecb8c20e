use std::collections::HashSet;
use std::net::TcpListener;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use nomad_config::PortRange;
use tracing::debug;

use super::InstanceError;

#[derive(Debug, Default)]
struct AllocState {
    held: HashSet<u16>,
    cursor: u32,
}

/// Hands out loopback ports from a fixed range.
///
/// A port is held from allocation until its [`PortLease`] is dropped, so two
/// live instances never share one even before the child has bound it.
/// Candidates are probed with a throwaway bind on `127.0.0.1`.
#[derive(Debug, Clone)]
pub struct PortAllocator {
    range: PortRange,
    max_attempts: u32,
    state: Arc<Mutex<AllocState>>,
}

/// Exclusive claim on a port. Dropping it returns the port to the pool.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    state: Arc<Mutex<AllocState>>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        lock(&self.state).held.remove(&self.port);
        debug!(port = self.port, "Released port");
    }
}

impl PortAllocator {
    pub fn new(range: PortRange, max_attempts: u32) -> Self {
        Self {
            range,
            max_attempts,
            state: Arc::new(Mutex::new(AllocState::default())),
        }
    }

    pub fn allocate(&self) -> Result<PortLease, InstanceError> {
        let mut state = lock(&self.state);
        let span = self.range.len();
        let mut attempts = 0;

        for offset in 0..span {
            if attempts >= self.max_attempts {
                break;
            }
            let index = (state.cursor + offset) % span;
            let Ok(port) = u16::try_from(u32::from(self.range.start) + index) else {
                continue;
            };
            // Binding port 0 always succeeds with an OS-chosen port.
            if port == 0 || state.held.contains(&port) {
                continue;
            }
            attempts += 1;
            if port_is_free(port) {
                state.held.insert(port);
                state.cursor = (index + 1) % span;
                debug!(port, attempts, "Allocated port");
                return Ok(PortLease {
                    port,
                    state: Arc::clone(&self.state),
                });
            }
        }

        Err(InstanceError::PortExhausted { attempts })
    }

    pub fn is_held(&self, port: u16) -> bool {
        lock(&self.state).held.contains(&port)
    }

    pub fn held_count(&self) -> usize {
        lock(&self.state).held.len()
    }
}

fn lock(state: &Mutex<AllocState>) -> MutexGuard<'_, AllocState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
