use crate::fake_driver::{mutex_lock, rwlock_read, rwlock_write};
use dbharbor_core::{ConnectionIdentity, ConnectionNode, DbError, TunnelService};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

const FIRST_LOCAL_PORT: u16 = 40_000;

#[derive(Debug, Clone, Default)]
pub struct FakeTunnelStats {
    /// Identities passed to `open`, in call order.
    pub opened: Vec<ConnectionIdentity>,
    /// Identities passed to `close`, in call order.
    pub closed: Vec<ConnectionIdentity>,
    /// Forwards currently open.
    pub open_tunnels: usize,
}

#[derive(Default)]
struct FakeTunnelState {
    tunnels: Mutex<HashMap<ConnectionIdentity, u16>>,
    opened: Mutex<Vec<ConnectionIdentity>>,
    closed: Mutex<Vec<ConnectionIdentity>>,
    open_error: RwLock<Option<String>>,
    next_port: Mutex<u16>,
}

/// `TunnelService` that hands out fake local ports without any I/O.
#[derive(Clone, Default)]
pub struct FakeTunnelService {
    state: Arc<FakeTunnelState>,
}

impl FakeTunnelService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open_error(self, message: impl Into<String>) -> Self {
        *rwlock_write(&self.state.open_error) = Some(message.into());
        self
    }

    pub fn local_port(&self, identity: &ConnectionIdentity) -> Option<u16> {
        mutex_lock(&self.state.tunnels).get(identity).copied()
    }

    pub fn stats(&self) -> FakeTunnelStats {
        FakeTunnelStats {
            opened: mutex_lock(&self.state.opened).clone(),
            closed: mutex_lock(&self.state.closed).clone(),
            open_tunnels: mutex_lock(&self.state.tunnels).len(),
        }
    }

    pub fn as_service_arc(self) -> Arc<dyn TunnelService> {
        Arc::new(self)
    }
}

impl TunnelService for FakeTunnelService {
    fn open(
        &self,
        identity: &ConnectionIdentity,
        node: &ConnectionNode,
    ) -> Result<ConnectionNode, DbError> {
        mutex_lock(&self.state.opened).push(identity.clone());

        if let Some(message) = rwlock_read(&self.state.open_error).clone() {
            return Err(DbError::tunnel_failed(message));
        }

        let mut tunnels = mutex_lock(&self.state.tunnels);
        let port = match tunnels.get(identity) {
            Some(port) => *port,
            None => {
                let mut next = mutex_lock(&self.state.next_port);
                let port = FIRST_LOCAL_PORT + *next;
                *next += 1;
                tunnels.insert(identity.clone(), port);
                port
            }
        };

        Ok(node.tunneled(port))
    }

    fn close(&self, identity: &ConnectionIdentity) -> Result<(), DbError> {
        mutex_lock(&self.state.closed).push(identity.clone());
        mutex_lock(&self.state.tunnels).remove(identity);
        Ok(())
    }
}
