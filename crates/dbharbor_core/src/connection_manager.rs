use crate::{
    ActiveDocument, ChildDescriptor, Connection, ConnectionIdentity, ConnectionNode, DbDriver,
    DbError, DbKind, ExpansionState, ManagerConfig, MetadataCache, QueryRequest, SshTunnelConfig,
    TreeRefresh, TunnelService, parse_query_file_name,
};
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Options for a single `get_connection` call.
#[derive(Debug, Clone)]
pub struct GetRequest {
    /// Attempt number this request starts at. Attempts continue while below
    /// `ManagerConfig::max_connect_attempts`.
    pub retry_count: u32,

    /// Pin the request to one specific live connection, bypassing the
    /// structural identity.
    pub session_id: Option<String>,
}

impl Default for GetRequest {
    fn default() -> Self {
        Self {
            retry_count: 1,
            session_id: None,
        }
    }
}

impl GetRequest {
    pub fn pinned(session_id: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            ..Self::default()
        }
    }
}

struct LiveConnection {
    connection: Arc<dyn Connection>,
    /// Tunnel the connection was created through, if any.
    ssh: Option<SshTunnelConfig>,
    /// Database currently selected on the handle.
    database: Option<String>,
}

#[derive(Default)]
struct ManagerState {
    live: HashMap<ConnectionIdentity, LiveConnection>,
    /// Slots with a connect in flight.
    pending: HashSet<ConnectionIdentity>,
    active: Option<ConnectionNode>,
    cache: MetadataCache,
}

/// Owns every live connection and the active node.
///
/// Live connections are keyed by slot identity (`ConnectionIdentity::slot`):
/// one per server unless a request pins a session. All calls for one slot are
/// serialized through a per-slot gate, so concurrent requests for the same
/// slot wait for the first connect and then reuse its result. The state lock
/// itself is never held across network I/O.
pub struct ConnectionManager {
    config: ManagerConfig,
    drivers: HashMap<DbKind, Arc<dyn DbDriver>>,
    tunnels: Option<Arc<dyn TunnelService>>,
    refresh: Option<Arc<dyn TreeRefresh>>,
    active_document: Option<Arc<dyn ActiveDocument>>,
    state: Mutex<ManagerState>,
    gates: Mutex<HashMap<ConnectionIdentity, Arc<Mutex<()>>>>,
}

impl ConnectionManager {
    pub fn new(config: ManagerConfig) -> Self {
        let state = ManagerState {
            cache: MetadataCache::with_default_expansion(config.default_expansion),
            ..ManagerState::default()
        };

        Self {
            config,
            drivers: HashMap::new(),
            tunnels: None,
            refresh: None,
            active_document: None,
            state: Mutex::new(state),
            gates: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_driver(&mut self, driver: Arc<dyn DbDriver>) {
        info!("Registered driver: {}", driver.display_name());
        self.drivers.insert(driver.kind(), driver);
    }

    pub fn with_driver(mut self, driver: Arc<dyn DbDriver>) -> Self {
        self.register_driver(driver);
        self
    }

    pub fn with_tunnel_service(mut self, tunnels: Arc<dyn TunnelService>) -> Self {
        self.tunnels = Some(tunnels);
        self
    }

    pub fn with_tree_refresh(mut self, refresh: Arc<dyn TreeRefresh>) -> Self {
        self.refresh = Some(refresh);
        self
    }

    pub fn with_active_document(mut self, active_document: Arc<dyn ActiveDocument>) -> Self {
        self.active_document = Some(active_document);
        self
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn driver(&self, kind: DbKind) -> Result<Arc<dyn DbDriver>, DbError> {
        self.drivers
            .get(&kind)
            .cloned()
            .ok_or_else(|| DbError::NotSupported(format!("No driver for {}", kind.display_name())))
    }

    // --- Connections ---

    /// Return a usable connection for `node`, reusing, re-pointing or
    /// creating one as needed.
    pub fn get_connection(
        &self,
        node: &ConnectionNode,
        request: GetRequest,
    ) -> Result<Arc<dyn Connection>, DbError> {
        let slot = ConnectionIdentity::slot(node, request.session_id.as_deref());
        let gate = self.gate(&slot);
        let _in_flight = lock(&gate, "connection slot");

        self.state().cache.remember_node(node);

        if let Some(connection) = self.reuse_live(&slot, node) {
            return Ok(connection);
        }

        self.connect_with_retry(&slot, node, request.retry_count)
    }

    /// Live handle for `slot` if it is alive and can serve `node`'s database.
    fn reuse_live(&self, slot: &ConnectionIdentity, node: &ConnectionNode) -> Option<Arc<dyn Connection>> {
        let (connection, current) = {
            let state = self.state();
            let live = state.live.get(slot)?;
            (live.connection.clone(), live.database.clone())
        };

        if !connection.is_alive() {
            info!("Connection {} is no longer alive, reconnecting", slot);
            self.teardown(slot);
            return None;
        }

        let Some(wanted) = requested_database(node) else {
            debug!("Reusing connection {}", slot);
            return Some(connection);
        };

        // Statements carrying their own database may have moved the session.
        let current = match connection.current_database() {
            Some(selected) if current.as_deref() != Some(selected.as_str()) => {
                debug!(
                    "Connection {} switched to {} behind the manager",
                    slot, selected
                );
                self.record_database(slot, &selected);
                Some(selected)
            }
            _ => current,
        };

        if current.as_deref() == Some(wanted) {
            debug!("Reusing connection {} on database {}", slot, wanted);
            return Some(connection);
        }

        match self.repoint(connection.as_ref(), node.kind, wanted) {
            Ok(()) => {
                self.record_database(slot, wanted);
                info!(
                    "Re-pointed connection {} from {} to {}",
                    slot,
                    current.as_deref().unwrap_or("<none>"),
                    wanted
                );
                Some(connection)
            }
            Err(e) => {
                warn!("Failed to switch {} to database {}: {}", slot, wanted, e);
                self.teardown(slot);
                None
            }
        }
    }

    fn record_database(&self, slot: &ConnectionIdentity, database: &str) {
        if let Some(live) = self.state().live.get_mut(slot) {
            live.database = Some(database.to_string());
        }
    }

    fn repoint(&self, connection: &dyn Connection, kind: DbKind, database: &str) -> Result<(), DbError> {
        let driver = self.driver(kind)?;

        // Engines without a switch statement only have the selection recorded.
        if let Some(sql) = driver.dialect().switch_database(database) {
            connection.execute(&QueryRequest::new(sql))?;
        }

        Ok(())
    }

    fn connect_with_retry(
        &self,
        slot: &ConnectionIdentity,
        node: &ConnectionNode,
        retry_count: u32,
    ) -> Result<Arc<dyn Connection>, DbError> {
        let max_attempts = self.config.max_connect_attempts.max(1);
        let mut attempt = retry_count.max(1);

        loop {
            info!(
                "Connecting {} ({}:{}) attempt {}/{}",
                slot, node.host, node.port, attempt, max_attempts
            );

            match self.connect_once(slot, node) {
                Ok(connection) => return Ok(connection),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    warn!("Connect attempt {} for {} failed, retrying: {}", attempt, slot, e);
                    attempt += 1;
                }
                Err(e) => {
                    error!("Failed to connect {}: {}", slot, e);
                    return Err(e);
                }
            }
        }
    }

    fn connect_once(
        &self,
        slot: &ConnectionIdentity,
        node: &ConnectionNode,
    ) -> Result<Arc<dyn Connection>, DbError> {
        let driver = self.driver(node.kind)?;
        let params = self.tunneled_params(slot, node)?;

        self.state().pending.insert(slot.clone());
        let result = driver.connect(&params);
        self.state().pending.remove(slot);

        match result {
            Ok(connection) => {
                let connection: Arc<dyn Connection> = Arc::from(connection);
                self.state().live.insert(
                    slot.clone(),
                    LiveConnection {
                        connection: connection.clone(),
                        ssh: node.ssh.clone(),
                        database: requested_database(node).map(str::to_string),
                    },
                );
                info!("Connected {}", slot);
                Ok(connection)
            }
            Err(e) => {
                if node.uses_ssh() {
                    self.close_tunnel(slot);
                }
                Err(e)
            }
        }
    }

    /// Connection parameters for `node`, routed through a tunnel when it asks
    /// for one. Any failure here is a `TunnelFailed`.
    fn tunneled_params(
        &self,
        slot: &ConnectionIdentity,
        node: &ConnectionNode,
    ) -> Result<ConnectionNode, DbError> {
        if !node.uses_ssh() {
            return Ok(node.clone());
        }

        let tunnels = self
            .tunnels
            .as_ref()
            .ok_or_else(|| DbError::tunnel_failed("No tunnel service configured"))?;

        tunnels.open(slot, node).map_err(|e| match e {
            DbError::TunnelFailed(_) => e,
            other => DbError::tunnel_failed(other.to_string()),
        })
    }

    /// Remove the live entry for `slot`, closing its tunnel and handle.
    ///
    /// Close failures are logged and swallowed.
    fn teardown(&self, slot: &ConnectionIdentity) -> bool {
        let Some(live) = self.state().live.remove(slot) else {
            return false;
        };

        if live.ssh.is_some() {
            self.close_tunnel(slot);
        }

        if let Err(e) = live.connection.close() {
            warn!("Error closing connection {}: {}", slot, e);
        }

        info!("Closed connection {}", slot);
        true
    }

    fn close_tunnel(&self, slot: &ConnectionIdentity) {
        if let Some(tunnels) = &self.tunnels
            && let Err(e) = tunnels.close(slot)
        {
            warn!("Error closing tunnel {}: {}", slot, e);
        }
    }

    /// Tear down the connection at `identity` and forget everything cached
    /// underneath it. Safe to call when nothing is connected.
    pub fn remove_connection(&self, identity: &ConnectionIdentity) {
        let gate = self.gate(identity);
        {
            let _in_flight = lock(&gate, "connection slot");

            {
                let mut state = self.state();
                if state
                    .active
                    .as_ref()
                    .is_some_and(|active| active.identity(None).is_within(identity))
                {
                    info!("Cleared active node {}", identity);
                    state.active = None;
                }
            }

            self.teardown(identity);
            self.invalidate_subtree(identity);
        }
        self.release_gate(identity, gate);

        // The sink may call straight back into the manager for this slot.
        self.notify_refresh(Some(identity));
    }

    /// Tear down every live connection and reset the active node and cache.
    pub fn close_all(&self) {
        let slots: Vec<ConnectionIdentity> = self.state().live.keys().cloned().collect();

        for slot in &slots {
            let gate = self.gate(slot);
            {
                let _in_flight = lock(&gate, "connection slot");
                self.teardown(slot);
            }
            self.release_gate(slot, gate);
        }

        {
            let mut state = self.state();
            state.active = None;
            state.cache.clear();
        }

        if !slots.is_empty() {
            info!("Closed {} connection(s)", slots.len());
        }
        self.notify_refresh(None);
    }

    // --- Active node ---

    /// Record `node` as the target of ambient requests. Does not connect.
    pub fn change_active(&self, node: &ConnectionNode) {
        let identity = node.identity(None);
        {
            let mut state = self.state();
            state.cache.remember_node(node);
            state.active = Some(node.clone());
        }

        info!("Active node is now {}", identity);
        self.notify_refresh(Some(&identity));
    }

    pub fn active_node(&self) -> Option<ConnectionNode> {
        self.state().active.clone()
    }

    /// Resolve the node an ambient request applies to.
    ///
    /// With `check_active_file`, the focused query file wins over the active
    /// node, and finding neither is `DbError::NoActiveConnection`.
    pub fn get_last_connection_option(
        &self,
        check_active_file: bool,
    ) -> Result<Option<ConnectionNode>, DbError> {
        if check_active_file
            && let Some(node) = self.node_from_active_document()
        {
            return Ok(Some(node));
        }

        match self.active_node() {
            Some(node) => Ok(Some(node)),
            None if check_active_file => Err(DbError::NoActiveConnection),
            None => Ok(None),
        }
    }

    fn node_from_active_document(&self) -> Option<ConnectionNode> {
        let document = self.active_document.as_ref()?.focused_document()?;

        if let Some(marker) = self.config.query_file_marker.as_deref()
            && !document.contains(marker)
        {
            return None;
        }

        let coords = parse_query_file_name(&document)?;
        let identity = coords.identity();
        let state = self.state();

        let node = match state.cache.node(&identity) {
            Some(node) => node.clone(),
            None => {
                let server = ConnectionIdentity::from_coordinates(
                    &coords.host,
                    coords.port,
                    &coords.user,
                    None,
                );
                state
                    .cache
                    .node_on_server(&server)?
                    .for_database(coords.database.as_deref())
            }
        };

        if node.kind.mode() != coords.mode {
            debug!("Ignoring {}: mode {} does not match {}", document, coords.mode, node.kind.mode());
            return None;
        }

        debug!("Resolved {} from focused document", identity);
        Some(node)
    }

    // --- Metadata cache ---

    pub fn cached_children(&self, identity: &ConnectionIdentity) -> Option<Vec<ChildDescriptor>> {
        self.state().cache.get_children(identity).map(<[_]>::to_vec)
    }

    pub fn set_cached_children(&self, identity: ConnectionIdentity, children: Vec<ChildDescriptor>) {
        self.state().cache.set_children(identity, children);
    }

    pub fn expansion_state(&self, identity: &ConnectionIdentity) -> ExpansionState {
        self.state().cache.get_expansion_state(identity)
    }

    pub fn set_expansion_state(&self, identity: ConnectionIdentity, state: ExpansionState) {
        self.state().cache.set_expansion_state(identity, state);
    }

    /// Invalidate every cached identity rooted at `root`. Returns how many
    /// entries were dropped.
    pub fn invalidate_subtree(&self, root: &ConnectionIdentity) -> usize {
        let mut state = self.state();
        let identities = state.cache.identities_within(root);

        let removed = identities
            .iter()
            .filter(|identity| state.cache.invalidate(identity))
            .count();

        if removed > 0 {
            debug!("Invalidated {} cache entries under {}", removed, root);
        }
        removed
    }

    // --- Accessors ---

    pub fn live_database(&self, slot: &ConnectionIdentity) -> Option<String> {
        self.state()
            .live
            .get(slot)
            .and_then(|live| live.database.clone())
    }

    pub fn is_live(&self, slot: &ConnectionIdentity) -> bool {
        self.state().live.contains_key(slot)
    }

    pub fn is_connecting(&self, slot: &ConnectionIdentity) -> bool {
        self.state().pending.contains(slot)
    }

    pub fn live_count(&self) -> usize {
        self.state().live.len()
    }

    /// Number of slots with a gate allocated.
    pub fn gate_count(&self) -> usize {
        lock(&self.gates, "connection gates").len()
    }

    pub(crate) fn notify_refresh(&self, identity: Option<&ConnectionIdentity>) {
        if let Some(refresh) = &self.refresh {
            refresh.refresh(identity);
        }
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        lock(&self.state, "connection manager state")
    }

    fn gate(&self, slot: &ConnectionIdentity) -> Arc<Mutex<()>> {
        lock(&self.gates, "connection gates")
            .entry(slot.clone())
            .or_default()
            .clone()
    }

    /// Drop the gate for `slot` unless another caller holds or awaits it.
    fn release_gate(&self, slot: &ConnectionIdentity, gate: Arc<Mutex<()>>) {
        let mut gates = lock(&self.gates, "connection gates");

        // One reference in the map, one in `gate`.
        if Arc::strong_count(&gate) == 2
            && gates.get(slot).is_some_and(|held| Arc::ptr_eq(held, &gate))
        {
            gates.remove(slot);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

fn requested_database(node: &ConnectionNode) -> Option<&str> {
    node.database.as_deref().filter(|db| !db.is_empty())
}

fn lock<'a, T>(mutex: &'a Mutex<T>, what: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poison_err) => {
            warn!("{} mutex poisoned, recovering...", what);
            poison_err.into_inner()
        }
    }
}
