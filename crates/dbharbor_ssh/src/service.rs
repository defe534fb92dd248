use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use dbharbor_core::{ConnectionIdentity, ConnectionNode, DbError, SshTunnelConfig, TunnelService};
use secrecy::{ExposeSecret, SecretString};

use crate::session::establish_session;
use crate::tunnel::{LocalBind, SshTunnel, bind_local};

/// Looks up the SSH password or key passphrase for a bastion.
pub type SecretProvider = Box<dyn Fn(&SshTunnelConfig) -> Option<SecretString> + Send + Sync>;

/// [`TunnelService`] backed by `ssh2`, one forward per connection identity.
pub struct SshTunnelService {
    tunnels: Mutex<HashMap<ConnectionIdentity, SshTunnel>>,
    secrets: SecretProvider,
}

impl SshTunnelService {
    pub fn new() -> Self {
        Self {
            tunnels: Mutex::new(HashMap::new()),
            secrets: Box::new(|_| None),
        }
    }

    pub fn with_secret_provider(
        mut self,
        provider: impl Fn(&SshTunnelConfig) -> Option<SecretString> + Send + Sync + 'static,
    ) -> Self {
        self.secrets = Box::new(provider);
        self
    }

    pub fn is_open(&self, identity: &ConnectionIdentity) -> bool {
        self.tunnels()
            .get(identity)
            .is_some_and(|tunnel| tunnel.is_running())
    }

    pub fn open_count(&self) -> usize {
        self.tunnels().len()
    }

    /// Local port of the forward serving `identity`, if one is running.
    pub fn local_port(&self, identity: &ConnectionIdentity) -> Option<u16> {
        self.tunnels()
            .get(identity)
            .filter(|tunnel| tunnel.is_running())
            .map(SshTunnel::local_port)
    }

    fn tunnels(&self) -> MutexGuard<'_, HashMap<ConnectionIdentity, SshTunnel>> {
        self.tunnels.lock().unwrap_or_else(|poison| {
            log::warn!("SSH tunnel registry lock poisoned, recovering");
            poison.into_inner()
        })
    }

    fn start_tunnel(&self, ssh: &SshTunnelConfig, node: &ConnectionNode) -> Result<Option<SshTunnel>, DbError> {
        let listener = match bind_local(ssh.local_port)? {
            LocalBind::Bound(listener) => listener,
            LocalBind::InUse(_) => return Ok(None),
        };

        let secret = (self.secrets)(ssh);
        let session = establish_session(ssh, secret.as_ref().map(|s| s.expose_secret()))?;

        SshTunnel::start(listener, session, node.host.clone(), node.port).map(Some)
    }
}

impl Default for SshTunnelService {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelService for SshTunnelService {
    fn open(
        &self,
        identity: &ConnectionIdentity,
        node: &ConnectionNode,
    ) -> Result<ConnectionNode, DbError> {
        let Some(ssh) = node.ssh.as_ref() else {
            return Err(DbError::InvalidProfile(format!(
                "{} has no SSH settings",
                identity
            )));
        };

        let stale = {
            let mut tunnels = self.tunnels();
            match tunnels.get(identity) {
                Some(tunnel) if tunnel.is_running() => {
                    log::debug!("[SSH] reusing forward on port {} for {}", tunnel.local_port(), identity);
                    return Ok(node.tunneled(tunnel.local_port()));
                }
                Some(_) => tunnels.remove(identity),
                None => None,
            }
        };

        if stale.is_some() {
            log::info!("[SSH] forward for {} stopped, reopening", identity);
        }
        drop(stale);

        let Some(tunnel) = self.start_tunnel(ssh, node)? else {
            // Fixed port already taken: assume the forward holding it is ours.
            let port = ssh.local_port.unwrap_or_default();
            log::info!(
                "[SSH] local port {} in use, reusing existing forward for {}",
                port,
                identity
            );
            return Ok(node.tunneled(port));
        };

        let port = tunnel.local_port();
        let displaced = self.tunnels().insert(identity.clone(), tunnel);
        drop(displaced);

        log::info!(
            "[SSH] {} -> {}:{} via {}@{} on local port {}",
            identity,
            node.host,
            node.port,
            ssh.user,
            ssh.host,
            port
        );

        Ok(node.tunneled(port))
    }

    fn close(&self, identity: &ConnectionIdentity) -> Result<(), DbError> {
        let removed = self.tunnels().remove(identity);

        if let Some(mut tunnel) = removed {
            log::info!("[SSH] closing forward on port {} for {}", tunnel.local_port(), identity);
            tunnel.stop();
        }

        Ok(())
    }
}
