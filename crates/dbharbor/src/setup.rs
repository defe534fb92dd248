use std::sync::Arc;

use dbharbor_core::secrecy::SecretString;
use dbharbor_core::{ConnectionManager, ManagerConfig};
use dbharbor_ssh::SshTunnelService;

/// Environment variable holding the SSH password or key passphrase.
pub const SSH_SECRET_ENV: &str = "DBHARBOR_SSH_SECRET";

/// Manager wired with every compiled-in driver and the SSH tunnel service.
pub fn build_manager(config: ManagerConfig) -> ConnectionManager {
    let tunnels = SshTunnelService::new()
        .with_secret_provider(|_| std::env::var(SSH_SECRET_ENV).ok().map(SecretString::from));

    #[allow(unused_mut)]
    let mut manager = ConnectionManager::new(config).with_tunnel_service(Arc::new(tunnels));

    #[cfg(feature = "mysql")]
    {
        use dbharbor_core::DbKind;
        use dbharbor_driver_mysql::MysqlDriver;

        manager.register_driver(Arc::new(MysqlDriver::new(DbKind::MySQL)));
        manager.register_driver(Arc::new(MysqlDriver::new(DbKind::MariaDB)));
    }

    manager
}
