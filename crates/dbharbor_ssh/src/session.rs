use std::net::TcpStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use dbharbor_core::{DbError, SshAuthMethod, SshTunnelConfig};
use ssh2::Session;

const IO_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect, handshake and authenticate against the bastion in `config`.
///
/// `secret` is the password for [`SshAuthMethod::Password`] or the key
/// passphrase for [`SshAuthMethod::PrivateKey`].
pub fn establish_session(config: &SshTunnelConfig, secret: Option<&str>) -> Result<Session, DbError> {
    let started = Instant::now();

    log::debug!("[SSH] connecting to {}:{}", config.host, config.port);

    let tcp = TcpStream::connect((config.host.as_str(), config.port)).map_err(|e| {
        DbError::tunnel_failed(format!(
            "cannot reach SSH server {}:{}: {}",
            config.host, config.port, e
        ))
    })?;

    tcp.set_nodelay(true).ok();
    tcp.set_read_timeout(Some(IO_TIMEOUT)).ok();
    tcp.set_write_timeout(Some(IO_TIMEOUT)).ok();

    let mut session = Session::new()
        .map_err(|e| DbError::tunnel_failed(format!("cannot create SSH session: {}", e)))?;

    session.set_tcp_stream(tcp);
    session.set_timeout(IO_TIMEOUT.as_millis() as u32);

    session
        .handshake()
        .map_err(|e| DbError::tunnel_failed(format!("SSH handshake with {} failed: {}", config.host, e)))?;

    match &config.auth_method {
        SshAuthMethod::PrivateKey { key_path } => {
            authenticate_with_key(&session, &config.user, key_path.as_deref(), secret)?;
        }
        SshAuthMethod::Password => {
            let password = secret.ok_or_else(|| {
                DbError::tunnel_failed(format!(
                    "SSH password for {}@{} not provided",
                    config.user, config.host
                ))
            })?;

            session
                .userauth_password(&config.user, password)
                .map_err(|e| DbError::tunnel_failed(format!("SSH password rejected: {}", e)))?;
        }
    }

    if !session.authenticated() {
        return Err(DbError::tunnel_failed(format!(
            "SSH authentication as {} failed",
            config.user
        )));
    }

    log::info!(
        "[SSH] session to {}@{}:{} ready in {:.2}ms",
        config.user,
        config.host,
        config.port,
        started.elapsed().as_secs_f64() * 1000.0
    );

    Ok(session)
}

fn default_key_paths() -> Vec<PathBuf> {
    let home = dirs::home_dir().unwrap_or_default();
    ["id_ed25519", "id_rsa", "id_ecdsa"]
        .iter()
        .map(|name| home.join(".ssh").join(name))
        .collect()
}

fn authenticate_with_key(
    session: &Session,
    user: &str,
    key_path: Option<&Path>,
    passphrase: Option<&str>,
) -> Result<(), DbError> {
    if key_path.is_none() && session.userauth_agent(user).is_ok() && session.authenticated() {
        log::debug!("[SSH] authenticated via agent");
        return Ok(());
    }

    let candidates = match key_path {
        Some(path) => vec![path.to_path_buf()],
        None => default_key_paths(),
    };

    for path in candidates.iter().filter(|path| path.exists()) {
        match session.userauth_pubkey_file(user, None, path, passphrase) {
            Ok(()) if session.authenticated() => {
                log::debug!("[SSH] authenticated with {}", path.display());
                return Ok(());
            }
            Ok(()) => {}
            Err(e) => log::debug!("[SSH] key {} rejected: {}", path.display(), e),
        }
    }

    Err(DbError::tunnel_failed(format!(
        "SSH key authentication as {} failed",
        user
    )))
}
