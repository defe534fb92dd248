use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use dbharbor_core::DbError;
use ssh2::Session;

const ACCEPT_POLL: Duration = Duration::from_millis(1);
const IDLE_POLL: Duration = Duration::from_micros(100);
const BUFFER_SIZE: usize = 8192;

/// Outcome of claiming the local end of a forward.
#[derive(Debug)]
pub enum LocalBind {
    Bound(TcpListener),

    /// The fixed port is already taken, most likely by a forward opened
    /// earlier that is still serving it.
    InUse(u16),
}

/// Bind `127.0.0.1:<port>`, or an ephemeral port when `port` is `None`.
pub fn bind_local(port: Option<u16>) -> Result<LocalBind, DbError> {
    match TcpListener::bind((Ipv4Addr::LOCALHOST, port.unwrap_or(0))) {
        Ok(listener) => Ok(LocalBind::Bound(listener)),
        Err(e) if e.kind() == ErrorKind::AddrInUse => match port {
            Some(port) => Ok(LocalBind::InUse(port)),
            None => Err(DbError::tunnel_failed(format!(
                "cannot bind local forward: {}",
                e
            ))),
        },
        Err(e) => Err(DbError::tunnel_failed(format!(
            "cannot bind local forward: {}",
            e
        ))),
    }
}

/// A running local forward. Dropping it stops the accept loop.
pub struct SshTunnel {
    local_port: u16,
    shutdown: Arc<AtomicBool>,
    forwarder: Option<JoinHandle<()>>,
}

impl SshTunnel {
    /// Relay connections accepted on `listener` to `remote_host:remote_port`
    /// as seen from the SSH server.
    pub fn start(
        listener: TcpListener,
        session: Session,
        remote_host: String,
        remote_port: u16,
    ) -> Result<Self, DbError> {
        let local_port = listener
            .local_addr()
            .map_err(|e| DbError::tunnel_failed(format!("cannot read local forward address: {}", e)))?
            .port();

        listener
            .set_nonblocking(true)
            .map_err(|e| DbError::tunnel_failed(format!("cannot make listener non-blocking: {}", e)))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let session = Arc::new(Mutex::new(session));

        let forwarder = {
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name(format!("ssh-forward-{}", local_port))
                .spawn(move || accept_loop(listener, session, remote_host, remote_port, shutdown))
                .map_err(|e| DbError::tunnel_failed(format!("cannot spawn forwarder: {}", e)))?
        };

        log::info!("[SSH] forwarding 127.0.0.1:{}", local_port);

        Ok(Self {
            local_port,
            shutdown,
            forwarder: Some(forwarder),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// False once stopped or once the accept loop died on a listener error.
    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::SeqCst)
            && self
                .forwarder
                .as_ref()
                .is_some_and(|handle| !handle.is_finished())
    }

    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);

        if let Some(handle) = self.forwarder.take()
            && handle.join().is_err()
        {
            log::warn!("[SSH] forwarder on port {} panicked", self.local_port);
        }
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.stop();
    }
}

fn accept_loop(
    listener: TcpListener,
    session: Arc<Mutex<Session>>,
    remote_host: String,
    remote_port: u16,
    shutdown: Arc<AtomicBool>,
) {
    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((client, _)) => {
                let session = session.clone();
                let remote_host = remote_host.clone();
                let shutdown = shutdown.clone();

                thread::spawn(move || {
                    if let Err(e) = relay(client, &session, &remote_host, remote_port, &shutdown) {
                        log::error!("[SSH] forwarded connection failed: {}", e);
                    }
                });
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                log::error!("[SSH] listener error, forward stopped: {}", e);
                break;
            }
        }
    }
}

fn relay(
    mut client: TcpStream,
    session: &Mutex<Session>,
    remote_host: &str,
    remote_port: u16,
    shutdown: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut channel = {
        let session = session
            .lock()
            .map_err(|_| "SSH session lock poisoned".to_string())?;

        session.set_blocking(true);
        let channel = session.channel_direct_tcpip(remote_host, remote_port, None)?;
        session.set_blocking(false);
        channel
    };

    client.set_nodelay(true)?;
    client.set_nonblocking(true)?;

    let mut upstream = [0u8; BUFFER_SIZE];
    let mut downstream = [0u8; BUFFER_SIZE];

    while !shutdown.load(Ordering::SeqCst) {
        let mut moved = false;

        match client.read(&mut upstream) {
            Ok(0) => break,
            Ok(n) => {
                channel.write_all(&upstream[..n])?;
                moved = true;
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(Box::new(e)),
        }

        match channel.read(&mut downstream) {
            Ok(0) => break,
            Ok(n) => {
                client.write_all(&downstream[..n])?;
                moved = true;
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => {}
            Err(e) => return Err(Box::new(e)),
        }

        if !moved {
            thread::sleep(IDLE_POLL);
        }
    }

    Ok(())
}
