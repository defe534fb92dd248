//! SSH local forwarding for database connections.
//!
//! A tunnel binds a local TCP port and relays every accepted socket through
//! a `direct-tcpip` channel on an authenticated SSH session.
//! [`SshTunnelService`] keeps one tunnel per connection identity and plugs
//! into the connection manager as its [`dbharbor_core::TunnelService`].

mod service;
mod session;
mod tunnel;

pub use service::{SecretProvider, SshTunnelService};
pub use session::establish_session;
pub use tunnel::{LocalBind, SshTunnel, bind_local};
