//! Query file naming.
//!
//! Query buffers opened for a connection are named
//! `<mode>_<host>_<port>_<user>[_<database>]`, optionally followed by a
//! `#suffix` and a file extension. The active-document lookup recovers the
//! connection coordinates from that name. Database names may themselves
//! contain underscores, so every segment after the user is joined back
//! together to form the database.

use std::path::Path;

use crate::identity::SEPARATOR;
use crate::{ConnectionIdentity, ConnectionNode};

/// Connection coordinates recovered from a query file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryFileCoordinates {
    pub mode: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: Option<String>,
}

impl QueryFileCoordinates {
    pub fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::from_coordinates(
            &self.host,
            self.port,
            &self.user,
            self.database.as_deref(),
        )
    }
}

/// File stem for a query buffer bound to `node`.
pub fn query_file_name(node: &ConnectionNode) -> String {
    let mut name = format!(
        "{mode}{SEPARATOR}{host}{SEPARATOR}{port}{SEPARATOR}{user}",
        mode = node.kind.mode(),
        host = node.host,
        port = node.port,
        user = node.user,
    );

    if let Some(database) = node.database.as_deref().filter(|db| !db.is_empty()) {
        name.push(SEPARATOR);
        name.push_str(database);
    }

    name
}

/// Parse the coordinates encoded in a query file path or name.
///
/// Returns `None` when the name does not carry at least mode, host, port and
/// user, or when the port is not a number.
pub fn parse_query_file_name(file_name: &str) -> Option<QueryFileCoordinates> {
    let path = Path::new(file_name);
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(file_name);

    let stem = strip_hash_suffix(stem);
    let segments: Vec<&str> = stem.split(SEPARATOR).collect();

    let [mode, host, port, user, database @ ..] = segments.as_slice() else {
        return None;
    };

    let port = port.parse::<u16>().ok()?;
    let database = if database.is_empty() {
        None
    } else {
        let separator = SEPARATOR.to_string();
        Some(database.join(separator.as_str())).filter(|db| !db.is_empty())
    };

    Some(QueryFileCoordinates {
        mode: mode.to_string(),
        host: host.to_string(),
        port,
        user: user.to_string(),
        database,
    })
}

/// Drop a `#...` suffix. A lone trailing `#` is kept.
fn strip_hash_suffix(stem: &str) -> &str {
    match stem.find('#') {
        Some(idx) if idx + 1 < stem.len() => &stem[..idx],
        _ => stem,
    }
}
