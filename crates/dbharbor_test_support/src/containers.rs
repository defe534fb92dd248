use dbharbor_core::{ConnectionNode, DbError, DbKind};
use std::time::{Duration, Instant};
use testcontainers::GenericImage;
use testcontainers::clients::Cli;
use testcontainers::core::WaitFor;

/// Start a throwaway MySQL server and hand `run` a node for its `testdb`.
pub fn with_mysql_node<T, E, F>(run: F) -> Result<T, E>
where
    F: FnOnce(ConnectionNode) -> Result<T, E>,
{
    let docker = Cli::default();
    let image = GenericImage::new("mysql", "8.4")
        .with_env_var("MYSQL_ROOT_PASSWORD", "root")
        .with_env_var("MYSQL_DATABASE", "testdb")
        .with_exposed_port(3306)
        .with_wait_for(WaitFor::message_on_stderr("ready for connections"));

    let container = docker.run(image);
    let port = container.get_host_port_ipv4(3306);
    let node = ConnectionNode::new(DbKind::MySQL, "127.0.0.1", port, "root")
        .with_password("root")
        .with_database("testdb");

    run(node)
}

/// Retry `operation` until it succeeds or `timeout` passes. Servers in fresh
/// containers often refuse connections for a few seconds after the wait
/// condition fires.
pub fn retry_db_operation<T, F>(timeout: Duration, mut operation: F) -> Result<T, DbError>
where
    F: FnMut() -> Result<T, DbError>,
{
    let deadline = Instant::now() + timeout;

    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(error) => {
                if Instant::now() >= deadline {
                    return Err(error);
                }
            }
        }

        std::thread::sleep(Duration::from_millis(250));
    }
}
