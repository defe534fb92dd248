//! MySQL and MariaDB transport for the connection manager.

mod driver;

pub use driver::{MysqlConnection, MysqlDialect, MysqlDriver};
