use dbharbor_core::{
    ColumnMeta, ConnectionNode, DbKind, QueryResult, Row, SshAuthMethod, SshTunnelConfig, Value,
};
use std::time::Duration;

pub fn mysql_node() -> ConnectionNode {
    ConnectionNode::new(DbKind::MySQL, "localhost", 3306, "root").with_password("root")
}

pub fn mysql_node_on(database: &str) -> ConnectionNode {
    mysql_node().with_database(database)
}

pub fn ssh_config() -> SshTunnelConfig {
    SshTunnelConfig {
        host: "bastion.internal".to_string(),
        port: 22,
        user: "ops".to_string(),
        auth_method: SshAuthMethod::PrivateKey { key_path: None },
        local_port: None,
    }
}

/// MySQL node behind a bastion, with `shop` selected.
pub fn ssh_node() -> ConnectionNode {
    ConnectionNode::new(DbKind::MySQL, "db.internal", 3306, "app")
        .with_database("shop")
        .with_ssh(ssh_config())
}

pub fn table_result(columns: Vec<ColumnMeta>, rows: Vec<Row>) -> QueryResult {
    QueryResult {
        columns,
        rows,
        affected_rows: None,
        execution_time: Duration::ZERO,
    }
}

pub fn column(name: impl Into<String>, type_name: impl Into<String>, nullable: bool) -> ColumnMeta {
    ColumnMeta {
        name: name.into(),
        type_name: type_name.into(),
        nullable,
    }
}

pub fn int_cell(value: i64) -> Value {
    Value::Int(value)
}

pub fn text_cell(value: impl Into<String>) -> Value {
    Value::Text(value.into())
}
