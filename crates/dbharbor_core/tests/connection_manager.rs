use dbharbor_core::{
    ChildDescriptor, ChildKind, ConnectionIdentity, ConnectionManager, DbError, DbKind,
    ExpansionState, GetRequest, ManagerConfig, QueryRequest, TreeRefresh,
};
use dbharbor_test_support::fixtures::{mysql_node, mysql_node_on, ssh_node};
use dbharbor_test_support::{FakeDriver, FakeTunnelService, FixedActiveDocument, RecordingRefresh};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, OnceLock, Weak};
use std::thread;
use std::time::Duration;

struct Harness {
    manager: Arc<ConnectionManager>,
    driver: FakeDriver,
    tunnels: FakeTunnelService,
    refresh: RecordingRefresh,
    document: FixedActiveDocument,
}

fn harness_with(driver: FakeDriver, tunnels: FakeTunnelService, config: ManagerConfig) -> Harness {
    let refresh = RecordingRefresh::new();
    let document = FixedActiveDocument::new(None);

    let manager = ConnectionManager::new(config)
        .with_driver(driver.clone().as_driver_arc())
        .with_tunnel_service(tunnels.clone().as_service_arc())
        .with_tree_refresh(Arc::new(refresh.clone()))
        .with_active_document(Arc::new(document.clone()));

    Harness {
        manager: Arc::new(manager),
        driver,
        tunnels,
        refresh,
        document,
    }
}

fn harness(driver: FakeDriver) -> Harness {
    harness_with(driver, FakeTunnelService::new(), ManagerConfig::default())
}

fn server() -> ConnectionIdentity {
    mysql_node().server_identity()
}

fn children(identity: &ConnectionIdentity, names: &[&str]) -> Vec<ChildDescriptor> {
    names
        .iter()
        .map(|name| ChildDescriptor::new(ChildKind::Database, *name, identity.child(name)))
        .collect()
}

#[test]
fn second_get_is_served_from_live_entry() {
    let h = harness(FakeDriver::new(DbKind::MySQL));

    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .expect("first connect");
    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .expect("cache hit");

    let stats = h.driver.stats();
    assert_eq!(stats.connect_calls, 1);
    assert!(stats.executed_requests.is_empty());
    assert_eq!(stats.list_databases_calls, 0);
    assert_eq!(h.manager.live_count(), 1);
}

#[test]
fn different_database_is_re_pointed_not_reconnected() {
    let h = harness(FakeDriver::new(DbKind::MySQL));

    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .unwrap();
    h.manager
        .get_connection(&mysql_node_on("crm"), GetRequest::default())
        .unwrap();

    let stats = h.driver.stats();
    assert_eq!(stats.connect_calls, 1);
    assert_eq!(stats.executed_sql(), vec!["USE `crm`"]);
    assert_eq!(h.manager.live_database(&server()).as_deref(), Some("crm"));
}

#[test]
fn re_point_without_switch_statement_only_records_database() {
    let h = harness(FakeDriver::new(DbKind::MySQL).without_switch_statement());

    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .unwrap();
    h.manager
        .get_connection(&mysql_node_on("crm"), GetRequest::default())
        .unwrap();

    let stats = h.driver.stats();
    assert_eq!(stats.connect_calls, 1);
    assert!(stats.executed_requests.is_empty());
    assert_eq!(h.manager.live_database(&server()).as_deref(), Some("crm"));
}

#[test]
fn failed_re_point_tears_down_and_reconnects() {
    let h = harness(FakeDriver::new(DbKind::MySQL).with_query_error("USE `crm`", "Unknown database"));

    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .unwrap();
    h.manager
        .get_connection(&mysql_node_on("crm"), GetRequest::default())
        .expect("falls through to a fresh connect");

    let stats = h.driver.stats();
    assert_eq!(stats.connect_calls, 2);
    assert_eq!(stats.close_calls, 1);
    assert_eq!(stats.connected_nodes[1].database.as_deref(), Some("crm"));
    assert_eq!(h.manager.live_count(), 1);
    assert_eq!(h.manager.live_database(&server()).as_deref(), Some("crm"));
}

#[test]
fn server_level_request_reuses_whatever_database_is_selected() {
    let h = harness(FakeDriver::new(DbKind::MySQL));

    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .unwrap();
    h.manager
        .get_connection(&mysql_node(), GetRequest::default())
        .unwrap();

    let stats = h.driver.stats();
    assert_eq!(stats.connect_calls, 1);
    assert!(stats.executed_requests.is_empty());
    assert_eq!(h.manager.live_database(&server()).as_deref(), Some("shop"));
}

#[test]
fn dead_connection_is_replaced() {
    let h = harness(FakeDriver::new(DbKind::MySQL));

    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .unwrap();
    h.driver.kill_connections();

    let connection = h
        .manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .unwrap();

    assert!(connection.is_alive());
    let stats = h.driver.stats();
    assert_eq!(stats.connect_calls, 2);
    assert_eq!(stats.close_calls, 1);
    assert_eq!(h.manager.live_count(), 1);
}

#[test]
fn persistent_connect_failure_rejects_after_two_attempts() {
    let h = harness(FakeDriver::new(DbKind::MySQL).with_connect_error("Connection refused"));

    let err = h
        .manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .err()
        .expect("connect should fail");

    assert!(matches!(err, DbError::ConnectionFailed(_)));
    assert_eq!(h.driver.stats().connect_calls, 2);
    assert_eq!(h.manager.live_count(), 0);
    assert!(!h.manager.is_connecting(&server()));
}

#[test]
fn one_transient_failure_is_absorbed() {
    let h = harness(FakeDriver::new(DbKind::MySQL).with_failing_connects(1));

    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .expect("retry should succeed");

    assert_eq!(h.driver.stats().connect_calls, 2);
    assert!(h.manager.is_live(&server()));
}

#[test]
fn request_already_at_retry_limit_gets_one_attempt() {
    let h = harness(FakeDriver::new(DbKind::MySQL).with_connect_error("Connection refused"));

    let request = GetRequest {
        retry_count: 2,
        session_id: None,
    };
    assert!(h.manager.get_connection(&mysql_node(), request).is_err());
    assert_eq!(h.driver.stats().connect_calls, 1);
}

#[test]
fn larger_attempt_budget_is_honored() {
    let config = ManagerConfig {
        max_connect_attempts: 4,
        ..ManagerConfig::default()
    };
    let h = harness_with(
        FakeDriver::new(DbKind::MySQL).with_connect_error("Connection refused"),
        FakeTunnelService::new(),
        config,
    );

    assert!(h.manager.get_connection(&mysql_node(), GetRequest::default()).is_err());
    assert_eq!(h.driver.stats().connect_calls, 4);
}

#[test]
fn tunnel_failure_is_not_retried() {
    let h = harness_with(
        FakeDriver::new(DbKind::MySQL),
        FakeTunnelService::new().with_open_error("Authentication failed"),
        ManagerConfig::default(),
    );

    let err = h
        .manager
        .get_connection(&ssh_node(), GetRequest::default())
        .err()
        .expect("tunnel should fail");

    assert!(matches!(err, DbError::TunnelFailed(_)));
    assert_eq!(h.tunnels.stats().opened.len(), 1);
    assert_eq!(h.driver.stats().connect_calls, 0);
    assert_eq!(h.manager.live_count(), 0);
}

#[test]
fn tunneled_connect_uses_local_endpoint_and_removal_closes_tunnel() {
    let h = harness(FakeDriver::new(DbKind::MySQL));
    let node = ssh_node();
    let slot = node.server_identity();

    h.manager
        .get_connection(&node, GetRequest::default())
        .unwrap();

    let stats = h.driver.stats();
    let connected = &stats.connected_nodes[0];
    assert_eq!(connected.host, "127.0.0.1");
    assert_eq!(Some(connected.port), h.tunnels.local_port(&slot));
    assert!(!connected.uses_ssh());

    h.manager.remove_connection(&slot);

    let tunnel_stats = h.tunnels.stats();
    assert_eq!(tunnel_stats.closed, vec![slot]);
    assert_eq!(tunnel_stats.open_tunnels, 0);
}

#[test]
fn failed_connect_through_tunnel_closes_it_each_attempt() {
    let h = harness(FakeDriver::new(DbKind::MySQL).with_connect_error("Connection refused"));

    assert!(h.manager.get_connection(&ssh_node(), GetRequest::default()).is_err());

    let stats = h.tunnels.stats();
    assert_eq!(stats.opened.len(), 2);
    assert_eq!(stats.closed.len(), 2);
    assert_eq!(stats.open_tunnels, 0);
}

#[test]
fn concurrent_requests_share_one_connect() {
    let h = harness(FakeDriver::new(DbKind::MySQL).with_connect_delay(Duration::from_millis(50)));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = h.manager.clone();
            thread::spawn(move || manager.get_connection(&mysql_node_on("shop"), GetRequest::default()))
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread panicked").expect("connect");
    }

    assert_eq!(h.driver.stats().connect_calls, 1);
    assert_eq!(h.manager.live_count(), 1);
}

#[test]
fn concurrent_requests_for_sibling_databases_share_one_slot() {
    let h = harness(FakeDriver::new(DbKind::MySQL).with_connect_delay(Duration::from_millis(20)));

    let handles: Vec<_> = ["shop", "crm", "shop", "crm"]
        .into_iter()
        .map(|database| {
            let manager = h.manager.clone();
            thread::spawn(move || manager.get_connection(&mysql_node_on(database), GetRequest::default()))
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread panicked").expect("connect");
    }

    assert_eq!(h.driver.stats().connect_calls, 1);
    assert_eq!(h.manager.live_count(), 1);
}

#[test]
fn pinned_session_gets_its_own_slot() {
    let h = harness(FakeDriver::new(DbKind::MySQL));

    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .unwrap();
    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::pinned("export-1"))
        .unwrap();

    assert_eq!(h.driver.stats().connect_calls, 2);
    assert_eq!(h.manager.live_count(), 2);
    assert!(h.manager.is_live(&ConnectionIdentity::from("export-1")));

    h.manager.remove_connection(&ConnectionIdentity::from("export-1"));
    assert_eq!(h.manager.live_count(), 1);
    assert!(h.manager.is_live(&server()));
}

#[test]
fn removal_clears_cached_subtree() {
    let h = harness(FakeDriver::new(DbKind::MySQL));
    let shop = server().child("shop");
    let views = shop.child("VIEW_GROUP");
    let other = ConnectionIdentity::from("remote_3306_root");

    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .unwrap();
    h.manager.set_cached_children(server(), children(&server(), &["shop"]));
    h.manager.set_cached_children(shop.clone(), Vec::new());
    h.manager.set_cached_children(views.clone(), Vec::new());
    h.manager.set_cached_children(other.clone(), Vec::new());
    h.manager.set_expansion_state(shop.clone(), ExpansionState::Expanded);

    h.manager.remove_connection(&server());

    assert!(h.manager.cached_children(&server()).is_none());
    assert!(h.manager.cached_children(&shop).is_none());
    assert!(h.manager.cached_children(&views).is_none());
    assert_eq!(h.manager.expansion_state(&shop), ExpansionState::Collapsed);
    assert!(h.manager.cached_children(&other).is_some());
    assert_eq!(h.manager.live_count(), 0);
    assert_eq!(h.driver.stats().close_calls, 1);
    assert!(h.refresh.was_notified_for(&server()));
}

#[test]
fn removal_is_idempotent() {
    let h = harness(FakeDriver::new(DbKind::MySQL));

    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .unwrap();
    h.manager.set_cached_children(server(), children(&server(), &["shop"]));
    h.manager.change_active(&mysql_node_on("shop"));

    h.manager.remove_connection(&server());
    h.manager.remove_connection(&server());

    assert_eq!(h.driver.stats().close_calls, 1);
    assert_eq!(h.manager.live_count(), 0);
    assert!(h.manager.cached_children(&server()).is_none());
    assert!(h.manager.active_node().is_none());
}

#[test]
fn removal_without_live_entry_still_clears_cache_and_active_node() {
    let h = harness(FakeDriver::new(DbKind::MySQL));

    h.manager.set_cached_children(server(), children(&server(), &["shop"]));
    h.manager.change_active(&mysql_node_on("shop"));

    h.manager.remove_connection(&server());

    assert!(h.manager.cached_children(&server()).is_none());
    assert!(h.manager.active_node().is_none());
    assert_eq!(h.driver.stats().close_calls, 0);
}

#[test]
fn removing_another_server_keeps_active_node() {
    let h = harness(FakeDriver::new(DbKind::MySQL));
    h.manager.change_active(&mysql_node_on("shop"));

    h.manager.remove_connection(&ConnectionIdentity::from("remote_3306_root"));

    assert!(h.manager.active_node().is_some());
}

#[test]
fn next_get_after_removal_reconnects() {
    let h = harness(FakeDriver::new(DbKind::MySQL));

    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .unwrap();
    h.manager.remove_connection(&server());
    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .unwrap();

    assert_eq!(h.driver.stats().connect_calls, 2);
    assert!(h.manager.cached_children(&server()).is_none());
}

#[test]
fn close_errors_are_swallowed() {
    let h = harness(FakeDriver::new(DbKind::MySQL).with_close_error("broken pipe"));

    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .unwrap();
    h.manager.remove_connection(&server());

    assert_eq!(h.driver.stats().close_calls, 1);
    assert_eq!(h.manager.live_count(), 0);
}

#[test]
fn change_active_records_intent_without_connecting() {
    let h = harness(FakeDriver::new(DbKind::MySQL));
    let node = mysql_node_on("shop");

    h.manager.change_active(&node);

    assert_eq!(h.driver.stats().connect_calls, 0);
    assert_eq!(
        h.manager.active_node().map(|n| n.identity(None)),
        Some(node.identity(None))
    );
    assert!(h.refresh.was_notified_for(&node.identity(None)));
}

#[test]
fn ambient_request_without_any_target() {
    let h = harness(FakeDriver::new(DbKind::MySQL));

    assert!(h.manager.get_last_connection_option(false).unwrap().is_none());
    assert!(matches!(
        h.manager.get_last_connection_option(true),
        Err(DbError::NoActiveConnection)
    ));
}

#[test]
fn ambient_request_falls_back_to_active_node() {
    let h = harness(FakeDriver::new(DbKind::MySQL));
    h.manager.change_active(&mysql_node_on("crm"));

    let node = h.manager.get_last_connection_option(true).unwrap().unwrap();
    assert_eq!(node.database.as_deref(), Some("crm"));
}

#[test]
fn focused_query_file_resolves_database_with_underscores() {
    let h = harness(FakeDriver::new(DbKind::MySQL));
    h.manager
        .get_connection(&mysql_node(), GetRequest::default())
        .unwrap();

    h.document.focus(Some("mysql_localhost_3306_root_my_db.sql"));
    let node = h.manager.get_last_connection_option(true).unwrap().unwrap();
    assert_eq!(node.host, "localhost");
    assert_eq!(node.port, 3306);
    assert_eq!(node.user, "root");
    assert_eq!(node.database.as_deref(), Some("my_db"));

    h.document.focus(Some("mysql_localhost_3306_root_my_db_name"));
    let node = h.manager.get_last_connection_option(true).unwrap().unwrap();
    assert_eq!(node.database.as_deref(), Some("my_db_name"));
}

#[test]
fn focused_query_file_wins_over_active_node() {
    let h = harness(FakeDriver::new(DbKind::MySQL));
    h.manager.change_active(&mysql_node_on("crm"));
    h.document.focus(Some("mysql_localhost_3306_root_shop.sql"));

    let node = h.manager.get_last_connection_option(true).unwrap().unwrap();
    assert_eq!(node.database.as_deref(), Some("shop"));

    let node = h.manager.get_last_connection_option(false).unwrap().unwrap();
    assert_eq!(node.database.as_deref(), Some("crm"));
}

#[test]
fn focused_file_for_unknown_server_is_ignored() {
    let h = harness(FakeDriver::new(DbKind::MySQL));
    h.document.focus(Some("mysql_elsewhere_3306_root_shop.sql"));

    assert!(matches!(
        h.manager.get_last_connection_option(true),
        Err(DbError::NoActiveConnection)
    ));
}

#[test]
fn query_file_marker_limits_which_documents_count() {
    let config = ManagerConfig {
        query_file_marker: Some(".queries".to_string()),
        ..ManagerConfig::default()
    };
    let h = harness_with(FakeDriver::new(DbKind::MySQL), FakeTunnelService::new(), config);
    h.manager
        .get_connection(&mysql_node(), GetRequest::default())
        .unwrap();

    h.document.focus(Some("/home/me/notes/mysql_localhost_3306_root_shop.sql"));
    assert!(h.manager.get_last_connection_option(true).is_err());

    h.document.focus(Some("/home/me/.queries/mysql_localhost_3306_root_shop.sql"));
    let node = h.manager.get_last_connection_option(true).unwrap().unwrap();
    assert_eq!(node.database.as_deref(), Some("shop"));
}

#[test]
fn close_all_tears_everything_down_and_is_idempotent() {
    let h = harness(FakeDriver::new(DbKind::MySQL));

    h.manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .unwrap();
    h.manager
        .get_connection(&ssh_node(), GetRequest::default())
        .unwrap();
    h.manager.change_active(&mysql_node_on("shop"));
    h.manager.set_cached_children(server(), children(&server(), &["shop"]));

    h.manager.close_all();
    h.manager.close_all();

    assert_eq!(h.manager.live_count(), 0);
    assert_eq!(h.driver.stats().close_calls, 2);
    assert_eq!(h.tunnels.stats().open_tunnels, 0);
    assert!(h.manager.active_node().is_none());
    assert!(h.manager.cached_children(&server()).is_none());
}

#[test]
fn expansion_state_defaults_to_configured_value() {
    let config = ManagerConfig {
        default_expansion: ExpansionState::Expanded,
        ..ManagerConfig::default()
    };
    let h = harness_with(FakeDriver::new(DbKind::MySQL), FakeTunnelService::new(), config);

    assert_eq!(h.manager.expansion_state(&server()), ExpansionState::Expanded);
    h.manager.set_expansion_state(server(), ExpansionState::Collapsed);
    assert_eq!(h.manager.expansion_state(&server()), ExpansionState::Collapsed);
}

#[test]
fn unknown_engine_is_not_retried() {
    let h = harness(FakeDriver::new(DbKind::MySQL));
    let node = dbharbor_core::ConnectionNode::new(DbKind::Postgres, "localhost", 5432, "postgres");

    let err = h
        .manager
        .get_connection(&node, GetRequest::default())
        .err()
        .expect("no driver registered");

    assert!(matches!(err, DbError::NotSupported(_)));
    assert_eq!(h.driver.stats().connect_calls, 0);
}

/// Refresh sink that reconnects the server it is told about, like a tree
/// that re-expands a node as soon as it is invalidated.
#[derive(Default)]
struct ReconnectingRefresh {
    manager: OnceLock<Weak<ConnectionManager>>,
    reconnects: AtomicUsize,
}

impl TreeRefresh for ReconnectingRefresh {
    fn refresh(&self, identity: Option<&ConnectionIdentity>) {
        if identity.is_none() {
            return;
        }

        if let Some(manager) = self.manager.get().and_then(Weak::upgrade) {
            manager
                .get_connection(&mysql_node(), GetRequest::default())
                .expect("reconnect from refresh sink");
            self.reconnects.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[test]
fn refresh_sink_may_reconnect_the_removed_slot() {
    let driver = FakeDriver::new(DbKind::MySQL);
    let refresh = Arc::new(ReconnectingRefresh::default());
    let manager = Arc::new(
        ConnectionManager::new(ManagerConfig::default())
            .with_driver(driver.clone().as_driver_arc())
            .with_tree_refresh(refresh.clone()),
    );
    refresh
        .manager
        .set(Arc::downgrade(&manager))
        .expect("sink wired once");

    manager
        .get_connection(&mysql_node(), GetRequest::default())
        .unwrap();

    let (done_tx, done_rx) = mpsc::channel();
    let remover = manager.clone();
    thread::spawn(move || {
        remover.remove_connection(&server());
        let _ = done_tx.send(());
    });

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("remove_connection returned while the sink reconnected");

    assert_eq!(refresh.reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(driver.stats().connect_calls, 2);
    assert!(manager.is_live(&server()));
}

#[test]
fn removing_a_pinned_session_releases_its_gate() {
    let h = harness(FakeDriver::new(DbKind::MySQL));
    let session = ConnectionIdentity::from("scratch-1");

    h.manager
        .get_connection(&mysql_node(), GetRequest::pinned("scratch-1"))
        .unwrap();
    assert_eq!(h.manager.gate_count(), 1);

    h.manager.remove_connection(&session);

    assert!(!h.manager.is_live(&session));
    assert_eq!(h.manager.gate_count(), 0);
}

#[test]
fn close_all_releases_every_gate() {
    let h = harness(FakeDriver::new(DbKind::MySQL));

    h.manager
        .get_connection(&mysql_node(), GetRequest::default())
        .unwrap();
    h.manager
        .get_connection(&mysql_node(), GetRequest::pinned("report-run"))
        .unwrap();
    assert_eq!(h.manager.gate_count(), 2);

    h.manager.close_all();

    assert_eq!(h.manager.live_count(), 0);
    assert_eq!(h.manager.gate_count(), 0);
}

#[test]
fn database_switched_by_a_request_is_re_pointed_back() {
    let h = harness(FakeDriver::new(DbKind::MySQL));

    let connection = h
        .manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .unwrap();
    connection
        .execute(&QueryRequest::new("SELECT 1").with_database(Some("crm".to_string())))
        .unwrap();

    let again = h
        .manager
        .get_connection(&mysql_node_on("shop"), GetRequest::default())
        .unwrap();

    assert!(Arc::ptr_eq(&connection, &again));
    let stats = h.driver.stats();
    assert_eq!(stats.connect_calls, 1);
    assert_eq!(stats.executed_sql().last().copied(), Some("USE `shop`"));
    assert_eq!(h.manager.live_database(&server()).as_deref(), Some("shop"));
    assert_eq!(again.current_database().as_deref(), Some("shop"));
}
