#![allow(clippy::result_large_err)]

pub mod containers;
pub mod fake_driver;
pub mod fake_tunnel;
pub mod fixtures;
pub mod observers;

pub use fake_driver::{FakeConnection, FakeDriver, FakeDriverStats, FakeQueryOutcome, FakeSqlDialect};
pub use fake_tunnel::{FakeTunnelService, FakeTunnelStats};
pub use observers::{FixedActiveDocument, RecordingRefresh};
