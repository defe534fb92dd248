use crate::fake_driver::{mutex_lock, rwlock_read, rwlock_write};
use dbharbor_core::{ActiveDocument, ConnectionIdentity, TreeRefresh};
use std::sync::{Arc, Mutex, RwLock};

/// `TreeRefresh` sink that records every notification.
#[derive(Clone, Default)]
pub struct RecordingRefresh {
    calls: Arc<Mutex<Vec<Option<ConnectionIdentity>>>>,
}

impl RecordingRefresh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<Option<ConnectionIdentity>> {
        mutex_lock(&self.calls).clone()
    }

    pub fn was_notified_for(&self, identity: &ConnectionIdentity) -> bool {
        mutex_lock(&self.calls)
            .iter()
            .any(|call| call.as_ref() == Some(identity))
    }
}

impl TreeRefresh for RecordingRefresh {
    fn refresh(&self, identity: Option<&ConnectionIdentity>) {
        mutex_lock(&self.calls).push(identity.cloned());
    }
}

/// `ActiveDocument` whose focused document is set by the test.
#[derive(Clone, Default)]
pub struct FixedActiveDocument {
    document: Arc<RwLock<Option<String>>>,
}

impl FixedActiveDocument {
    pub fn new(document: Option<&str>) -> Self {
        Self {
            document: Arc::new(RwLock::new(document.map(str::to_string))),
        }
    }

    pub fn focus(&self, document: Option<&str>) {
        *rwlock_write(&self.document) = document.map(str::to_string);
    }
}

impl ActiveDocument for FixedActiveDocument {
    fn focused_document(&self) -> Option<String> {
        rwlock_read(&self.document).clone()
    }
}
