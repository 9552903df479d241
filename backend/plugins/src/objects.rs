//! Bookkeeping of proxies created on behalf of one plugin.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use crate::remote::{RemoteBlob, RemoteRowsFormatter, RemoteRowsIterator, RemoteRowsOutput};

/// A tracked proxy.
#[derive(Clone)]
pub enum RemoteObject {
    RowsIterator(Arc<RemoteRowsIterator>),
    RowsOutput(Arc<RemoteRowsOutput>),
    RowsFormatter(Arc<RemoteRowsFormatter>),
    Blob(Arc<RemoteBlob>),
}

impl RemoteObject {
    pub fn handle(&self) -> i32 {
        match self {
            RemoteObject::RowsIterator(o) => o.handle(),
            RemoteObject::RowsOutput(o) => o.handle(),
            RemoteObject::RowsFormatter(o) => o.handle(),
            RemoteObject::Blob(o) => o.handle(),
        }
    }

    /// Make the proxy refuse further calls.
    pub fn dispose(&self) {
        match self {
            RemoteObject::RowsIterator(o) => o.dispose(),
            RemoteObject::RowsOutput(o) => o.dispose(),
            RemoteObject::RowsFormatter(o) => o.dispose(),
            RemoteObject::Blob(o) => o.dispose(),
        }
    }
}

/// Handle → proxy map owned by a plugin context.
#[derive(Default)]
pub struct ObjectStorage {
    objects: Mutex<HashMap<i32, RemoteObject>>,
}

impl ObjectStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `object`. A proxy already stored under the same handle is
    /// replaced, since the plugin reuses handles only after closing them.
    pub fn add(&self, handle: i32, object: RemoteObject) {
        let previous = self
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle, object);
        if let Some(previous) = previous {
            previous.dispose();
        }
    }

    pub fn get(&self, handle: i32) -> Option<RemoteObject> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&handle)
            .cloned()
    }

    pub fn remove(&self, handle: i32) -> Option<RemoteObject> {
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispose and forget every tracked proxy. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let drained: Vec<RemoteObject> = self
            .objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, object)| object)
            .collect();
        for object in &drained {
            object.dispose();
        }
        drained.len()
    }
}
