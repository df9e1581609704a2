//! In-memory destination
//!
//! Objects are reserved in a `DashMap` at creation and only become readable
//! once their sink is finalized.

use super::{Destination, Sink};
use crate::upload::{ObjectIdentity, UploadError};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::io::{self, Write};
use std::sync::Arc;

/// Upper bound for up-front sink allocation
const MAX_PREALLOC: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
enum Slot {
    Reserved,
    Committed(Bytes),
}

/// Destination that keeps objects in memory. Clones share the same store.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    objects: Arc<DashMap<ObjectIdentity, Slot>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object directly, replacing whatever was there
    pub fn insert(&self, identity: ObjectIdentity, content: impl Into<Bytes>) {
        self.objects
            .insert(identity, Slot::Committed(content.into()));
    }

    /// Content of a finalized object
    pub fn get(&self, identity: &ObjectIdentity) -> Option<Bytes> {
        self.objects.get(identity).and_then(|slot| match slot.value() {
            Slot::Committed(content) => Some(content.clone()),
            Slot::Reserved => None,
        })
    }

    /// Whether the identity is taken, finalized or not
    pub fn contains(&self, identity: &ObjectIdentity) -> bool {
        self.objects.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl Destination for MemoryDestination {
    type Sink = MemorySink;

    fn create_exclusive(
        &self,
        identity: &ObjectIdentity,
        size: u64,
    ) -> Result<MemorySink, UploadError> {
        match self.objects.entry(identity.clone()) {
            Entry::Occupied(_) => Err(UploadError::AlreadyExists {
                bucket: identity.bucket.clone(),
                object: identity.object.clone(),
            }),
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Reserved);
                Ok(MemorySink {
                    objects: Arc::clone(&self.objects),
                    identity: identity.clone(),
                    buffer: Vec::with_capacity(size.min(MAX_PREALLOC) as usize),
                })
            }
        }
    }

    fn discard(&self, identity: &ObjectIdentity) -> Result<(), UploadError> {
        self.objects.remove(identity);
        Ok(())
    }
}

/// Sink that commits its buffer on finalize
#[derive(Debug)]
pub struct MemorySink {
    objects: Arc<DashMap<ObjectIdentity, Slot>>,
    identity: ObjectIdentity,
    buffer: Vec<u8>,
}

impl Write for MemorySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Sink for MemorySink {
    fn finalize(self) -> Result<(), UploadError> {
        self.objects
            .insert(self.identity, Slot::Committed(Bytes::from(self.buffer)));
        Ok(())
    }
}
