//! Named, reference-tracked shared-memory segments and their mapping
//! cache (spec §3 `SharedMemorySegment`/`SharedMemoryHandle`/
//! `MappingEntry`, §4.3). The bridge is in-process and same-host, so a
//! "segment" here is a fixed-capacity byte arena rather than a literal
//! OS shared-memory object — the registry's invariants (owner-only
//! destroy, reference-tracked mapping, offset/size bounds) are exactly
//! the ones spec.md describes regardless of backing storage.
//!
//! Every registry mutation is expected to happen with the caller
//! already holding the bridge's worker-runtime lock (spec §4.3
//! Concurrency); this crate does not take its own lock beyond what is
//! needed to keep the registry's internal `HashMap` consistent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A segment must hold at least one byte (spec §3 invariant 1).
pub const MIN_SEGMENT_SIZE: usize = 1;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ShmError {
    #[error("shared memory segment size must be at least {MIN_SEGMENT_SIZE} byte(s)")]
    ZeroSizedSegment,
    #[error("shared memory segment '{0}' not found")]
    NotFound(String),
    #[error("shared memory handle out of bounds for segment '{name}' (size {size}, requested offset {offset} len {len})")]
    OutOfBounds {
        name: String,
        size: usize,
        offset: usize,
        len: usize,
    },
    #[error("cannot destroy segment '{name}': {refcount} live mapping(s) remain")]
    LiveMappings { name: String, refcount: usize },
    #[error("shared memory segment '{0}' is not currently mapped")]
    NotMapped(String),
}

/// Opaque handle consumed by the ABI: `(name, offset, size)`. Not
/// owning — multiple handles may alias the same segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMemoryHandle {
    pub name: String,
    pub offset: usize,
    pub size: usize,
}

impl SharedMemoryHandle {
    /// A handle spanning the whole of a freshly created segment.
    fn whole(name: String, size: usize) -> Self {
        SharedMemoryHandle { name, offset: 0, size }
    }
}

/// Registry-internal view of a mapped segment's reference count, for
/// introspection and tests (spec §3 `MappingEntry`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingEntry {
    pub refcount: usize,
}

struct Segment {
    size: usize,
    creator_identity: String,
    data: Vec<u8>,
    map_refcount: usize,
}

/// The process-global shared-memory registry. One instance lives inside
/// the bridge's singleton state (spec §9 "global mutable state"),
/// created at `initialize` and cleared at `shutdown`.
pub struct Registry {
    segments: Mutex<HashMap<String, Segment>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            segments: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Allocate a uniquely-named segment of at least `size` bytes,
    /// tagged with `creator_identity` (the runtime that asked for it).
    pub fn create(&self, size: usize, creator_identity: &str) -> Result<SharedMemoryHandle, ShmError> {
        if size < MIN_SEGMENT_SIZE {
            return Err(ShmError::ZeroSizedSegment);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("bridge-shm-{id:016x}");

        let mut segments = self.segments.lock().unwrap();
        segments.insert(
            name.clone(),
            Segment {
                size,
                creator_identity: creator_identity.to_string(),
                data: vec![0u8; size],
                map_refcount: 0,
            },
        );
        tracing::debug!(name, size, creator_identity, "created shared memory segment");

        Ok(SharedMemoryHandle::whole(name, size))
    }

    /// Destroy the segment named by `handle`. Fails with
    /// `LiveMappings` if any mapping is outstanding — callers MUST
    /// unmap first (spec §3 invariant 3, §9 Open Question resolution:
    /// mappings pin segments).
    pub fn destroy(&self, handle: &SharedMemoryHandle) -> Result<(), ShmError> {
        let mut segments = self.segments.lock().unwrap();
        match segments.get(&handle.name) {
            None => Err(ShmError::NotFound(handle.name.clone())),
            Some(seg) if seg.map_refcount > 0 => Err(ShmError::LiveMappings {
                name: handle.name.clone(),
                refcount: seg.map_refcount,
            }),
            Some(_) => {
                segments.remove(&handle.name);
                tracing::debug!(name = %handle.name, "destroyed shared memory segment");
                Ok(())
            }
        }
    }

    /// Map `handle` and return a raw pointer to `base + handle.offset`.
    /// Repeated maps of the same name return a pointer into the same
    /// backing allocation (the registry never reallocates a live
    /// segment), incrementing its mapping refcount.
    ///
    /// # Safety
    /// The returned pointer is valid for `handle.size` bytes until a
    /// matching `unmap` followed by `destroy` removes the segment. The
    /// caller must not dereference it afterward.
    pub fn map(&self, handle: &SharedMemoryHandle) -> Result<*mut u8, ShmError> {
        let mut segments = self.segments.lock().unwrap();
        let seg = segments
            .get_mut(&handle.name)
            .ok_or_else(|| ShmError::NotFound(handle.name.clone()))?;

        if handle.offset.checked_add(handle.size).map_or(true, |end| end > seg.size) {
            return Err(ShmError::OutOfBounds {
                name: handle.name.clone(),
                size: seg.size,
                offset: handle.offset,
                len: handle.size,
            });
        }

        seg.map_refcount += 1;
        let ptr = unsafe { seg.data.as_mut_ptr().add(handle.offset) };
        tracing::trace!(name = %handle.name, refcount = seg.map_refcount, "mapped shared memory segment");
        Ok(ptr)
    }

    /// Release one reference to a mapping previously returned by `map`.
    pub fn unmap(&self, handle: &SharedMemoryHandle) -> Result<(), ShmError> {
        let mut segments = self.segments.lock().unwrap();
        let seg = segments
            .get_mut(&handle.name)
            .ok_or_else(|| ShmError::NotFound(handle.name.clone()))?;

        if seg.map_refcount == 0 {
            return Err(ShmError::NotMapped(handle.name.clone()));
        }
        seg.map_refcount -= 1;
        tracing::trace!(name = %handle.name, refcount = seg.map_refcount, "unmapped shared memory segment");
        Ok(())
    }

    /// Introspect a segment's current mapping state, for tests and
    /// `bridge_status`.
    pub fn mapping_entry(&self, name: &str) -> Option<MappingEntry> {
        let segments = self.segments.lock().unwrap();
        segments.get(name).map(|seg| MappingEntry {
            refcount: seg.map_refcount,
        })
    }

    /// Identity of the runtime that created `name`, if it still exists.
    pub fn creator_of(&self, name: &str) -> Option<String> {
        let segments = self.segments.lock().unwrap();
        segments.get(name).map(|seg| seg.creator_identity.clone())
    }

    /// Number of segments currently tracked, for `bridge_status`.
    pub fn segment_count(&self) -> usize {
        self.segments.lock().unwrap().len()
    }

    /// Drop every tracked segment regardless of outstanding mappings.
    /// Called once from `bridge_shutdown` (spec §4.2): the worker
    /// runtime is going away with it, so any still-mapped pointers are
    /// about to be invalid anyway.
    pub fn clear(&self) {
        let mut segments = self.segments.lock().unwrap();
        if !segments.is_empty() {
            tracing::debug!(count = segments.len(), "clearing shared memory registry on shutdown");
        }
        segments.clear();
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
