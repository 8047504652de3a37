//! # Packet Store
//!
//! Fixed-capacity arena of packet descriptors. Each descriptor owns a header,
//! the ingress tag and a reference to a shared payload buffer. Multicast
//! fan-out clones the descriptor; clones share the buffer and are released
//! independently. The buffer goes back to the arena when the last descriptor
//! referencing it is released.
//!
//! Handles carry a generation so a handle that outlives its slot cannot
//! release whatever packet reuses that slot.

use bytes::{Bytes, BytesMut};
use slab::Slab;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Resource, Result, RouterError};
use crate::ids::LinkId;
use crate::wire::{Packet, PacketHeader};

// ─── Handle ──────────────────────────────────────────────────────────────────

/// Opaque reference to a packet descriptor in a [`PacketStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketHandle {
    key: u32,
    gen: u32,
}

// ─── Arena ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Descriptor {
    gen: u32,
    header: PacketHeader,
    ingress: Option<LinkId>,
    buffer: usize,
}

#[derive(Debug)]
struct Buffer {
    payload: Bytes,
    refs: u32,
}

struct Arena {
    descriptors: Slab<Descriptor>,
    buffers: Slab<Buffer>,
    next_gen: u32,
}

impl Arena {
    fn descriptor(&self, handle: PacketHandle) -> Result<&Descriptor> {
        match self.descriptors.get(handle.key as usize) {
            Some(d) if d.gen == handle.gen => Ok(d),
            _ => Err(RouterError::InvalidHandle),
        }
    }

    fn insert(&mut self, header: PacketHeader, ingress: Option<LinkId>, buffer: usize) -> PacketHandle {
        let gen = self.next_gen;
        self.next_gen = self.next_gen.wrapping_add(1);
        let key = self.descriptors.insert(Descriptor {
            gen,
            header,
            ingress,
            buffer,
        });
        PacketHandle {
            key: key as u32,
            gen,
        }
    }
}

/// Thread-safe packet store with a hard descriptor limit.
pub struct PacketStore {
    arena: Mutex<Arena>,
    capacity: usize,
}

impl PacketStore {
    pub fn new(capacity: usize) -> Self {
        PacketStore {
            arena: Mutex::new(Arena {
                descriptors: Slab::with_capacity(capacity),
                buffers: Slab::with_capacity(capacity),
                next_gen: 0,
            }),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Arena> {
        self.arena.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a new packet. Fails with `ResourceExhausted(PacketPool)` when
    /// every descriptor is in use.
    pub fn allocate(
        &self,
        header: PacketHeader,
        ingress: Option<LinkId>,
        payload: Bytes,
    ) -> Result<PacketHandle> {
        let mut arena = self.lock();
        if arena.descriptors.len() >= self.capacity {
            return Err(RouterError::ResourceExhausted(Resource::PacketPool));
        }
        let buffer = arena.buffers.insert(Buffer { payload, refs: 1 });
        Ok(arena.insert(header, ingress, buffer))
    }

    /// New descriptor sharing the payload buffer of `handle`.
    pub fn clone_packet(&self, handle: PacketHandle) -> Result<PacketHandle> {
        let mut arena = self.lock();
        if arena.descriptors.len() >= self.capacity {
            return Err(RouterError::ResourceExhausted(Resource::PacketPool));
        }
        let (header, ingress, buffer) = {
            let d = arena.descriptor(handle)?;
            (d.header, d.ingress, d.buffer)
        };
        if let Some(buf) = arena.buffers.get_mut(buffer) {
            buf.refs += 1;
        }
        Ok(arena.insert(header, ingress, buffer))
    }

    /// Release a descriptor. Stale or already-released handles are rejected
    /// without touching the arena.
    pub fn release(&self, handle: PacketHandle) -> Result<()> {
        let mut arena = self.lock();
        arena.descriptor(handle)?;
        let desc = arena.descriptors.remove(handle.key as usize);
        let last = match arena.buffers.get_mut(desc.buffer) {
            Some(buf) => {
                buf.refs -= 1;
                buf.refs == 0
            }
            None => false,
        };
        if last {
            arena.buffers.remove(desc.buffer);
        }
        Ok(())
    }

    pub fn header(&self, handle: PacketHandle) -> Result<PacketHeader> {
        self.lock().descriptor(handle).map(|d| d.header)
    }

    pub fn ingress(&self, handle: PacketHandle) -> Result<Option<LinkId>> {
        self.lock().descriptor(handle).map(|d| d.ingress)
    }

    pub fn payload(&self, handle: PacketHandle) -> Result<Bytes> {
        let arena = self.lock();
        let buffer = arena.descriptor(handle)?.buffer;
        arena
            .buffers
            .get(buffer)
            .map(|b| b.payload.clone())
            .ok_or(RouterError::InvalidHandle)
    }

    /// Header and payload of a stored packet.
    pub fn packet(&self, handle: PacketHandle) -> Result<Packet> {
        let arena = self.lock();
        let desc = arena.descriptor(handle)?;
        let payload = arena
            .buffers
            .get(desc.buffer)
            .map(|b| b.payload.clone())
            .ok_or(RouterError::InvalidHandle)?;
        Ok(Packet::new(desc.header, payload))
    }

    /// Render the packet as a datagram and release the handle.
    pub fn take_datagram(&self, handle: PacketHandle) -> Result<BytesMut> {
        let pkt = self.packet(handle)?;
        self.release(handle)?;
        Ok(pkt.encode())
    }

    /// Descriptors currently allocated.
    pub fn in_use(&self) -> usize {
        self.lock().descriptors.len()
    }

    /// Distinct payload buffers currently referenced.
    pub fn buffers_in_use(&self) -> usize {
        self.lock().buffers.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for PacketStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketStore")
            .field("in_use", &self.in_use())
            .field("capacity", &self.capacity)
            .finish()
    }
}
