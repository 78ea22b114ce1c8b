// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Temporary host mappings of guest memory for DMA.
//!
//! RAM is mapped in place. Anything else goes through a single bounce buffer
//! of at most one page; callers that find it busy can queue a callback to be
//! told when it is released.

use crate::address_space::AddressSpace;
use crate::region::MemoryRegion;
use crate::MemorySystem;
use crate::PAGE_SIZE;
use host_mmap::HostMemory;
use std::collections::VecDeque;
use std::sync::Arc;

/// A host mapping returned by [`MemorySystem::map`].
#[must_use]
pub struct Mapping {
    ptr: *mut u8,
    len: u64,
    is_write: bool,
    kind: MappingKind,
}

enum MappingKind {
    Direct {
        ram_addr: u64,
        // Keeps the block's memory alive until unmapped.
        _memory: Arc<dyn HostMemory>,
    },
    Bounce,
}

impl Mapping {
    /// The host address of the mapping. Valid for `len()` bytes until the
    /// mapping is passed to [`MemorySystem::unmap`].
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_write(&self) -> bool {
        self.is_write
    }

    /// Whether the mapping is a copy in the bounce buffer rather than the
    /// guest memory itself.
    pub fn is_bounce(&self) -> bool {
        matches!(self.kind, MappingKind::Bounce)
    }
}

impl std::fmt::Debug for Mapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mapping")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .field("is_write", &self.is_write)
            .field("bounce", &self.is_bounce())
            .finish()
    }
}

struct BounceClaim {
    region: Arc<dyn MemoryRegion>,
    addr: u64,
    buffer: Box<[u8]>,
}

#[derive(Default)]
pub(crate) struct BounceBuffer {
    in_use: bool,
    claim: Option<BounceClaim>,
}

/// Identifies a callback queued with [`MemorySystem::register_map_waiter`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MapWaiterId(u64);

#[derive(Default)]
pub(crate) struct MapWaiters {
    next_id: u64,
    queue: VecDeque<(u64, Box<dyn FnOnce() + Send>)>,
}

impl MemorySystem {
    /// Maps up to `*len` bytes of `space` at `addr` into host memory, updating
    /// `*len` to the length actually mapped.
    ///
    /// Returns `None` if the range is not RAM and the bounce buffer is taken.
    pub fn map(
        &self,
        space: &AddressSpace,
        addr: u64,
        len: &mut u64,
        is_write: bool,
    ) -> Option<Mapping> {
        if *len == 0 {
            return None;
        }
        let t = space.translate(addr, *len, is_write);
        if !t.direct {
            {
                let mut bounce = self.bounce.lock();
                if bounce.in_use {
                    tracing::trace!(
                        address_space = space.name(),
                        addr,
                        "bounce buffer busy"
                    );
                    return None;
                }
                bounce.in_use = true;
            }
            let n = t.len.min(PAGE_SIZE);
            let mut buffer = vec![0; n as usize].into_boxed_slice();
            if !is_write {
                if let Err(err) = space.read(addr, &mut buffer) {
                    tracing::trace!(
                        address_space = space.name(),
                        addr,
                        error = &err as &dyn std::error::Error,
                        "bounce buffer fill failed"
                    );
                }
            }
            let ptr = buffer.as_mut_ptr();
            self.bounce.lock().claim = Some(BounceClaim {
                region: t.region,
                addr,
                buffer,
            });
            *len = n;
            return Some(Mapping {
                ptr,
                len: n,
                is_write,
                kind: MappingKind::Bounce,
            });
        }

        // Extend over following sections that continue the same region.
        let mut done = t.len;
        while done < *len {
            let next = space.translate(addr.wrapping_add(done), *len - done, is_write);
            if !Arc::ptr_eq(&next.region, &t.region) || next.offset != t.offset + done {
                break;
            }
            done += next.len;
        }
        let ram_addr = t.region.ram_addr()? + t.offset;
        let chunk = self.ram.host_chunk(ram_addr, done);
        *len = chunk.len() as u64;
        Some(Mapping {
            ptr: chunk.ptr(),
            len: *len,
            is_write,
            kind: MappingKind::Direct {
                ram_addr,
                _memory: chunk.into_memory(),
            },
        })
    }

    /// Releases a mapping after `access_len` bytes of it were used.
    ///
    /// Written bounce data is copied back to the guest, and any queued map
    /// waiters are called.
    pub fn unmap(&self, space: &AddressSpace, mapping: Mapping, access_len: u64) {
        let access_len = access_len.min(mapping.len);
        match mapping.kind {
            MappingKind::Direct { ram_addr, .. } => {
                if !mapping.is_write {
                    return;
                }
                // The block may have been freed, and its RAM addresses reused,
                // while mapped.
                if self.ram.ram_addr_from_host(mapping.ptr) == Some(ram_addr) {
                    self.ram.mark_written(ram_addr, access_len);
                } else {
                    tracing::debug!(ram_addr, "ram block freed while mapped");
                }
            }
            MappingKind::Bounce => {
                let claim = self.bounce.lock().claim.take();
                let Some(claim) = claim else {
                    panic!("bounce buffer released twice");
                };
                if mapping.is_write {
                    let data = &claim.buffer[..access_len as usize];
                    if let Err(err) = space.write(claim.addr, data) {
                        tracing::trace!(
                            address_space = space.name(),
                            region = claim.region.name(),
                            addr = claim.addr,
                            error = &err as &dyn std::error::Error,
                            "bounce buffer flush failed"
                        );
                    }
                }
                drop(claim);
                self.bounce.lock().in_use = false;
                self.notify_map_waiters();
            }
        }
    }

    /// Queues `f` to be called once, the next time the bounce buffer is
    /// released.
    pub fn register_map_waiter(&self, f: impl FnOnce() + Send + 'static) -> MapWaiterId {
        let mut waiters = self.waiters.lock();
        let id = waiters.next_id;
        waiters.next_id += 1;
        waiters.queue.push_back((id, Box::new(f)));
        MapWaiterId(id)
    }

    /// Removes a queued callback. Returns false if it already ran or was
    /// removed.
    pub fn unregister_map_waiter(&self, id: MapWaiterId) -> bool {
        let mut waiters = self.waiters.lock();
        let Some(index) = waiters.queue.iter().position(|(i, _)| *i == id.0) else {
            return false;
        };
        waiters.queue.remove(index);
        true
    }

    fn notify_map_waiters(&self) {
        let queue = std::mem::take(&mut self.waiters.lock().queue);
        if !queue.is_empty() {
            tracing::trace!(count = queue.len(), "waking map waiters");
        }
        for (_, f) in queue {
            f();
        }
    }
}
