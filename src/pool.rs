//! Fixed pools of request slots and payload buffers.
//!
//! Both pools are arrays allocated once at construction. Free slots and active
//! requests are kept in singly linked lists threaded through the arrays by index,
//! so that acquiring and releasing never allocates.

use bytes::BytesMut;
use std::{
    io::{Error, ErrorKind, Result},
    time::Duration,
};
use tokio::time::Instant;

use crate::request::{try_alloc, RequestData, RequestId, State, Storage, INVALID_REQUEST_ID};

/// Request slot.
#[derive(Debug)]
pub(crate) struct Slot {
    pub id: RequestId,
    pub state: State,
    /// `None` while the slot is free or the record is held by the worker.
    pub data: Option<RequestData>,
    next: Option<usize>,
}

#[derive(Debug)]
struct BufferSlot {
    /// `None` while the buffer is owned by a request.
    buf: Option<BytesMut>,
    next: Option<usize>,
}

#[derive(Debug)]
pub(crate) struct Pools {
    slots: Vec<Slot>,
    buffers: Vec<BufferSlot>,
    buffer_size: usize,
    free_req: Option<usize>,
    active_req: Option<usize>,
    free_buf: Option<usize>,
    active: usize,
    free_buffers: usize,
    last_id: RequestId,
}

fn alloc_error(what: &str) -> Error {
    Error::new(ErrorKind::OutOfMemory, format!("cannot allocate {what}"))
}

impl Pools {
    /// Allocates `pool_size` request slots and `buffer_count` buffers of `buffer_size` bytes.
    pub fn new(pool_size: usize, buffer_count: usize, buffer_size: usize) -> Result<Self> {
        let mut slots = Vec::new();
        slots.try_reserve_exact(pool_size).map_err(|_| alloc_error("request pool"))?;
        slots.extend((0..pool_size).map(|i| Slot {
            id: INVALID_REQUEST_ID,
            state: State::Pending,
            data: None,
            next: (i + 1 < pool_size).then_some(i + 1),
        }));

        let mut buffers = Vec::new();
        buffers.try_reserve_exact(buffer_count).map_err(|_| alloc_error("buffer pool"))?;
        for i in 0..buffer_count {
            let buf = try_alloc(buffer_size).map_err(|_| alloc_error("pool buffer"))?;
            buffers.push(BufferSlot { buf: Some(buf), next: (i + 1 < buffer_count).then_some(i + 1) });
        }

        Ok(Self {
            slots,
            buffers,
            buffer_size,
            free_req: (pool_size > 0).then_some(0),
            active_req: None,
            free_buf: (buffer_count > 0).then_some(0),
            active: 0,
            free_buffers: buffer_count,
            last_id: INVALID_REQUEST_ID,
        })
    }

    /// Size of a pool buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Number of request slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of active requests.
    pub fn active_count(&self) -> usize {
        self.active
    }

    /// Number of free request slots.
    pub fn free_count(&self) -> usize {
        self.slots.len() - self.active
    }

    /// Number of free pool buffers.
    pub fn free_buffer_count(&self) -> usize {
        self.free_buffers
    }

    /// Takes a slot from the free list.
    ///
    /// The slot must be passed to either [`activate`](Self::activate) or
    /// [`unacquire`](Self::unacquire).
    pub fn acquire_request(&mut self) -> Option<usize> {
        let slot = self.free_req?;
        self.free_req = self.slots[slot].next.take();
        Some(slot)
    }

    /// Returns an acquired slot that was never activated to the free list.
    pub fn unacquire(&mut self, slot: usize) {
        self.slots[slot].next = self.free_req;
        self.free_req = Some(slot);
    }

    /// Links an acquired slot into the active list.
    pub fn activate(&mut self, slot: usize, id: RequestId, state: State, data: Option<RequestData>) {
        let s = &mut self.slots[slot];
        s.id = id;
        s.state = state;
        s.data = data;
        s.next = self.active_req;
        self.active_req = Some(slot);
        self.active += 1;
    }

    /// Allocates the next request id.
    ///
    /// Ids increase monotonically and wrap, skipping the invalid id
    /// and ids of active requests.
    pub fn next_id(&mut self) -> RequestId {
        loop {
            self.last_id = self.last_id.wrapping_add(1);
            if self.last_id != INVALID_REQUEST_ID && self.find(self.last_id).is_none() {
                return self.last_id;
            }
        }
    }

    /// Finds the slot of the active request with the given id.
    pub fn find(&self, id: RequestId) -> Option<usize> {
        if id == INVALID_REQUEST_ID {
            return None;
        }
        self.active_slots().find(|&slot| self.slots[slot].id == id)
    }

    fn active_slots(&self) -> impl Iterator<Item = usize> + '_ {
        std::iter::successors(self.active_req, |&slot| self.slots[slot].next)
    }

    pub fn slot(&self, slot: usize) -> &Slot {
        &self.slots[slot]
    }

    pub fn slot_mut(&mut self, slot: usize) -> &mut Slot {
        &mut self.slots[slot]
    }

    /// Takes a buffer from the free list.
    pub fn acquire_buffer(&mut self) -> Option<Storage> {
        let index = self.free_buf?;
        let slot = &mut self.buffers[index];
        let buf = slot.buf.take()?;
        self.free_buf = slot.next.take();
        self.free_buffers -= 1;
        Some(Storage::Pool { index, buf })
    }

    /// Returns pool buffers to the free list.
    ///
    /// Individually allocated storage is handed back to the caller for disposal.
    pub fn release_storage(&mut self, storage: Storage) -> Option<BytesMut> {
        match storage {
            Storage::None => None,
            Storage::Heap(buf) => Some(buf),
            Storage::Pool { index, buf } => {
                let slot = &mut self.buffers[index];
                debug_assert!(slot.buf.is_none(), "pool buffer {index} released twice");
                slot.buf = Some(buf);
                slot.next = self.free_buf;
                self.free_buf = Some(index);
                self.free_buffers += 1;
                None
            }
        }
    }

    /// Unlinks an active request and returns its slot and pool buffers to the free lists.
    ///
    /// Returns the request record, if the slot held one, with its pool buffers removed.
    pub fn release(&mut self, slot: usize) -> Option<RequestData> {
        let next = self.slots[slot].next.take();
        if self.active_req == Some(slot) {
            self.active_req = next;
        } else {
            let prev = self.active_slots().find(|&s| self.slots[s].next == Some(slot))?;
            self.slots[prev].next = next;
        }
        self.active -= 1;

        let s = &mut self.slots[slot];
        s.id = INVALID_REQUEST_ID;
        s.next = self.free_req;
        self.free_req = Some(slot);

        let mut data = s.data.take()?;
        let request = std::mem::take(&mut data.request);
        let reply = std::mem::take(&mut data.reply);
        data.request = self.release_storage(request).map(Storage::Heap).unwrap_or_default();
        data.reply = self.release_storage(reply).map(Storage::Heap).unwrap_or_default();
        Some(data)
    }

    /// Releases the next request that is idle on the interrupt side and older than `timeout`.
    ///
    /// Requests held by the worker are never released. The returned record may still own
    /// individually allocated storage, which the caller frees outside of the critical section.
    pub fn reap_next(&mut self, now: Instant, timeout: Duration) -> Option<RequestData> {
        let slot = self.active_slots().find(|&slot| {
            let s = &self.slots[slot];
            matches!(s.state, State::Receiving | State::Done)
                && s.data.as_ref().is_some_and(|data| now.saturating_duration_since(data.created_at) >= timeout)
        })?;

        tracing::debug!("releasing expired request {}", self.slots[slot].id);
        self.release(slot)
    }
}
