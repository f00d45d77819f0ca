//! Asynchronous transfer queues
//!
//! Every endpoint owns a fixed pool of [`Transfer`]s. A transfer is either
//! on the endpoint's free list, or on its active list, a FIFO of
//! descriptors that the controller works through in order. Scheduling a
//! transfer takes one from the free list, describes the caller's buffer,
//! and links it behind the active list's tail. When the controller signals
//! completion, [`EndpointQueues::transfer_complete`] retires finished
//! transfers from the head, runs their completion callbacks, and returns
//! them to the free list.
//!
//! The free list is lock-free, so transfers can be allocated from task and
//! interrupt context alike. Linking into the active list, and telling the
//! controller about it, happens inside a short critical section.

#![allow(clippy::declare_interior_mutable_const)] // Usage is legit in this module.

use core::{
    cell::{Cell, UnsafeCell},
    ptr,
    sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering},
};

use critical_section::Mutex;
use usb_device::{endpoint::EndpointAddress, UsbDirection};

use crate::{
    clock::Clock,
    td::{Status, Td, MAX_TRANSFER},
    Error, Result,
};

/// How long [`schedule_block`](EndpointQueues::schedule_block) retries, in microseconds
pub const DEFAULT_TIMEOUT_US: u32 = 1_000_000;

/// Endpoints per direction that the table tracks
pub const MAX_ENDPOINTS: usize = crate::ral::usb0::ENDPOINTS;

/// One queue per endpoint, per direction
const QUEUE_COUNT: usize = MAX_ENDPOINTS * 2;

/// Marks the end of a list
const NONE: u8 = u8::MAX;

/// Produces an index into the queue table
pub(crate) fn index(addr: EndpointAddress) -> usize {
    (addr.index() * 2) + (UsbDirection::In == addr.direction()) as usize
}

/// The hardware side of a transfer queue
///
/// The queue calls these methods from inside a critical section, right
/// after it updated its own lists.
pub trait EndpointHardware: Clock {
    /// Start the endpoint on `first`; the endpoint had no queued work
    fn prime(&self, endpoint: EndpointAddress, first: &Td);
    /// `next` was linked behind the tail of a running endpoint
    ///
    /// The implementation must restart the endpoint if the controller
    /// already retired the old tail.
    fn append(&self, endpoint: EndpointAddress, next: &Td);
    /// Drop everything the controller has primed on the endpoint
    fn flush(&self, endpoint: EndpointAddress);
    /// Stall the endpoint
    fn stall(&self, endpoint: EndpointAddress);
}

/// Invoked when a transfer retires
///
/// `callback` receives `user_data` and the number of bytes that were
/// actually transferred.
#[derive(Clone, Copy)]
pub struct Completion {
    pub callback: fn(usize, usize),
    pub user_data: usize,
}

/// What the owner of a transfer recorded when scheduling it
struct Request {
    data: *mut u8,
    maximum_length: usize,
    completion: Option<Completion>,
}

/// A hardware transfer descriptor, plus its bookkeeping
#[repr(C, align(32))]
pub struct Transfer {
    td: Td,
    next: AtomicU8,
    request: UnsafeCell<Request>,
}

// Safety: a transfer's request is only touched by whoever took the
// transfer off the free list. The descriptor is volatile memory shared with
// the controller, and the link is atomic.
unsafe impl Sync for Transfer {}

impl Transfer {
    const fn new() -> Self {
        Transfer {
            td: Td::new(),
            next: AtomicU8::new(NONE),
            request: UnsafeCell::new(Request {
                data: ptr::null_mut(),
                maximum_length: 0,
                completion: None,
            }),
        }
    }
}

/// Storage for one endpoint's transfers
///
/// Allocate a `static` pool for each endpoint queue. A pool can back a
/// single queue; `N` must be less than 255.
///
/// ```
/// use great_usbd::queue::TransferPool;
///
/// static EP0_OUT_TRANSFERS: TransferPool<4> = TransferPool::new();
/// ```
pub struct TransferPool<const N: usize> {
    transfers: [Transfer; N],
    taken: AtomicBool,
}

impl<const N: usize> TransferPool<N> {
    const FITS: () = assert!(N < NONE as usize, "transfer pools hold at most 254 transfers");

    pub const fn new() -> Self {
        #[allow(clippy::let_unit_value)]
        let () = Self::FITS;
        const TRANSFER: Transfer = Transfer::new();
        TransferPool {
            transfers: [TRANSFER; N],
            taken: AtomicBool::new(false),
        }
    }

    fn take(&self) -> Option<&[Transfer]> {
        (!self.taken.swap(true, Ordering::SeqCst)).then_some(&self.transfers[..])
    }
}

/// A transfer taken from the free list
///
/// Hand it back with [`EndpointQueues::free_transfer`].
#[derive(Debug, PartialEq, Eq)]
pub struct TransferSlot {
    endpoint: EndpointAddress,
    index: u8,
}

/// The free list head packs a generation tag above the index, so a head
/// that was popped and pushed back between our load and our CAS doesn't
/// look unchanged.
fn pack(index: u8, tag: u32) -> u32 {
    (tag << 8) | index as u32
}

fn head(word: u32) -> u8 {
    word as u8
}

fn tag(word: u32) -> u32 {
    word >> 8
}

struct TransferQueue<'a> {
    transfers: &'a [Transfer],
    free: AtomicU32,
    active: Mutex<Cell<u8>>,
}

impl<'a> TransferQueue<'a> {
    fn new(transfers: &'a [Transfer]) -> Self {
        for (idx, transfer) in transfers.iter().enumerate() {
            let next = if idx + 1 < transfers.len() {
                (idx + 1) as u8
            } else {
                NONE
            };
            transfer.next.store(next, Ordering::Relaxed);
        }
        let first = if transfers.is_empty() { NONE } else { 0 };
        TransferQueue {
            transfers,
            free: AtomicU32::new(pack(first, 0)),
            active: Mutex::new(Cell::new(NONE)),
        }
    }

    /// Pop from the free list
    fn allocate(&self) -> Option<u8> {
        let mut current = self.free.load(Ordering::Acquire);
        loop {
            let index = head(current);
            let transfer = self.transfers.get(index as usize)?;
            let next = transfer.next.load(Ordering::Relaxed);
            match self.free.compare_exchange_weak(
                current,
                pack(next, tag(current).wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(index),
                Err(actual) => current = actual,
            }
        }
    }

    /// Push onto the free list
    fn free(&self, index: u8) {
        let Some(transfer) = self.transfers.get(index as usize) else {
            return;
        };
        let mut current = self.free.load(Ordering::Relaxed);
        loop {
            transfer.next.store(head(current), Ordering::Relaxed);
            match self.free.compare_exchange_weak(
                current,
                pack(index, tag(current).wrapping_add(1)),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    fn transfer(&self, index: u8) -> Option<&'a Transfer> {
        self.transfers.get(index as usize)
    }

    /// Walk to the last transfer of the active list
    fn tail(&self, mut index: u8) -> Option<&'a Transfer> {
        let mut transfer = self.transfer(index)?;
        loop {
            index = transfer.next.load(Ordering::Relaxed);
            match self.transfer(index) {
                Some(next) => transfer = next,
                None => return Some(transfer),
            }
        }
    }
}

/// The transfer queues of one USB controller
///
/// Owns the controller's [`EndpointHardware`], and one optional queue per
/// endpoint address. Queues are claimed once, at start of day, with
/// [`init_queue`](EndpointQueues::init_queue).
pub struct EndpointQueues<'a, H> {
    hardware: H,
    queues: [Option<TransferQueue<'a>>; QUEUE_COUNT],
}

impl<'a, H: EndpointHardware> EndpointQueues<'a, H> {
    pub fn new(hardware: H) -> Self {
        EndpointQueues {
            hardware,
            queues: core::array::from_fn(|_| None),
        }
    }

    pub fn hardware(&self) -> &H {
        &self.hardware
    }

    pub fn hardware_mut(&mut self) -> &mut H {
        &mut self.hardware
    }

    /// Claim the queue for `endpoint`, backed by `pool`
    ///
    /// Fails with [`Error::Busy`] if the endpoint already has a queue, or
    /// if another queue already took the pool.
    pub fn init_queue<const N: usize>(
        &mut self,
        endpoint: EndpointAddress,
        pool: &'a TransferPool<N>,
    ) -> Result<()> {
        let slot = self
            .queues
            .get_mut(index(endpoint))
            .ok_or(Error::InvalidArgument)?;
        if slot.is_some() {
            error!("Queue for endpoint {:#x} is already initialized", u8::from(endpoint));
            return Err(Error::Busy);
        }
        let Some(transfers) = pool.take() else {
            error!("Transfer pool for endpoint {:#x} is already in use", u8::from(endpoint));
            return Err(Error::Busy);
        };
        *slot = Some(TransferQueue::new(transfers));
        Ok(())
    }

    fn queue(&self, endpoint: EndpointAddress) -> Result<&TransferQueue<'a>> {
        self.queues
            .get(index(endpoint))
            .and_then(Option::as_ref)
            .ok_or(Error::InvalidArgument)
    }

    /// Take a transfer from the endpoint's free list
    ///
    /// Returns `None` when every transfer is in use, or when the endpoint
    /// has no queue. Never blocks.
    pub fn allocate_transfer(&self, endpoint: EndpointAddress) -> Option<TransferSlot> {
        let index = self.queue(endpoint).ok()?.allocate()?;
        Some(TransferSlot { endpoint, index })
    }

    /// Return a transfer to its endpoint's free list
    pub fn free_transfer(&self, slot: TransferSlot) {
        if let Ok(queue) = self.queue(slot.endpoint) {
            queue.free(slot.index);
        }
    }

    /// Schedule a transfer of up to `maximum_length` bytes at `data`
    ///
    /// Fails with [`Error::NoSpace`] when the endpoint has no free
    /// transfers, and with [`Error::InvalidArgument`] when the endpoint has
    /// no queue, or the length exceeds what one descriptor describes.
    ///
    /// # Safety
    ///
    /// Unless `maximum_length` is zero, `data` must point to `maximum_length`
    /// bytes that stay valid, and untouched by anyone but the controller,
    /// until the transfer's completion runs.
    pub unsafe fn schedule(
        &self,
        endpoint: EndpointAddress,
        data: *mut u8,
        maximum_length: usize,
        completion: Option<Completion>,
    ) -> Result<()> {
        let queue = self.queue(endpoint)?;
        if maximum_length > MAX_TRANSFER {
            return Err(Error::InvalidArgument);
        }
        let index = queue.allocate().ok_or(Error::NoSpace)?;
        let Some(transfer) = queue.transfer(index) else {
            return Err(Error::NoSpace);
        };

        // Safety: the transfer just left the free list, and isn't on the
        // active list yet. Nobody else looks at it.
        unsafe {
            *transfer.request.get() = Request {
                data,
                maximum_length,
                completion,
            };
        }
        transfer.next.store(NONE, Ordering::Relaxed);
        transfer.td.set_terminate();
        transfer.td.set_buffer(data, maximum_length);
        transfer.td.set_interrupt_on_complete(true);
        transfer.td.set_active();

        critical_section::with(|cs| {
            let active = queue.active.borrow(cs);
            match queue.tail(active.get()) {
                None => {
                    active.set(index);
                    self.hardware.prime(endpoint, &transfer.td);
                }
                Some(tail) => {
                    tail.next.store(index, Ordering::Relaxed);
                    tail.td.set_next(&transfer.td);
                    self.hardware.append(endpoint, &transfer.td);
                }
            }
        });
        trace!("Scheduled {} bytes on {:#x}", maximum_length, u8::from(endpoint));
        Ok(())
    }

    /// Retry [`schedule`](Self::schedule) until it finds a free transfer
    ///
    /// Spins, so keep `timeout_us` short in interrupt context. Fails with
    /// [`Error::TimedOut`] once `timeout_us` elapsed since the first attempt.
    ///
    /// # Safety
    ///
    /// See [`schedule`](Self::schedule).
    pub unsafe fn schedule_wait(
        &self,
        endpoint: EndpointAddress,
        data: *mut u8,
        maximum_length: usize,
        completion: Option<Completion>,
        timeout_us: u32,
    ) -> Result<()> {
        let start = self.hardware.ticks();
        loop {
            // Safety: forwarded to the caller.
            match unsafe { self.schedule(endpoint, data, maximum_length, completion) } {
                Err(Error::NoSpace) => {
                    if self.hardware.microseconds_since(start) > timeout_us {
                        warn!("Timed out scheduling on {:#x}", u8::from(endpoint));
                        return Err(Error::TimedOut);
                    }
                    core::hint::spin_loop();
                }
                result => return result,
            }
        }
    }

    /// [`schedule_wait`](Self::schedule_wait) with the [`DEFAULT_TIMEOUT_US`]
    ///
    /// # Safety
    ///
    /// See [`schedule`](Self::schedule).
    pub unsafe fn schedule_block(
        &self,
        endpoint: EndpointAddress,
        data: *mut u8,
        maximum_length: usize,
        completion: Option<Completion>,
    ) -> Result<()> {
        // Safety: forwarded to the caller.
        unsafe { self.schedule_wait(endpoint, data, maximum_length, completion, DEFAULT_TIMEOUT_US) }
    }

    /// Schedule a zero-length transfer without a callback
    ///
    /// Acknowledges the status stage of a control transfer.
    pub fn schedule_ack(&self, endpoint: EndpointAddress) -> Result<()> {
        // Safety: zero length transfers never touch memory.
        unsafe { self.schedule_block(endpoint, ptr::null_mut(), 0, None) }
    }

    /// Retire finished transfers from the head of the active list
    ///
    /// Each retired transfer is unlinked, then its completion runs, then it
    /// returns to the free list. Stops at the first transfer the controller
    /// still owns, unless `include_active` is set; then, those are discarded
    /// too.
    pub fn clean_up_transfers(&self, endpoint: EndpointAddress, include_active: bool) {
        let Ok(queue) = self.queue(endpoint) else {
            return;
        };
        loop {
            let retired = critical_section::with(|cs| {
                let active = queue.active.borrow(cs);
                let index = active.get();
                let transfer = queue.transfer(index)?;
                let status = transfer.td.status();
                if status.intersects(Status::ABORTED) {
                    debug!("Transfer on {:#x} aborted, status {:#x}", u8::from(endpoint), status.bits());
                } else if status.contains(Status::ACTIVE) {
                    if !include_active {
                        return None;
                    }
                    warn!("Discarding active transfer on {:#x}", u8::from(endpoint));
                }
                active.set(transfer.next.load(Ordering::Relaxed));
                Some((index, transfer))
            });
            let Some((index, transfer)) = retired else {
                return;
            };

            // Safety: the transfer left the active list; it's ours until
            // it's back on the free list.
            let (maximum_length, completion) = unsafe {
                let request = &*transfer.request.get();
                (request.maximum_length, request.completion)
            };
            let transferred = maximum_length.saturating_sub(transfer.td.remaining());
            if let Some(completion) = completion {
                (completion.callback)(completion.user_data, transferred);
            }
            queue.free(index);
        }
    }

    /// Retire the transfers the controller finished
    ///
    /// Call this on the endpoint's transfer-complete interrupt.
    pub fn transfer_complete(&self, endpoint: EndpointAddress) {
        self.clean_up_transfers(endpoint, false)
    }

    /// Cancel everything on the endpoint
    ///
    /// The controller drops its primed work first, so no descriptor is
    /// recycled while the controller can still reach it.
    pub fn flush(&self, endpoint: EndpointAddress) {
        self.hardware.flush(endpoint);
        self.clean_up_transfers(endpoint, true);
    }

    /// Stall the endpoint
    pub fn stall(&self, endpoint: EndpointAddress) {
        self.hardware.stall(endpoint);
    }

    /// How many transfers are on the endpoint's active list
    pub fn pending(&self, endpoint: EndpointAddress) -> usize {
        let Ok(queue) = self.queue(endpoint) else {
            return 0;
        };
        critical_section::with(|cs| {
            let mut count = 0;
            let mut index = queue.active.borrow(cs).get();
            while let Some(transfer) = queue.transfer(index) {
                count += 1;
                index = transfer.next.load(Ordering::Relaxed);
            }
            count
        })
    }
}

#[cfg(test)]
impl<H: EndpointHardware> EndpointQueues<'_, H> {
    /// Play the controller: retire the head transfer, as if it moved `data`
    ///
    /// OUT transfers receive `data`. Returns `false` if nothing is queued.
    pub(crate) fn complete_head(&self, endpoint: EndpointAddress, data: &[u8]) -> bool {
        let Ok(queue) = self.queue(endpoint) else {
            return false;
        };
        let index = critical_section::with(|cs| queue.active.borrow(cs).get());
        let Some(transfer) = queue.transfer(index) else {
            return false;
        };
        let request = unsafe { &*transfer.request.get() };
        let length = data.len().min(request.maximum_length);
        if endpoint.is_out() && length > 0 {
            unsafe { ptr::copy_nonoverlapping(data.as_ptr(), request.data, length) };
        }
        transfer.td.retire(request.maximum_length - length, Status::empty());
        true
    }

    /// Play the controller: halt the head transfer
    pub(crate) fn halt_head(&self, endpoint: EndpointAddress) {
        let queue = self.queue(endpoint).unwrap();
        let index = critical_section::with(|cs| queue.active.borrow(cs).get());
        let transfer = queue.transfer(index).unwrap();
        let remaining = transfer.td.remaining();
        transfer.td.retire(remaining, Status::HALTED);
    }

    /// What the head transfer would send to the host
    pub(crate) fn head_contents(&self, endpoint: EndpointAddress) -> Option<Vec<u8>> {
        let queue = self.queue(endpoint).ok()?;
        let index = critical_section::with(|cs| queue.active.borrow(cs).get());
        let transfer = queue.transfer(index)?;
        let request = unsafe { &*transfer.request.get() };
        if request.maximum_length == 0 {
            return Some(Vec::new());
        }
        Some(unsafe { core::slice::from_raw_parts(request.data, request.maximum_length) }.to_vec())
    }
}
