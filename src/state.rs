use core::sync::atomic::{AtomicBool, Ordering};

use crate::{qh::Qh, queue::MAX_ENDPOINTS};

/// One queue head per endpoint, per direction
pub const QH_COUNT: usize = MAX_ENDPOINTS * 2;

/// The queue head list
///
/// ENDPOINTLISTADDR only holds bits 31:11, so the list must sit on a
/// 2 KiB boundary.
#[repr(C, align(2048))]
struct QhList([Qh; QH_COUNT]);

#[allow(clippy::declare_interior_mutable_const)]
impl QhList {
    const fn new() -> Self {
        const QH: Qh = Qh::new();
        Self([QH; QH_COUNT])
    }
}

/// Controller state shared with the USB0 DMA engine
///
/// Each [`Driver`](crate::Driver) needs an `EndpointState`. Allocate a
/// `static` object and supply it to the driver constructor. A state can be
/// handed to exactly one driver.
///
/// ```
/// use great_usbd::EndpointState;
///
/// static EP_STATE: EndpointState = EndpointState::new();
/// ```
pub struct EndpointState {
    qh_list: QhList,
    taken: AtomicBool,
}

// Safety: the queue heads are only reachable through `acquire()`, which
// hands them out once.
unsafe impl Sync for EndpointState {}

impl EndpointState {
    pub const fn new() -> Self {
        EndpointState {
            qh_list: QhList::new(),
            taken: AtomicBool::new(false),
        }
    }

    /// Take the queue head list
    ///
    /// Returns `None` if the list was already taken.
    pub(crate) fn acquire(&'static self) -> Option<&'static [Qh]> {
        let taken = self.taken.swap(true, Ordering::SeqCst);
        (!taken).then_some(&self.qh_list.0[..])
    }
}

impl Default for EndpointState {
    fn default() -> Self {
        Self::new()
    }
}
