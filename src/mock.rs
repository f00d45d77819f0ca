//! A recording stand-in for the USB controller

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Mutex,
};

use usb_device::endpoint::EndpointAddress;

use crate::{clock::Clock, queue::EndpointHardware, td::Td};

/// What the queue asked the controller to do, by endpoint address
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Event {
    Prime(u8),
    Append(u8),
    Flush(u8),
    Stall(u8),
}

/// Records every request, and advances time by one microsecond per read
pub struct MockHardware {
    events: Mutex<Vec<Event>>,
    now: AtomicU32,
}

impl MockHardware {
    pub fn new() -> Self {
        MockHardware {
            events: Mutex::new(Vec::new()),
            now: AtomicU32::new(0),
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn now(&self) -> u32 {
        self.now.load(Ordering::SeqCst)
    }

    pub fn stalled(&self, endpoint: u8) -> bool {
        self.events().contains(&Event::Stall(endpoint))
    }

    fn record(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

impl Clock for MockHardware {
    fn ticks(&self) -> u32 {
        self.now.fetch_add(1, Ordering::SeqCst) + 1
    }
    fn ticks_per_microsecond(&self) -> u32 {
        1
    }
}

impl EndpointHardware for MockHardware {
    fn prime(&self, endpoint: EndpointAddress, _: &Td) {
        self.record(Event::Prime(endpoint.into()));
    }
    fn append(&self, endpoint: EndpointAddress, _: &Td) {
        self.record(Event::Append(endpoint.into()));
    }
    fn flush(&self, endpoint: EndpointAddress) {
        self.record(Event::Flush(endpoint.into()));
    }
    fn stall(&self, endpoint: EndpointAddress) {
        self.record(Event::Stall(endpoint.into()));
    }
}
