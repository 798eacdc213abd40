//! Shared clock record and master/slave coordinator (spec §6.3, §9).
//!
//! The clock record is "a typed record owned by the host, passed by
//! reference at configuration time" (§9): this module models that as a
//! `Coordinator` the host constructs once per graph, with each `Engine`
//! holding an opaque `ClockHandle` into it rather than a pointer to another
//! engine. Single-writer discipline is enforced by the data-loop
//! confinement rule in spec §5 - nothing here is `Sync`, by design.

use std::cell::RefCell;
use std::rc::Rc;

/// The record published by a master clock and read by slaves (spec §6.3).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClockRecord {
    pub nsec: u64,
    /// `rate` is `1/Hz`; stored here as the device rate in Hz for clarity,
    /// convert with [`ClockRecord::period_seconds`].
    pub rate_hz: u32,
    pub position: i64,
    pub delay: i64,
    pub rate_diff: f64,
}

impl ClockRecord {
    pub fn period_seconds(&self) -> f64 {
        if self.rate_hz == 0 {
            0.0
        } else {
            1.0 / self.rate_hz as f64
        }
    }
}

/// Opaque handle an engine holds into a [`Coordinator`]. Never dereferenced
/// directly into another engine - only ever used to read/write a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockHandle(usize);

#[derive(Default)]
struct CoordinatorInner {
    slots: Vec<Option<ClockRecord>>,
    master: Option<ClockHandle>,
}

/// Owned by the host media graph; every [`crate::scheduler::Engine`] in the
/// same graph registers with the same `Coordinator`.
#[derive(Clone, Default)]
pub struct Coordinator(Rc<RefCell<CoordinatorInner>>);

impl Coordinator {
    pub fn new() -> Self {
        Coordinator(Rc::new(RefCell::new(CoordinatorInner::default())))
    }

    /// Register a new engine, returning the handle it should hold.
    pub fn register(&self) -> ClockHandle {
        let mut inner = self.0.borrow_mut();
        inner.slots.push(None);
        ClockHandle(inner.slots.len() - 1)
    }

    /// Publish this engine's clock record (spec §4.5.1, §5 "single writer").
    pub fn publish(&self, handle: ClockHandle, record: ClockRecord) {
        let mut inner = self.0.borrow_mut();
        inner.slots[handle.0] = Some(record);
    }

    /// Read a specific engine's last-published record.
    pub fn read(&self, handle: ClockHandle) -> Option<ClockRecord> {
        self.0.borrow().slots[handle.0]
    }

    /// Designate `handle` as the graph's clock master. Only the master
    /// engine drives its own timer; slaves read the master's record on
    /// every tick of whatever drives the master (spec §4.4 "Slaved mode").
    pub fn set_master(&self, handle: ClockHandle) {
        self.0.borrow_mut().master = Some(handle);
    }

    pub fn master_handle(&self) -> Option<ClockHandle> {
        self.0.borrow().master
    }

    pub fn master_record(&self) -> Option<ClockRecord> {
        let inner = self.0.borrow();
        inner.master.and_then(|h| inner.slots[h.0])
    }

    pub fn is_master(&self, handle: ClockHandle) -> bool {
        self.0.borrow().master == Some(handle)
    }
}

/// A host-writable override of the engine's per-tick threshold (spec §4.4
/// step 1: "If a threshold override is present on the shared position,
/// adopt it"). Shared between the host and exactly one engine.
#[derive(Clone, Default)]
pub struct ThresholdOverride(Rc<RefCell<Option<u32>>>);

impl ThresholdOverride {
    pub fn new() -> Self {
        ThresholdOverride(Rc::new(RefCell::new(None)))
    }

    pub fn set(&self, frames: Option<u32>) {
        *self.0.borrow_mut() = frames;
    }

    pub fn get(&self) -> Option<u32> {
        *self.0.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_publish_then_read_roundtrips() {
        let c = Coordinator::new();
        let h = c.register();
        assert_eq!(c.read(h), None);
        let rec = ClockRecord { nsec: 42, rate_hz: 48000, position: 1024, delay: 10, rate_diff: 1.0 };
        c.publish(h, rec);
        assert_eq!(c.read(h), Some(rec));
    }

    #[test]
    fn slave_sees_masters_published_record() {
        let c = Coordinator::new();
        let master = c.register();
        let slave = c.register();
        c.set_master(master);
        assert!(c.is_master(master));
        assert!(!c.is_master(slave));

        let rec = ClockRecord { nsec: 1000, rate_hz: 44100, position: 2048, delay: 5, rate_diff: 1.001 };
        c.publish(master, rec);
        assert_eq!(c.master_record(), Some(rec));
    }

    #[test]
    fn threshold_override_defaults_to_none() {
        let t = ThresholdOverride::new();
        assert_eq!(t.get(), None);
        t.set(Some(256));
        assert_eq!(t.get(), Some(256));
    }
}
