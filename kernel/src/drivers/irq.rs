//! Device-interrupt service
//!
//! Drivers register a slot per device: a top half that runs with
//! interrupts disabled and acknowledges hardware state, a bottom half
//! that acts on the latched state afterwards, and a poll callback for
//! systems whose interrupt routing never fires.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::vec::Vec;

use spin::Mutex;

use crate::error::{KernelError, KernelResult};

/// Slot value meaning "not registered".
pub const INVALID_SLOT: u8 = 0xFF;

const MAX_SLOTS: usize = 16;

pub type TopHalf = Box<dyn Fn() -> bool + Send + Sync>;
pub type BottomHalf = Box<dyn Fn() + Send + Sync>;
pub type PollCallback = Box<dyn Fn() + Send + Sync>;

pub struct InterruptRegistration {
    pub name: String,
    pub legacy_irq: u8,
    pub top_half: TopHalf,
    pub bottom_half: BottomHalf,
    pub poll: PollCallback,
}

struct Slot {
    registration: InterruptRegistration,
    enabled: bool,
}

static SLOTS: Mutex<Vec<Option<Slot>>> = Mutex::new(Vec::new());

/// Claim a slot. Returns the slot index used to query or release it.
pub fn register(registration: InterruptRegistration) -> KernelResult<u8> {
    let mut slots = SLOTS.lock();
    if slots.is_empty() {
        slots.resize_with(MAX_SLOTS, || None);
    }
    let index = slots
        .iter()
        .position(|slot| slot.is_none())
        .ok_or(KernelError::Busy)?;
    log::info!(
        "irq: slot {} bound to '{}' (irq {})",
        index,
        registration.name,
        registration.legacy_irq
    );
    slots[index] = Some(Slot {
        registration,
        enabled: true,
    });
    Ok(index as u8)
}

pub fn release(slot: u8) -> bool {
    let mut slots = SLOTS.lock();
    match slots.get_mut(slot as usize) {
        Some(entry) => entry.take().is_some(),
        None => false,
    }
}

pub fn slot_is_enabled(slot: u8) -> bool {
    SLOTS
        .lock()
        .get(slot as usize)
        .and_then(|entry| entry.as_ref())
        .map(|slot| slot.enabled)
        .unwrap_or(false)
}

/// Hardware interrupt entry: run every top half registered for `irq`
/// and, where one reports latched work, its bottom half.
///
/// Interrupts are already disabled on this path; the bottom halves run
/// after the tops so acknowledge latency stays minimal.
pub fn dispatch_irq(irq: u8) {
    let slots = SLOTS.lock();
    let mut deferred: Vec<usize> = Vec::new();
    for (index, entry) in slots.iter().enumerate() {
        if let Some(slot) = entry {
            if slot.enabled && slot.registration.legacy_irq == irq {
                if (slot.registration.top_half)() {
                    deferred.push(index);
                }
            }
        }
    }
    for index in deferred {
        if let Some(slot) = slots[index].as_ref() {
            (slot.registration.bottom_half)();
        }
    }
}

/// Poll path for systems without interrupt routing: every slot's poll
/// callback runs in registration order.
pub fn poll_all() {
    let slots = SLOTS.lock();
    for entry in slots.iter() {
        if let Some(slot) = entry {
            if slot.enabled {
                (slot.registration.poll)();
            }
        }
    }
}

#[doc(hidden)]
pub fn reset_for_tests() {
    SLOTS.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};

    use crate::test_support::TEST_GUARD;

    fn counter_registration(
        irq: u8,
        latch: bool,
        tops: Arc<AtomicU32>,
        bottoms: Arc<AtomicU32>,
    ) -> InterruptRegistration {
        InterruptRegistration {
            name: String::from("test"),
            legacy_irq: irq,
            top_half: Box::new(move || {
                tops.fetch_add(1, Ordering::AcqRel);
                latch
            }),
            bottom_half: Box::new(move || {
                bottoms.fetch_add(1, Ordering::AcqRel);
            }),
            poll: Box::new(|| {}),
        }
    }

    #[test]
    fn bottom_half_runs_only_when_latched() {
        let _guard = TEST_GUARD.lock();
        reset_for_tests();

        let tops = Arc::new(AtomicU32::new(0));
        let bottoms = Arc::new(AtomicU32::new(0));
        let slot =
            register(counter_registration(5, true, tops.clone(), bottoms.clone())).unwrap();
        assert!(slot_is_enabled(slot));

        dispatch_irq(5);
        assert_eq!(tops.load(Ordering::Acquire), 1);
        assert_eq!(bottoms.load(Ordering::Acquire), 1);

        // A different line leaves the slot alone.
        dispatch_irq(6);
        assert_eq!(tops.load(Ordering::Acquire), 1);

        reset_for_tests();
    }

    #[test]
    fn unlatched_top_skips_the_bottom() {
        let _guard = TEST_GUARD.lock();
        reset_for_tests();

        let tops = Arc::new(AtomicU32::new(0));
        let bottoms = Arc::new(AtomicU32::new(0));
        register(counter_registration(3, false, tops.clone(), bottoms.clone())).unwrap();

        dispatch_irq(3);
        assert_eq!(tops.load(Ordering::Acquire), 1);
        assert_eq!(bottoms.load(Ordering::Acquire), 0);

        reset_for_tests();
    }

    #[test]
    fn released_slots_are_reusable() {
        let _guard = TEST_GUARD.lock();
        reset_for_tests();

        let tops = Arc::new(AtomicU32::new(0));
        let bottoms = Arc::new(AtomicU32::new(0));
        let slot =
            register(counter_registration(4, true, tops.clone(), bottoms.clone())).unwrap();
        assert!(release(slot));
        assert!(!slot_is_enabled(slot));

        let again = register(counter_registration(4, true, tops, bottoms)).unwrap();
        assert_eq!(again, slot);

        reset_for_tests();
    }
}
