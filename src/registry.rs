//! Process-wide cell instance registry: one mutex, one fixed-capacity table,
//! handles realized as index+generation so a stale handle can never alias a
//! reused slot.

use core::cell::RefCell;
use critical_section::Mutex;

use crate::capability::{ModuleCapability, ModuleKind};
use crate::error::Error;
use crate::port::Polarity;
use crate::sleep::{DeepSleepState, SleepContext, UartSleepCache};

pub const MAX_INSTANCES: usize = 4;

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub struct CellHandle {
    index: u8,
    generation: u16,
}

/// Presence and polarity of each named GPIO, as tracked by the registry.
/// The real `OutPin`/`InPin` objects that actually drive the hardware are
/// generic over the integrator's pin types and so cannot live in this
/// concrete struct (see DESIGN.md Open Question (d)); they are instead
/// passed alongside the `CellHandle` as a `power::ModulePins` parameter to
/// every operation that needs them. This struct only answers "is a pin
/// wired, and at what polarity", which the decision logic in `power`/
/// `config` needs without touching the hardware itself.
pub struct PinSet {
    pub enable_power: Option<Polarity>,
    pub pwr_on: Option<Polarity>,
    pub vint: Option<Polarity>,
    pub dtr: Option<Polarity>,
}

pub struct CellInstance {
    pub kind: ModuleKind,
    pub pins: PinSet,
    pub leave_powered: bool,
    /// Whether the platform can temporarily suspend CTS flow control, one of
    /// the inputs to the UART power-saving mode decision tree. Not
    /// discoverable over AT; set once by the integrator at `Registry::add`.
    pub cts_suspend_capable: bool,
    pub mno_profile: Option<u16>,
    pub last_cfun_flip_ms: u32,
    pub reboot_is_required: bool,
    pub deep_sleep_state: DeepSleepState,
    pub deep_sleep_blocked_by: Option<u8>,
    pub in_wake_up_callback: bool,
    pub sleep: SleepContext,
    pub uart_sleep_cache: Option<UartSleepCache>,
}

impl CellInstance {
    fn new(kind: ModuleKind, pins: PinSet, leave_powered: bool, cts_suspend_capable: bool) -> Self {
        Self {
            kind,
            pins,
            leave_powered,
            cts_suspend_capable,
            mno_profile: None,
            last_cfun_flip_ms: 0,
            reboot_is_required: false,
            deep_sleep_state: DeepSleepState::Unknown,
            deep_sleep_blocked_by: None,
            in_wake_up_callback: false,
            sleep: SleepContext::default(),
            uart_sleep_cache: None,
        }
    }

    pub fn capability(&self) -> &'static ModuleCapability {
        self.kind.capability()
    }
}

struct Slot {
    generation: u16,
    instance: Option<CellInstance>,
}

struct Inner {
    slots: heapless::Vec<Slot, MAX_INSTANCES>,
}

impl Inner {
    const fn new() -> Self {
        Self {
            slots: heapless::Vec::new(),
        }
    }
}

pub struct Registry {
    inner: Mutex<RefCell<Inner>>,
}

static REGISTRY: Registry = Registry {
    inner: Mutex::new(RefCell::new(Inner::new())),
};

impl Registry {
    /// Idempotent: the static registry needs no explicit construction beyond
    /// this call existing as the documented entry point.
    pub fn init() {}

    pub fn add(
        kind: ModuleKind,
        pins: PinSet,
        leave_powered: bool,
        cts_suspend_capable: bool,
    ) -> Result<CellHandle, Error> {
        critical_section::with(|cs| {
            let mut inner = REGISTRY.inner.borrow_ref_mut(cs);
            for (i, slot) in inner.slots.iter_mut().enumerate() {
                if slot.instance.is_none() {
                    slot.generation = slot.generation.wrapping_add(1);
                    slot.instance = Some(CellInstance::new(kind, pins, leave_powered, cts_suspend_capable));
                    return Ok(CellHandle {
                        index: i as u8,
                        generation: slot.generation,
                    });
                }
            }
            let slot = Slot {
                generation: 1,
                instance: Some(CellInstance::new(kind, pins, leave_powered, cts_suspend_capable)),
            };
            let index = inner.slots.len();
            inner.slots.push(slot).map_err(|_| Error::NoMemory)?;
            Ok(CellHandle {
                index: index as u8,
                generation: 1,
            })
        })
    }

    pub fn remove(handle: CellHandle) -> Result<(), Error> {
        critical_section::with(|cs| {
            let mut inner = REGISTRY.inner.borrow_ref_mut(cs);
            let slot = inner
                .slots
                .get_mut(handle.index as usize)
                .ok_or(Error::NotInitialised)?;
            if slot.generation != handle.generation || slot.instance.is_none() {
                return Err(Error::NotInitialised);
            }
            slot.instance = None;
            Ok(())
        })
    }

    /// Runs `f` with exclusive access to the instance while the registry
    /// mutex is held; the closure cannot smuggle the `&mut CellInstance` out.
    pub fn with_instance<R>(
        handle: CellHandle,
        f: impl FnOnce(&mut CellInstance) -> R,
    ) -> Result<R, Error> {
        critical_section::with(|cs| {
            let mut inner = REGISTRY.inner.borrow_ref_mut(cs);
            let slot = inner
                .slots
                .get_mut(handle.index as usize)
                .ok_or(Error::NotInitialised)?;
            if slot.generation != handle.generation {
                return Err(Error::NotInitialised);
            }
            let instance = slot.instance.as_mut().ok_or(Error::NotInitialised)?;
            Ok(f(instance))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pins() -> PinSet {
        PinSet {
            enable_power: None,
            pwr_on: Some(Polarity::ActiveHigh),
            vint: Some(Polarity::ActiveHigh),
            dtr: None,
        }
    }

    // Both assertions share the one process-wide REGISTRY static, so they run
    // as a single #[test] to avoid cross-test races under parallel execution.
    #[test]
    fn remove_frees_slot_and_reused_slot_gets_new_generation() {
        let h = Registry::add(ModuleKind::SaraR5, pins(), false, false).unwrap();
        Registry::remove(h).unwrap();
        assert_eq!(Registry::with_instance(h, |_| ()), Err(Error::NotInitialised));

        let h1 = Registry::add(ModuleKind::SaraR4, pins(), false, false).unwrap();
        Registry::remove(h1).unwrap();
        let h2 = Registry::add(ModuleKind::SaraR4, pins(), false, false).unwrap();
        assert_eq!(h1.index, h2.index);
        assert_ne!(h1.generation, h2.generation);
        assert_eq!(Registry::with_instance(h1, |_| ()), Err(Error::NotInitialised));
        assert!(Registry::with_instance(h2, |_| ()).is_ok());
        Registry::remove(h2).unwrap();
    }
}
