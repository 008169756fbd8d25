//! Power-on, power-off, reboot, hard-reset and the configuration script that
//! brings a freshly powered module to a known-good state.
//!
//! Each function takes the `CellHandle` (looked up against the registry for
//! instance state) and the caller's own `AtClient` (generic over the port
//! types, so it cannot live inside the registry's single concrete static
//! table — see DESIGN.md). `power_on`/`power_off`/`power_off_hard` also take
//! a `ModulePins`, the integrator's real ENABLE_POWER/PWR_ON/VINT GPIOs, for
//! the same reason. RESET is ephemeral (only driven during `reset_hard`) so
//! it's passed on its own rather than folded into `ModulePins`.

use embedded_hal::digital::{InputPin, OutputPin};

use crate::at_client::{AtClient, WakeUpCallback};
use crate::capability::Features;
use crate::config;
use crate::error::Error;
use crate::port::{Clock as ClockTrait, InPin, NoActivityPin, NoInputPin, OutPin, UartPort};
use crate::registry::{CellHandle, Registry};
use crate::sleep::DeepSleepState;

pub const CONFIGURATION_COMMAND_TRIES: u8 = 3;
pub const IS_ALIVE_ATTEMPTS_POWER_ON: u8 = 10;
pub const CPWROFF_WAIT_SECONDS: u32 = 10;
pub const AT_CFUN_FLIP_DELAY_SECONDS: u32 = 3;
pub const RESET_HOLD_MS: u32 = 100;

/// Polled at every significant step of a long operation; `false` aborts with
/// `Error::Cancelled`.
pub trait KeepGoing: FnMut() -> bool {}
impl<T: FnMut() -> bool> KeepGoing for T {}

fn check(keep_going: &mut impl KeepGoing) -> Result<(), Error> {
    if keep_going() {
        Ok(())
    } else {
        Err(Error::Cancelled)
    }
}

/// The persistent GPIOs wired to the module. Generic over the integrator's
/// pin types (see DESIGN.md Open Question (d)) so, like `AtClient`, it can't
/// live inside the registry and is instead passed alongside the `CellHandle`.
/// A pin left `None` means it isn't wired on this board; the sequencing below
/// falls back to an AT-level check wherever that happens.
pub struct ModulePins<
    EP: OutputPin = NoActivityPin,
    PO: OutputPin = NoActivityPin,
    VI: InputPin = NoInputPin,
> {
    pub enable_power: Option<OutPin<EP>>,
    pub pwr_on: Option<OutPin<PO>>,
    pub vint: Option<InPin<VI>>,
}

impl<EP: OutputPin, PO: OutputPin, VI: InputPin> ModulePins<EP, PO, VI> {
    pub fn new(
        enable_power: Option<OutPin<EP>>,
        pwr_on: Option<OutPin<PO>>,
        vint: Option<InPin<VI>>,
    ) -> Self {
        Self {
            enable_power,
            pwr_on,
            vint,
        }
    }
}

fn spin_wait_ms<U: UartPort, C: ClockTrait, const N: usize, P: OutputPin>(
    client: &AtClient<U, C, N, P>,
    ms: u32,
) {
    let deadline = client.now_ms().wrapping_add(ms);
    while client.now_ms() < deadline {}
}

/// Sends a bare `AT` and returns whether the module answered `OK` or any
/// structured error (either counts as "alive": it replied to something).
fn probe_at<U: UartPort, C: ClockTrait, const N: usize, P: OutputPin>(
    client: &mut AtClient<U, C, N, P>,
) -> bool {
    let Ok(mut lock) = client.lock() else {
        return false;
    };
    if lock.command_start("AT").is_err() {
        return false;
    }
    if lock.command_stop().is_err() {
        return false;
    }
    matches!(
        lock.response_stop(),
        Ok(()) | Err(Error::DeviceError(_))
    )
}

/// Retries `probe_at` up to `attempts` times. Collapses to a single attempt
/// while the instance is inside its own wake-up callback: that callback is
/// already running on the path `maybe_wake_up` took to get here, so looping
/// would just mean re-entering the same transaction over and over instead of
/// letting the outer call finish.
fn is_alive<U: UartPort, C: ClockTrait, const N: usize, P: OutputPin>(
    handle: CellHandle,
    client: &mut AtClient<U, C, N, P>,
    attempts: u8,
) -> bool {
    let in_wake_up_callback =
        Registry::with_instance(handle, |inst| inst.in_wake_up_callback).unwrap_or(false);
    let attempts = if in_wake_up_callback { 1 } else { attempts };
    for _ in 0..attempts {
        if probe_at(client) {
            return true;
        }
    }
    false
}

fn retry_command<U: UartPort, C: ClockTrait, const N: usize, P: OutputPin>(
    client: &mut AtClient<U, C, N, P>,
    command: &str,
) -> Result<(), Error> {
    let mut last_err = Error::AtError;
    for _ in 0..CONFIGURATION_COMMAND_TRIES {
        let outcome: Result<(), Error> = (|| {
            let mut lock = client.lock()?;
            lock.command_start(command)?;
            lock.command_stop()?;
            lock.response_stop()
        })();
        match outcome {
            Ok(()) => return Ok(()),
            Err(e) => {
                defmt::debug!("command retry after failure");
                last_err = e;
            }
        }
    }
    Err(last_err)
}

/// Reads back the module's current `AT&K` flow-control setting rather than
/// assuming one, so `module_configure` re-affirms whatever the integrator
/// already wired instead of silently disabling hardware flow control.
fn query_flow_control<U: UartPort, C: ClockTrait, const N: usize, P: OutputPin>(
    client: &mut AtClient<U, C, N, P>,
) -> Result<bool, Error> {
    let mut lock = client.lock()?;
    lock.command_start("AT&K?")?;
    lock.command_stop()?;
    let line = lock.response_start(None)?;
    lock.response_stop()?;
    let setting = line.trim().trim_start_matches('&').trim_start_matches('K').trim();
    Ok(setting == "3")
}

fn is_vint_asserted<VI: InputPin>(vint: &mut Option<InPin<VI>>) -> Option<bool> {
    vint.as_mut().map(|pin| pin.is_asserted().unwrap_or(false))
}

/// Brings the module up:
/// 1. Snapshots whether it was in deep sleep before this call.
/// 2. Checks whether it's already powered (VINT if wired, else a probe).
/// 3. If not, asserts ENABLE_POWER and waits out the supply rail's settle time.
/// 4. Pulses PWR_ON for its documented pull duration.
/// 5. Waits the module's documented boot time.
/// 6. Probes liveness over AT.
/// 7. Runs `module_configure`.
/// 8. If it had been asleep, invokes the registered deep-sleep-wake callback.
/// 9. Marks the instance as powered; retries once with a full power cycle on
///    any failure along the way, otherwise gives up.
pub fn power_on<U, C, const N: usize, P, EP, PO, VI>(
    handle: CellHandle,
    client: &mut AtClient<U, C, N, P>,
    pins: &mut ModulePins<EP, PO, VI>,
    mut keep_going: impl KeepGoing,
) -> Result<(), Error>
where
    U: UartPort,
    C: ClockTrait,
    P: OutputPin,
    EP: OutputPin,
    PO: OutputPin,
    VI: InputPin,
{
    let asleep_at_start = Registry::with_instance(handle, |inst| {
        inst.deep_sleep_state == DeepSleepState::Asleep
    })?;
    Registry::with_instance(handle, |inst| {
        inst.deep_sleep_state = DeepSleepState::Unknown;
        inst.deep_sleep_blocked_by = None;
    })?;

    for attempt in 0..2u8 {
        check(&mut keep_going)?;

        let already_on = match is_vint_asserted(&mut pins.vint) {
            Some(asserted) => asserted,
            None => is_alive(handle, client, 1),
        };

        if !already_on {
            let cap = Registry::with_instance(handle, |inst| *inst.capability())?;

            if let Some(enable_power) = pins.enable_power.as_mut() {
                let _ = enable_power.assert();
                spin_wait_ms(client, cap.power_on_pull_ms);
            }

            if let Some(pwr_on) = pins.pwr_on.as_mut() {
                let _ = pwr_on.assert();
                spin_wait_ms(client, cap.power_on_pull_ms);
                let _ = pwr_on.deassert();
            }

            spin_wait_ms(client, cap.boot_wait_ms);
        }

        check(&mut keep_going)?;

        if !is_alive(handle, client, IS_ALIVE_ATTEMPTS_POWER_ON) {
            defmt::warn!("module not responding on power-on attempt");
            if attempt == 0 {
                let _ = power_off_hard(handle, client, pins, true);
                continue;
            }
            return Err(Error::NotResponding);
        }

        match module_configure(handle, client, false, false) {
            Ok(()) => {
                if asleep_at_start {
                    let callback =
                        Registry::with_instance(handle, |inst| inst.sleep.deep_sleep_wake)?;
                    if let Some((cb, ctx)) = callback {
                        cb(ctx);
                    }
                }
                Registry::with_instance(handle, |inst| inst.leave_powered = true)?;
                return Ok(());
            }
            Err(e) => {
                if attempt == 0 {
                    defmt::warn!("configure failed on first power-on attempt, power cycling");
                    let _ = power_off_hard(handle, client, pins, true);
                } else {
                    return Err(e);
                }
            }
        }
    }
    Err(Error::NotResponding)
}

/// Gracefully powers the module off: disables UART power-saving if a wake-up
/// handler is active, sends `AT+CPWROFF`, waits for VINT (or an AT probe) to
/// confirm it dropped, then releases ENABLE_POWER.
pub fn power_off<U, C, const N: usize, P, EP, PO, VI>(
    handle: CellHandle,
    client: &mut AtClient<U, C, N, P>,
    pins: &mut ModulePins<EP, PO, VI>,
) -> Result<(), Error>
where
    U: UartPort,
    C: ClockTrait,
    P: OutputPin,
    EP: OutputPin,
    PO: OutputPin,
    VI: InputPin,
{
    if client.is_wake_up_handler_set() {
        retry_command(client, "AT+UPSV=0")?;
    }
    retry_command(client, "AT+CPWROFF")?;

    let cap = Registry::with_instance(handle, |inst| *inst.capability())?;
    let wait_ms = cap.power_down_wait_ms.max(CPWROFF_WAIT_SECONDS * 1000);
    let deadline = client.now_ms().wrapping_add(wait_ms);
    while client.now_ms() < deadline {
        let still_on = match is_vint_asserted(&mut pins.vint) {
            Some(asserted) => asserted,
            None => probe_at(client),
        };
        if !still_on {
            break;
        }
    }

    if let Some(enable_power) = pins.enable_power.as_mut() {
        let _ = enable_power.deassert();
    }

    Registry::with_instance(handle, |inst| {
        inst.deep_sleep_state = DeepSleepState::Unknown;
        inst.leave_powered = false;
    })?;
    Ok(())
}

/// Drops power without a graceful AT handshake: pulses PWR_ON (in case the
/// module is still on and needs the toggle to shut down), and on
/// `truly_hard` also releases ENABLE_POWER so the supply rail itself drops.
pub fn power_off_hard<U, C, const N: usize, P, EP, PO, VI>(
    handle: CellHandle,
    client: &mut AtClient<U, C, N, P>,
    pins: &mut ModulePins<EP, PO, VI>,
    truly_hard: bool,
) -> Result<(), Error>
where
    U: UartPort,
    C: ClockTrait,
    P: OutputPin,
    EP: OutputPin,
    PO: OutputPin,
    VI: InputPin,
{
    let cap = Registry::with_instance(handle, |inst| *inst.capability())?;

    if let Some(pwr_on) = pins.pwr_on.as_mut() {
        let _ = pwr_on.assert();
        spin_wait_ms(client, cap.power_off_pull_ms);
        let _ = pwr_on.deassert();
    }

    if truly_hard {
        if let Some(enable_power) = pins.enable_power.as_mut() {
            let _ = enable_power.deassert();
        }
    }

    Registry::with_instance(handle, |inst| {
        inst.deep_sleep_state = DeepSleepState::Unavailable;
        inst.leave_powered = false;
    })?;
    Ok(())
}

/// `AT+CFUN=15` (or `16` on SARA-R5/R422) and wait for the module to come
/// back, respecting the mandatory inter-CFUN delay.
pub fn reboot<U: UartPort, C: ClockTrait, const N: usize, P: OutputPin>(
    handle: CellHandle,
    client: &mut AtClient<U, C, N, P>,
    mut keep_going: impl KeepGoing,
) -> Result<(), Error> {
    let kind = Registry::with_instance(handle, |inst| inst.kind)?;
    let cfun_value = match kind {
        crate::capability::ModuleKind::SaraR5 | crate::capability::ModuleKind::SaraR422 => 16,
        _ => 15,
    };
    let mut cmd: heapless::String<16> = heapless::String::new();
    let _ = core::fmt::write(&mut cmd, format_args!("AT+CFUN={cfun_value}"));
    retry_command(client, cmd.as_str())?;

    check(&mut keep_going)?;
    if !is_alive(handle, client, IS_ALIVE_ATTEMPTS_POWER_ON) {
        return Err(Error::NotResponding);
    }
    module_configure(handle, client, false, false)
}

/// Toggles RESET (an ephemeral pin, not part of `ModulePins`: it's only ever
/// driven here), waits out the hold time and the module's boot time, then
/// re-probes and re-configures.
pub fn reset_hard<U: UartPort, C: ClockTrait, const N: usize, P: OutputPin, RS: OutputPin>(
    handle: CellHandle,
    client: &mut AtClient<U, C, N, P>,
    reset: &mut OutPin<RS>,
    mut keep_going: impl KeepGoing,
) -> Result<(), Error> {
    check(&mut keep_going)?;

    let _ = reset.assert();
    spin_wait_ms(client, RESET_HOLD_MS);
    let _ = reset.deassert();

    let cap = Registry::with_instance(handle, |inst| *inst.capability())?;
    spin_wait_ms(client, cap.boot_wait_ms);

    check(&mut keep_going)?;
    if !is_alive(handle, client, IS_ALIVE_ATTEMPTS_POWER_ON) {
        return Err(Error::NotResponding);
    }
    module_configure(handle, client, false, false)
}

/// Registers `callback` as the DTR-driven wake-up handler, using this
/// crate's fixed inactivity timeout and wake-up margin rather than leaving
/// callers to guess a safe value.
pub fn register_wake_up_handler<U: UartPort, C: ClockTrait, const N: usize, P: OutputPin>(
    client: &mut AtClient<U, C, N, P>,
    handle: CellHandle,
    callback: WakeUpCallback,
) {
    let inactivity_ms = config::constants::POWER_SAVING_UART_INACTIVITY_TIMEOUT_SECONDS * 1000
        + config::constants::POWER_SAVING_UART_WAKEUP_MARGIN_MILLISECONDS;
    client.set_wake_up_handler(callback, handle, inactivity_ms);
}

/// Arms the DTR activity pin with this crate's fixed assert-lead-time and
/// release-hysteresis, for DTR-driven UART power saving.
pub fn register_dtr_activity_pin<U: UartPort, C: ClockTrait, const N: usize, P: OutputPin>(
    client: &mut AtClient<U, C, N, P>,
    pin: P,
    asserted_high: bool,
) {
    client.set_activity_pin(
        pin,
        config::constants::UART_POWER_SAVING_DTR_READY_MS,
        config::constants::UART_POWER_SAVING_DTR_HYSTERESIS_MS,
        asserted_high,
    );
}

/// `+UUPSMR` URC callback: updates the owning instance's cached deep-sleep
/// state and blocker id.
fn on_uupsmr_urc(body: &str, context: CellHandle) {
    let _ = Registry::with_instance(context, |inst| {
        let (state, blocker) = crate::sleep::on_uupsmr_urc(body, inst.deep_sleep_state);
        inst.deep_sleep_state = state;
        inst.deep_sleep_blocked_by = blocker;
    });
}

/// `+CEDRXP` URC callback, registered on SARA-R4 only. Logs the assigned
/// eDRX/paging-window values the network negotiated and, if one is
/// registered, notifies the instance's `edrx_update` callback.
fn on_cedrxp_urc(body: &str, context: CellHandle) {
    let Some((rat, edrx_seconds, paging_window_cs)) = crate::sleep::parse_cedrxp_urc(body) else {
        return;
    };
    defmt::debug!(
        "assigned edrx for rat {}: {} s, paging window {} cs",
        rat,
        edrx_seconds,
        paging_window_cs
    );
    let callback = Registry::with_instance(context, |inst| inst.sleep.edrx_update).unwrap_or(None);
    if let Some((cb, ctx)) = callback {
        cb(ctx, rat, edrx_seconds, paging_window_cs);
    }
}

/// `+CEREG` URC callback, registered on modules offering 3GPP power saving.
/// Feeds the extended form's active-time/periodic-TAU fields into the
/// instance's sleep context and, once both are known, notifies the
/// registered `psm_update` callback.
fn on_cereg_urc(body: &str, context: CellHandle) {
    let result = Registry::with_instance(context, |inst| {
        crate::sleep::on_cereg_urc(body, &mut inst.sleep);
        (
            inst.sleep.psm_update,
            inst.sleep.active_time_seconds_cereg,
            inst.sleep.periodic_wakeup_seconds_cereg,
        )
    });
    if let Ok((Some((cb, ctx)), Some(active), Some(periodic))) = result {
        cb(ctx, active, periodic);
    }
}

/// Runs the fixed configuration command list, then optionally drops the
/// radio with `AT+CFUN=<radio_off_cfun>`.
pub fn module_configure<U: UartPort, C: ClockTrait, const N: usize, P: OutputPin>(
    handle: CellHandle,
    client: &mut AtClient<U, C, N, P>,
    radio_off: bool,
    returning_from_sleep: bool,
) -> Result<(), Error> {
    let (kind, features) = Registry::with_instance(handle, |inst| {
        (inst.kind, inst.capability().features)
    })?;

    retry_command(client, "ATE0")?;
    #[cfg(feature = "numeric-errors")]
    retry_command(client, "AT+CMEE=1")?;
    #[cfg(not(feature = "numeric-errors"))]
    retry_command(client, "AT+CMEE=2")?;
    retry_command(client, "AT+UDCONF=1,0")?;
    retry_command(client, "ATI9")?;
    retry_command(client, "AT&C1")?;
    retry_command(client, "AT&D0")?;

    if features.contains(Features::UCGED5) {
        retry_command(client, "AT+UCGED=5")?;
    } else {
        retry_command(client, "AT+UCGED=2")?;
    }

    let hw_flow_control = query_flow_control(client).unwrap_or(false);
    retry_command(client, if hw_flow_control { "AT&K3" } else { "AT&K0" })?;

    if features.contains(Features::UART_POWER_SAVING) {
        config::configure_uart_power_saving(handle, client, hw_flow_control, returning_from_sleep)?;
    }

    if features.contains(Features::DEEP_SLEEP_URC) {
        retry_command(client, "AT+UPSMR=1")?;
        client.remove_urc_handler("+UUPSMR:");
        client.set_urc_handler("+UUPSMR:", on_uupsmr_urc, handle)?;
    }

    if kind == crate::capability::ModuleKind::SaraR4 && features.contains(Features::EDRX) {
        client.remove_urc_handler("+CEDRXP:");
        client.set_urc_handler("+CEDRXP:", on_cedrxp_urc, handle)?;
    }

    if features.contains(Features::POWER_SAVING_3GPP) {
        retry_command(client, "AT+CEREG=5")?;
        client.remove_urc_handler("+CEREG:");
        client.set_urc_handler("+CEREG:", on_cereg_urc, handle)?;
    }

    if features.contains(Features::MNO_PROFILE) {
        config::refresh_mno_profile(handle, client)?;
    }

    config::ackaiding_enable(handle, client)?;

    if radio_off {
        let last_flip = Registry::with_instance(handle, |inst| inst.last_cfun_flip_ms)?;
        if client.now_ms().wrapping_sub(last_flip) < AT_CFUN_FLIP_DELAY_SECONDS * 1000 {
            defmt::trace!("waiting out inter-CFUN delay");
            while client.now_ms().wrapping_sub(last_flip) < AT_CFUN_FLIP_DELAY_SECONDS * 1000 {}
        }
        let now = client.now_ms();
        let cfun = kind.capability().radio_off_cfun;
        let mut cmd: heapless::String<16> = heapless::String::new();
        let _ = core::fmt::write(&mut cmd, format_args!("AT+CFUN={cfun}"));

        // CFUN=0/4 responses can take much longer than the default AT
        // timeout while the module detaches from the network.
        let previous_timeout = client.timeout_ms();
        client.set_timeout(config::constants::AT_CFUN_OFF_RESPONSE_TIME_SECONDS * 1000);
        let result = retry_command(client, cmd.as_str());
        client.set_timeout(previous_timeout);
        result?;

        Registry::with_instance(handle, |inst| {
            inst.last_cfun_flip_ms = now;
        })?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::ModuleKind;
    use crate::port::{NoActivityPin, NoInputPin, Polarity};
    use crate::registry::PinSet;

    fn pins() -> PinSet {
        PinSet {
            enable_power: None,
            pwr_on: Some(Polarity::ActiveHigh),
            vint: None,
            dtr: None,
        }
    }

    #[test]
    fn power_off_hard_marks_instance_unavailable() {
        struct NoUart;
        impl UartPort for NoUart {
            type Error = ();
            fn write_byte(&mut self, _b: u8) -> Result<(), ()> {
                Ok(())
            }
            fn read_byte(&mut self) -> Result<Option<u8>, ()> {
                Ok(None)
            }
        }
        struct ZeroClock;
        impl ClockTrait for ZeroClock {
            fn now_ms(&self) -> u32 {
                0
            }
        }

        let handle = Registry::add(ModuleKind::SaraR5, pins(), false, false).unwrap();
        let mut client: AtClient<NoUart, ZeroClock, 32> = AtClient::new(NoUart, ZeroClock);
        let mut module_pins: ModulePins<NoActivityPin, NoActivityPin, NoInputPin> =
            ModulePins::new(None, None, None);
        power_off_hard(handle, &mut client, &mut module_pins, true).unwrap();
        let state = Registry::with_instance(handle, |inst| inst.deep_sleep_state).unwrap();
        assert_eq!(state, DeepSleepState::Unavailable);
        Registry::remove(handle).unwrap();
    }
}
