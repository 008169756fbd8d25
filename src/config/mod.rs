//! Configuration helpers: RAT selection, band mask, PDP context install, MNO
//! profile, greeting, LWM2M disable, ack-aiding. Each follows the
//! read-then-conditionally-write pattern this codebase uses throughout.

pub mod constants;

use embedded_hal::digital::OutputPin;

use crate::at_client::AtClient;
use crate::capability::Features;
use crate::error::Error;
use crate::port::{Clock, UartPort};
use crate::registry::{CellHandle, Registry};

fn transact<U: UartPort, C: Clock, const N: usize, P: OutputPin>(
    client: &mut AtClient<U, C, N, P>,
    command: &str,
) -> Result<(), Error> {
    let mut lock = client.lock()?;
    lock.command_start(command)?;
    lock.command_stop()?;
    lock.response_stop()
}

fn query<U: UartPort, C: Clock, const N: usize, P: OutputPin>(
    client: &mut AtClient<U, C, N, P>,
    command: &str,
    prefix: &str,
) -> Result<heapless::String<{ crate::at_client::LINE_CAPACITY }>, Error> {
    // `{ }` wraps the const path since it isn't a bare literal.
    let mut lock = client.lock()?;
    lock.command_start(command)?;
    lock.command_stop()?;
    let line = lock.response_start(Some(prefix))?;
    lock.response_stop()?;
    Ok(line)
}

enum UpsvMode {
    /// Mode 1: module wakes on any RTS/CTS-gated UART activity.
    Data,
    /// Mode 2: module wakes when the host asserts the DTR-driven activity pin.
    Dtr,
    /// Mode 4: SARA-R4-only variant of `Data` for boards with no RTS/CTS wiring.
    SaraR4NoFlowControl,
}

fn upsv_numeric(mode: UpsvMode) -> u8 {
    match mode {
        UpsvMode::Data => 1,
        UpsvMode::Dtr => 2,
        UpsvMode::SaraR4NoFlowControl => 4,
    }
}

/// Chooses DATA/DTR/numeric UART power-saving mode and issues
/// `AT+UPSV=<mode>`, or leaves power saving off if neither the wiring nor
/// the platform supports it safely:
/// - DTR pin wired: `Dtr` mode, regardless of flow control.
/// - No DTR, but hardware flow control and the platform can suspend CTS:
///   `Data` mode.
/// - No DTR, hardware flow control, but the platform can't suspend CTS:
///   the host would starve the module of RTS service while asleep, so
///   power saving stays off and any stale wake-up handler is removed.
/// - No DTR, no flow control, SARA-R4: `SaraR4NoFlowControl`.
/// - No DTR, no flow control, any other module: power saving stays off.
pub fn configure_uart_power_saving<U: UartPort, C: Clock, const N: usize, P: OutputPin>(
    handle: CellHandle,
    client: &mut AtClient<U, C, N, P>,
    hw_flow_control: bool,
    returning_from_sleep: bool,
) -> Result<(), Error> {
    let _ = returning_from_sleep;
    let (kind, cts_suspend_capable, has_dtr) = Registry::with_instance(handle, |inst| {
        (inst.kind, inst.cts_suspend_capable, inst.pins.dtr.is_some())
    })?;

    let mode = if has_dtr {
        Some(UpsvMode::Dtr)
    } else if hw_flow_control {
        if cts_suspend_capable {
            Some(UpsvMode::Data)
        } else {
            None
        }
    } else if kind == crate::capability::ModuleKind::SaraR4 {
        Some(UpsvMode::SaraR4NoFlowControl)
    } else {
        None
    };

    let Some(mode) = mode else {
        client.remove_wake_up_handler();
        return Ok(());
    };

    let mut cmd: heapless::String<16> = heapless::String::new();
    let _ = core::fmt::write(&mut cmd, format_args!("AT+UPSV={}", upsv_numeric(mode)));
    let result = transact(client, cmd.as_str());
    if result.is_err() {
        client.remove_wake_up_handler();
    }
    result
}

/// Reads and caches the current `AT+UMNOPROF?` value.
pub fn refresh_mno_profile<U: UartPort, C: Clock, const N: usize, P: OutputPin>(
    handle: CellHandle,
    client: &mut AtClient<U, C, N, P>,
) -> Result<(), Error> {
    let line = query(client, "AT+UMNOPROF?", "+UMNOPROF:")?;
    let profile: u16 = line
        .trim_start_matches("+UMNOPROF:")
        .trim()
        .parse()
        .map_err(|_| Error::AtError)?;
    Registry::with_instance(handle, |inst| {
        inst.mno_profile = Some(profile);
    })?;
    Ok(())
}

/// Sets the MNO profile if it differs from the currently cached one,
/// flagging `reboot_is_required` on change.
pub fn mno_profile_set<U: UartPort, C: Clock, const N: usize, P: OutputPin>(
    handle: CellHandle,
    client: &mut AtClient<U, C, N, P>,
    wanted: u16,
) -> Result<(), Error> {
    refresh_mno_profile(handle, client)?;
    let current = Registry::with_instance(handle, |inst| inst.mno_profile)?;
    if current == Some(wanted) {
        return Ok(());
    }
    let mut cmd: heapless::String<20> = heapless::String::new();
    let _ = core::fmt::write(&mut cmd, format_args!("AT+UMNOPROF={wanted}"));
    transact(client, cmd.as_str())?;
    Registry::with_instance(handle, |inst| {
        inst.mno_profile = Some(wanted);
        inst.reboot_is_required = true;
    })?;
    Ok(())
}

/// Sets the sole RAT via `AT+URAT=<rat>` if the current selection differs,
/// flagging `reboot_is_required` on change.
pub fn rat_set<U: UartPort, C: Clock, const N: usize, P: OutputPin>(
    handle: CellHandle,
    client: &mut AtClient<U, C, N, P>,
    wanted_rat: u8,
) -> Result<(), Error> {
    let line = query(client, "AT+URAT?", "+URAT:")?;
    let body = line.trim_start_matches("+URAT:").trim();
    let mut fields = body.split(',');
    let primary: Option<u8> = fields.next().and_then(|s| s.trim().parse().ok());
    let has_secondary = fields.next().is_some();

    if primary == Some(wanted_rat) && !has_secondary {
        return Ok(());
    }

    {
        let mut lock = client.lock()?;
        lock.command_start("AT+URAT=")?;
        lock.write_int(wanted_rat as i32)?;
        lock.command_stop()?;
        lock.response_stop()?;
    }
    Registry::with_instance(handle, |inst| {
        inst.reboot_is_required = true;
    })?;
    Ok(())
}

/// Sets the Cat-M1/NB1 band mask via `AT+UBANDMASK=` if it differs and is
/// non-zero.
pub fn band_mask_set<U: UartPort, C: Clock, const N: usize, P: OutputPin>(
    client: &mut AtClient<U, C, N, P>,
    mask: u64,
) -> Result<(), Error> {
    if mask == 0 {
        return Ok(());
    }
    let line = query(client, "AT+UBANDMASK?", "+UBANDMASK:")?;
    let current: u64 = line
        .trim_start_matches("+UBANDMASK:")
        .trim()
        .split(',')
        .nth(1)
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0);
    if current == mask {
        return Ok(());
    }
    let mut cmd: heapless::String<48> = heapless::String::new();
    let _ = core::fmt::write(&mut cmd, format_args!("AT+UBANDMASK=1,{mask}"));
    transact(client, cmd.as_str())
}

/// Installs an APN into PDP context `context_id` if it differs from what's
/// currently configured; a read timeout is tolerated (treated as "unknown",
/// forcing a write).
pub fn context_set<U: UartPort, C: Clock, const N: usize, P: OutputPin>(
    client: &mut AtClient<U, C, N, P>,
    context_id: u8,
    apn: &str,
) -> Result<(), Error> {
    let current_apn = read_context_apn(client, context_id).unwrap_or_default();
    if current_apn == apn {
        return Ok(());
    }
    let mut lock = client.lock()?;
    lock.command_start("AT+CGDCONT=")?;
    lock.write_int(context_id as i32)?;
    lock.write_string("IP", true)?;
    lock.write_string(apn, true)?;
    lock.command_stop()?;
    lock.response_stop()
}

fn read_context_apn<U: UartPort, C: Clock, const N: usize, P: OutputPin>(
    client: &mut AtClient<U, C, N, P>,
    context_id: u8,
) -> Result<heapless::String<64>, Error> {
    for _ in 0..constants::MAX_NUM_CONTEXTS {
        let line = query(client, "AT+CGDCONT?", "+CGDCONT:")?;
        let body = line.trim_start_matches("+CGDCONT:").trim();
        let mut fields = body.split(',');
        let id: Option<u8> = fields.next().and_then(|s| s.trim().parse().ok());
        if id == Some(context_id) {
            let _pdp_type = fields.next();
            let apn = fields
                .next()
                .unwrap_or("")
                .trim()
                .trim_matches('"');
            return heapless::String::try_from(apn).map_err(|_| Error::NoMemory);
        }
    }
    Err(Error::NotConfigured)
}

/// `AT+CSGT="<greeting>"` so a spontaneous reboot shows up as a URC line.
pub fn greeting_set<U: UartPort, C: Clock, const N: usize, P: OutputPin>(
    client: &mut AtClient<U, C, N, P>,
    greeting: &str,
) -> Result<(), Error> {
    let mut cmd: heapless::String<64> = heapless::String::new();
    let _ = core::fmt::write(&mut cmd, format_args!("AT+CSGT=1,\"{greeting}\""));
    transact(client, cmd.as_str())
}

/// Enables LWM2M's `ULWM2M` flag if it isn't already, flagging
/// `reboot_is_required` on the 0->1 transition.
pub fn lwm2m_disable<U: UartPort, C: Clock, const N: usize, P: OutputPin>(
    handle: CellHandle,
    client: &mut AtClient<U, C, N, P>,
) -> Result<(), Error> {
    let line = query(client, "AT+ULWM2M?", "+ULWM2M:")?;
    let current: u8 = line
        .trim_start_matches("+ULWM2M:")
        .trim()
        .parse()
        .unwrap_or(0);
    if current == 1 {
        return Ok(());
    }
    transact(client, "AT+ULWM2M=1")?;
    Registry::with_instance(handle, |inst| {
        inst.reboot_is_required = true;
    })?;
    Ok(())
}

/// `UBX-CFG-VALSET` frame enabling `CFG_NAVSPG_ACKAIDING` (key `0x10110025`)
/// in the RAM layer with value 1: sync `B5 62`, class/id `06 8A`, a 9-byte
/// payload (version 0, RAM-layer mask, 2 reserved bytes, little-endian key,
/// value), then its Fletcher-8 checksum.
const UBX_CFG_VALSET_ACKAIDING_FRAME: [u8; 17] = [
    0xB5, 0x62, 0x06, 0x8A, 0x09, 0x00, 0x00, 0x01, 0x00, 0x00, 0x25, 0x00, 0x11, 0x10, 0x01, 0xE1,
    0x3E,
];

fn hex_encode_ubx_frame(frame: &[u8]) -> heapless::String<48> {
    let mut s = heapless::String::new();
    for b in frame {
        let _ = core::fmt::write(&mut s, format_args!("{b:02X}"));
    }
    s
}

/// Ack-aiding configuration: `AT+CFG-NAVX5` on pre-M10 modules, a
/// `UBX-CFG-VALSET` of `CFG_NAVSPG_ACKAIDING` passed through via
/// `AT+UGUBX=<hex>` on M10.
pub fn ackaiding_enable<U: UartPort, C: Clock, const N: usize, P: OutputPin>(
    handle: CellHandle,
    client: &mut AtClient<U, C, N, P>,
) -> Result<(), Error> {
    let features = Registry::with_instance(handle, |inst| inst.capability().features)?;
    if features.contains(Features::ACKAIDING_VIA_CFG_VAL) {
        let hex = hex_encode_ubx_frame(&UBX_CFG_VALSET_ACKAIDING_FRAME);
        let mut cmd: heapless::String<64> = heapless::String::new();
        let _ = core::fmt::write(&mut cmd, format_args!("AT+UGUBX={}", hex.as_str()));
        transact(client, cmd.as_str())
    } else {
        transact(client, "AT+CFG-NAVX5=2,\"0040\",\"0040\"")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use crate::capability::ModuleKind;
    use crate::registry::PinSet;

    struct FakeUart {
        rx: RefCell<heapless::Deque<u8, 256>>,
        tx: RefCell<heapless::Vec<u8, 256>>,
    }

    impl FakeUart {
        fn new(script: &[u8]) -> Self {
            let mut rx = heapless::Deque::new();
            for &b in script {
                let _ = rx.push_back(b);
            }
            Self {
                rx: RefCell::new(rx),
                tx: RefCell::new(heapless::Vec::new()),
            }
        }

        fn sent(&self) -> heapless::Vec<u8, 256> {
            self.tx.borrow().clone()
        }
    }

    impl UartPort for &FakeUart {
        type Error = ();

        fn write_byte(&mut self, byte: u8) -> Result<(), ()> {
            let _ = self.tx.borrow_mut().push(byte);
            Ok(())
        }

        fn read_byte(&mut self) -> Result<Option<u8>, ()> {
            Ok(self.rx.borrow_mut().pop_front())
        }
    }

    struct FakeClock {
        ms: RefCell<u32>,
    }

    impl Clock for &FakeClock {
        fn now_ms(&self) -> u32 {
            let mut ms = self.ms.borrow_mut();
            *ms += 1;
            *ms
        }
    }

    fn pins() -> PinSet {
        PinSet {
            enable_power: None,
            pwr_on: None,
            vint: None,
            dtr: None,
        }
    }

    #[test]
    fn ackaiding_enable_sends_ugubx_with_expected_hex_on_m10() {
        let uart = FakeUart::new(b"\r\nOK\r\n");
        let clock = FakeClock { ms: RefCell::new(0) };
        let mut client: AtClient<&FakeUart, &FakeClock, 64> = AtClient::new(&uart, &clock);
        let handle = Registry::add(ModuleKind::SaraR5, pins(), false, false).unwrap();

        ackaiding_enable(handle, &mut client).unwrap();

        let sent = uart.sent();
        let text = core::str::from_utf8(&sent).unwrap();
        assert_eq!(text, "AT+UGUBX=B562068A0900000100002500111001E13E\r");
        Registry::remove(handle).unwrap();
    }

    #[test]
    fn uart_power_saving_disables_when_flow_control_present_but_not_suspendable() {
        let uart = FakeUart::new(b"");
        let clock = FakeClock { ms: RefCell::new(0) };
        let mut client: AtClient<&FakeUart, &FakeClock, 64> = AtClient::new(&uart, &clock);
        let handle = Registry::add(ModuleKind::SaraR5, pins(), false, false).unwrap();

        configure_uart_power_saving(handle, &mut client, true, false).unwrap();

        assert!(uart.sent().is_empty());
        Registry::remove(handle).unwrap();
    }

    #[test]
    fn uart_power_saving_picks_numeric_mode_on_sara_r4_without_flow_control() {
        let uart = FakeUart::new(b"\r\nOK\r\n");
        let clock = FakeClock { ms: RefCell::new(0) };
        let mut client: AtClient<&FakeUart, &FakeClock, 64> = AtClient::new(&uart, &clock);
        let handle = Registry::add(ModuleKind::SaraR4, pins(), false, false).unwrap();

        configure_uart_power_saving(handle, &mut client, false, false).unwrap();

        let sent = uart.sent();
        let text = core::str::from_utf8(&sent).unwrap();
        assert_eq!(text, "AT+UPSV=4\r");
        Registry::remove(handle).unwrap();
    }

    #[test]
    fn context_set_inserts_commas_between_parameters() {
        let uart = FakeUart::new(b"\r\n+CGDCONT: 1,\"IP\",\"old\"\r\nOK\r\n\r\nOK\r\n");
        let clock = FakeClock { ms: RefCell::new(0) };
        let mut client: AtClient<&FakeUart, &FakeClock, 64> = AtClient::new(&uart, &clock);

        context_set(&mut client, 1, "new.apn").unwrap();

        let sent = uart.sent();
        let text = core::str::from_utf8(&sent).unwrap();
        assert!(text.ends_with("AT+CGDCONT=1,\"IP\",\"new.apn\"\r"));
    }

    #[test]
    fn band_mask_set_skips_zero_mask() {
        struct PanicUart;
        impl UartPort for PanicUart {
            type Error = ();
            fn write_byte(&mut self, _b: u8) -> Result<(), ()> {
                panic!("should not write when mask is zero");
            }
            fn read_byte(&mut self) -> Result<Option<u8>, ()> {
                Ok(None)
            }
        }
        struct ZeroClock;
        impl Clock for ZeroClock {
            fn now_ms(&self) -> u32 {
                0
            }
        }
        let mut client: AtClient<PanicUart, ZeroClock, 32> = AtClient::new(PanicUart, ZeroClock);
        assert!(band_mask_set(&mut client, 0).is_ok());
    }
}
