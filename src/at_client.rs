//! AT command/response/URC engine. One `AtClient` per UART. Commands are
//! built through an `AtLock`, the only way to drive the wire, so the borrow
//! checker enforces "at most one outstanding transaction".

use embedded_hal::digital::OutputPin;

use crate::error::{DeviceError, DeviceErrorKind, Error};
use crate::port::{Clock, NoActivityPin, OutPin, Polarity, UartPort};
use crate::registry::{CellHandle, Registry};
use crate::ring_buffer::RingBuffer;

pub const MAX_URC_HANDLERS: usize = 8;
pub const MAX_DEFERRED_CALLBACKS: usize = 8;
pub const LINE_CAPACITY: usize = 128;
pub const DEFAULT_AT_TIMEOUT_MS: u32 = 10_000;

pub type UrcCallback = fn(body: &str, context: CellHandle);
pub type WakeUpCallback = fn(context: CellHandle) -> Result<(), Error>;

struct UrcHandler {
    prefix: heapless::String<16>,
    callback: UrcCallback,
    context: CellHandle,
}

struct WakeUpHandler {
    callback: WakeUpCallback,
    context: CellHandle,
    inactivity_ms: u32,
}

struct DeferredCallback {
    callback: UrcCallback,
    context: CellHandle,
    body: heapless::String<LINE_CAPACITY>,
}

/// A GPIO that must be asserted, with `ready_ms` lead time, whenever the
/// module is expected to be listening, and released after `hysteresis_ms` of
/// transmit idle. Used by the DTR-driven wake mode.
struct ActivityPin<P: OutputPin> {
    pin: OutPin<P>,
    ready_ms: u32,
    hysteresis_ms: u32,
    asserted: bool,
}

/// Owns one UART. `RX_N` sizes the receive ring buffer. The parser moves
/// through the same four phases on every transaction: `command_start` is
/// Idle/MatchPrefix on the wire, `response_start`/`read_*` is ReadParams,
/// and `response_stop` is MatchStopTag. `P` is the optional activity-pin
/// type; it defaults to a no-op pin so clients without a DTR-driven wake
/// mode never have to name it.
pub struct AtClient<U: UartPort, C: Clock, const RX_N: usize, P: OutputPin = NoActivityPin> {
    uart: U,
    clock: C,
    rx: RingBuffer<RX_N>,
    timeout_ms: u32,
    locked: bool,
    urc_handlers: heapless::Vec<UrcHandler, MAX_URC_HANDLERS>,
    wake_up: Option<WakeUpHandler>,
    activity: Option<ActivityPin<P>>,
    deferred: heapless::Deque<DeferredCallback, MAX_DEFERRED_CALLBACKS>,
    last_device_error: Option<DeviceError>,
    last_tx_ms: u32,
    pending_line: Option<heapless::String<LINE_CAPACITY>>,
}

impl<U: UartPort, C: Clock, const RX_N: usize, P: OutputPin> AtClient<U, C, RX_N, P> {
    pub fn new(uart: U, clock: C) -> Self {
        Self {
            uart,
            clock,
            rx: RingBuffer::new(),
            timeout_ms: DEFAULT_AT_TIMEOUT_MS,
            locked: false,
            urc_handlers: heapless::Vec::new(),
            wake_up: None,
            activity: None,
            deferred: heapless::Deque::new(),
            last_device_error: None,
            last_tx_ms: 0,
            pending_line: None,
        }
    }

    /// Configures the DTR-driven wake-mode activity pin. Asserted (with
    /// `ready_ms` lead time) before the next transaction whenever it was
    /// released, and released once `hysteresis_ms` of transmit idle has
    /// passed.
    pub fn set_activity_pin(&mut self, pin: P, ready_ms: u32, hysteresis_ms: u32, asserted_high: bool) {
        let polarity = if asserted_high {
            Polarity::ActiveHigh
        } else {
            Polarity::ActiveLow
        };
        self.activity = Some(ActivityPin {
            pin: OutPin::new(pin, polarity),
            ready_ms,
            hysteresis_ms,
            asserted: false,
        });
    }

    /// Releases the activity pin if transmit has been idle past its
    /// hysteresis window, then asserts it (spin-waiting out `ready_ms`) if it
    /// isn't already, ahead of the transaction `lock()` is about to open.
    fn service_activity_pin(&mut self) {
        let Some(act) = self.activity.as_mut() else {
            return;
        };
        let idle_ms = self.clock.now_ms().wrapping_sub(self.last_tx_ms);
        if act.asserted && idle_ms >= act.hysteresis_ms {
            let _ = act.pin.deassert();
            act.asserted = false;
        }
        if !act.asserted {
            let _ = act.pin.assert();
            act.asserted = true;
            let deadline = self.clock.now_ms().wrapping_add(act.ready_ms);
            while self.clock.now_ms() < deadline {}
        }
    }

    pub fn set_timeout(&mut self, ms: u32) {
        self.timeout_ms = ms;
    }

    pub fn set_urc_handler(
        &mut self,
        prefix: &str,
        callback: UrcCallback,
        context: CellHandle,
    ) -> Result<(), Error> {
        let prefix = heapless::String::try_from(prefix).map_err(|_| Error::InvalidParameter)?;
        self.urc_handlers
            .push(UrcHandler {
                prefix,
                callback,
                context,
            })
            .map_err(|_| Error::NoMemory)
    }

    pub fn remove_urc_handler(&mut self, prefix: &str) {
        self.urc_handlers.retain(|h| h.prefix.as_str() != prefix);
    }

    pub fn set_wake_up_handler(
        &mut self,
        callback: WakeUpCallback,
        context: CellHandle,
        inactivity_ms: u32,
    ) {
        self.wake_up = Some(WakeUpHandler {
            callback,
            context,
            inactivity_ms,
        });
    }

    pub fn is_wake_up_handler_set(&self) -> bool {
        self.wake_up.is_some()
    }

    pub fn remove_wake_up_handler(&mut self) {
        self.wake_up = None;
    }

    pub fn last_device_error(&self) -> Option<DeviceError> {
        self.last_device_error
    }

    /// Exposes the client's monotonic clock so callers (the power state
    /// machine) can spin-wait on inter-command delays without needing their
    /// own `Clock` handle.
    pub fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    /// Exposes the currently configured transaction timeout so callers can
    /// save it off, temporarily raise it for a slow command, and restore it.
    pub fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    pub fn flush(&mut self) {
        self.rx.reset();
        while self.uart.read_byte().ok().flatten().is_some() {}
    }

    /// Acquires the transmit lock. Returns `Error::NotConnected` if a
    /// transaction is already outstanding (the caller dropped a prior
    /// `AtLock` incorrectly, or is re-entering from a URC callback).
    pub fn lock(&mut self) -> Result<AtLock<'_, U, C, RX_N, P>, Error> {
        if self.locked {
            return Err(Error::NotConnected);
        }
        self.service_activity_pin();
        self.maybe_wake_up()?;
        self.locked = true;
        self.last_device_error = None;
        Ok(AtLock {
            client: self,
            deadline_ms: None,
            param_count: 0,
        })
    }

    fn maybe_wake_up(&mut self) -> Result<(), Error> {
        let Some(wake) = self.wake_up.as_ref() else {
            return Ok(());
        };
        let idle_ms = self.clock.now_ms().wrapping_sub(self.last_tx_ms);
        if idle_ms < wake.inactivity_ms {
            return Ok(());
        }
        let callback = wake.callback;
        let context = wake.context;
        let _ = Registry::with_instance(context, |inst| inst.in_wake_up_callback = true);
        let result = (callback)(context);
        let _ = Registry::with_instance(context, |inst| inst.in_wake_up_callback = false);
        result
    }

    /// Drains input directly into the ring buffer, dispatching any complete
    /// URC line it finds instead of returning it to the caller.
    fn pump_rx(&mut self) -> Result<(), Error> {
        while let Some(byte) = self.uart.read_byte().map_err(|_| Error::PlatformError)? {
            self.rx.add(&[byte]);
        }
        self.dispatch_urcs();
        Ok(())
    }

    fn dispatch_urcs(&mut self) {
        loop {
            let Some(line) = self.peek_line(true) else {
                return;
            };
            let Some(handler) = self
                .urc_handlers
                .iter()
                .find(|h| line.starts_with(h.prefix.as_str()))
            else {
                return;
            };
            let body = line
                .as_str()
                .trim_start_matches(handler.prefix.as_str())
                .trim_start()
                .to_owned_bounded();
            let callback = handler.callback;
            let context = handler.context;
            let queued = self.deferred.push_back(DeferredCallback {
                callback,
                context,
                body,
            });
            if queued.is_err() {
                defmt::warn!("deferred callback queue full, dropping URC");
            }
            self.consume_line();
        }
    }

    /// Looks at (but, unless `consume` leaves it queued, does not remove) the
    /// next complete line in the ring buffer.
    fn peek_line(&mut self, _consume: bool) -> Option<heapless::String<LINE_CAPACITY>> {
        let mut scratch = [0u8; LINE_CAPACITY];
        let n = self.rx.data_size().min(LINE_CAPACITY);
        if n == 0 {
            return None;
        }
        let read = self.rx.read(&mut scratch[..n]);
        let Ok(text) = core::str::from_utf8(&scratch[..read]) else {
            // Not (yet) valid UTF-8 as a whole; put it all back and wait for
            // more bytes to arrive.
            self.rx.add(&scratch[..read]);
            return None;
        };
        let Some(line_end) = text.find('\n') else {
            self.rx.add(&scratch[..read]);
            return None;
        };
        let line = text[..line_end]
            .trim_matches(|c| c == '\r' || c == '\n')
            .to_owned_bounded();
        // Put back everything after the consumed line; we only "peek" the
        // ring buffer destructively because it has no non-destructive cursor,
        // so re-queue the remainder immediately.
        let remainder = &text.as_bytes()[line_end + 1..];
        self.rx.add(remainder);
        self.pending_line = Some(line.clone());
        Some(line)
    }

    fn consume_line(&mut self) {
        self.pending_line = None;
    }

    fn next_line_blocking(&mut self, deadline_ms: u32) -> Result<heapless::String<LINE_CAPACITY>, Error> {
        loop {
            self.pump_rx()?;
            if let Some(line) = self.pending_line.take() {
                if !line.is_empty() {
                    return Ok(line);
                }
            }
            if self.clock.now_ms() >= deadline_ms {
                return Err(Error::Timeout);
            }
        }
    }

    pub fn poll_deferred_callbacks(&mut self) {
        while let Some(cb) = self.deferred.pop_front() {
            (cb.callback)(cb.body.as_str(), cb.context);
        }
    }
}

trait ToOwnedBounded {
    fn to_owned_bounded(&self) -> heapless::String<LINE_CAPACITY>;
}

impl ToOwnedBounded for str {
    fn to_owned_bounded(&self) -> heapless::String<LINE_CAPACITY> {
        heapless::String::try_from(self).unwrap_or_default()
    }
}

/// RAII transaction guard. All command-building and response-reading methods
/// live here so a second `lock()` cannot succeed while one is outstanding.
pub struct AtLock<'a, U: UartPort, C: Clock, const RX_N: usize, P: OutputPin = NoActivityPin> {
    client: &'a mut AtClient<U, C, RX_N, P>,
    deadline_ms: Option<u32>,
    param_count: u32,
}

impl<'a, U: UartPort, C: Clock, const RX_N: usize, P: OutputPin> AtLock<'a, U, C, RX_N, P> {
    fn deadline(&mut self) -> u32 {
        *self.deadline_ms.get_or_insert_with(|| {
            self.client.clock.now_ms() + self.client.timeout_ms
        })
    }

    fn write_str(&mut self, s: &str) -> Result<(), Error> {
        for b in s.as_bytes() {
            self.client
                .uart
                .write_byte(*b)
                .map_err(|_| Error::PlatformError)?;
        }
        self.client.last_tx_ms = self.client.clock.now_ms();
        Ok(())
    }

    pub fn command_start(&mut self, prefix: &str) -> Result<(), Error> {
        self.param_count = 0;
        self.write_str(prefix)
    }

    /// Writes a `,` ahead of every parameter after the first, so callers can
    /// build a comma-separated command purely from a sequence of
    /// `write_int`/`write_string`/`write_bytes` calls.
    fn write_param_separator(&mut self) -> Result<(), Error> {
        if self.param_count > 0 {
            self.write_str(",")?;
        }
        self.param_count += 1;
        Ok(())
    }

    pub fn write_int(&mut self, value: i32) -> Result<(), Error> {
        self.write_param_separator()?;
        let buf = itoa_buf(value);
        self.write_str(buf.as_str())
    }

    pub fn write_string(&mut self, value: &str, quote: bool) -> Result<(), Error> {
        self.write_param_separator()?;
        if quote {
            self.write_str("\"")?;
            self.write_str(value)?;
            self.write_str("\"")
        } else {
            self.write_str(value)
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.write_param_separator()?;
        for b in bytes {
            self.client
                .uart
                .write_byte(*b)
                .map_err(|_| Error::PlatformError)?;
        }
        Ok(())
    }

    pub fn command_stop(&mut self) -> Result<(), Error> {
        self.write_str("\r")
    }

    pub fn command_stop_read_response(&mut self) -> Result<heapless::String<LINE_CAPACITY>, Error> {
        self.command_stop()?;
        let deadline = self.deadline();
        self.client.next_line_blocking(deadline)
    }

    pub fn response_start(&mut self, prefix: Option<&str>) -> Result<heapless::String<LINE_CAPACITY>, Error> {
        let deadline = self.deadline();
        loop {
            let line = self.client.next_line_blocking(deadline)?;
            if is_terminal_line(&line) {
                self.record_terminal(&line)?;
                return Err(Error::AtError);
            }
            match prefix {
                Some(p) if !line.starts_with(p) => continue,
                _ => return Ok(line),
            }
        }
    }

    pub fn read_int(&self, line: &str, index: usize) -> Result<i32, Error> {
        field(line, index)?
            .trim()
            .parse()
            .map_err(|_| Error::AtError)
    }

    pub fn read_string<'b>(&self, line: &'b str, index: usize) -> Result<&'b str, Error> {
        Ok(field(line, index)?.trim().trim_matches('"'))
    }

    pub fn skip_parameters(&self, _line: &str, _count: usize) {}

    pub fn response_stop(&mut self) -> Result<(), Error> {
        let deadline = self.deadline();
        loop {
            let line = self.client.next_line_blocking(deadline)?;
            if line == "OK" {
                return Ok(());
            }
            if is_terminal_line(&line) {
                return self.record_terminal(&line);
            }
        }
    }

    fn record_terminal(&mut self, line: &str) -> Result<(), Error> {
        if line == "ERROR" {
            return Err(Error::AtError);
        }
        if let Some(rest) = line.strip_prefix("+CME ERROR: ") {
            let code: u16 = rest.trim().parse().unwrap_or(0);
            let err = DeviceError {
                kind: DeviceErrorKind::Cme,
                code,
            };
            self.client.last_device_error = Some(err);
            return Err(err.into());
        }
        if let Some(rest) = line.strip_prefix("+CMS ERROR: ") {
            let code: u16 = rest.trim().parse().unwrap_or(0);
            let err = DeviceError {
                kind: DeviceErrorKind::Cms,
                code,
            };
            self.client.last_device_error = Some(err);
            return Err(err.into());
        }
        Ok(())
    }
}

impl<'a, U: UartPort, C: Clock, const RX_N: usize, P: OutputPin> Drop for AtLock<'a, U, C, RX_N, P> {
    fn drop(&mut self) {
        self.client.locked = false;
    }
}

fn is_terminal_line(line: &str) -> bool {
    line == "OK" || line == "ERROR" || line.starts_with("+CME ERROR") || line.starts_with("+CMS ERROR")
}

fn field(line: &str, index: usize) -> Result<&str, Error> {
    line.split(',').nth(index).ok_or(Error::AtError)
}

fn itoa_buf(value: i32) -> heapless::String<12> {
    let mut s = heapless::String::new();
    let _ = core::fmt::write(&mut s, format_args!("{value}"));
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;

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
    }

    impl UartPort for &FakeUart {
        type Error = ();

        fn write_byte(&mut self, byte: u8) -> Result<(), Self::Error> {
            let _ = self.tx.borrow_mut().push(byte);
            Ok(())
        }

        fn read_byte(&mut self) -> Result<Option<u8>, Self::Error> {
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

    #[test]
    fn command_stop_then_response_stop_returns_ok() {
        let uart = FakeUart::new(b"\r\nOK\r\n");
        let clock = FakeClock { ms: RefCell::new(0) };
        let mut client: AtClient<&FakeUart, &FakeClock, 64> = AtClient::new(&uart, &clock);
        let mut lock = client.lock().unwrap();
        lock.command_start("AT").unwrap();
        lock.command_stop().unwrap();
        let result = lock.response_stop();
        assert!(result.is_ok());
    }

    #[test]
    fn cme_error_is_parsed_and_recorded() {
        let uart = FakeUart::new(b"\r\n+CME ERROR: 3\r\n");
        let clock = FakeClock { ms: RefCell::new(0) };
        let mut client: AtClient<&FakeUart, &FakeClock, 64> = AtClient::new(&uart, &clock);
        let mut lock = client.lock().unwrap();
        let result = lock.response_stop();
        assert_eq!(
            result,
            Err(Error::DeviceError(DeviceError {
                kind: DeviceErrorKind::Cme,
                code: 3,
            }))
        );
    }

    #[test]
    fn second_lock_while_outstanding_is_rejected() {
        let uart = FakeUart::new(b"");
        let clock = FakeClock { ms: RefCell::new(0) };
        let mut client: AtClient<&FakeUart, &FakeClock, 64> = AtClient::new(&uart, &clock);
        // Simulates re-entrant access (e.g. from a URC callback) which the
        // borrow checker can't model with two safe `&mut` calls on the same
        // binding: take a second raw-pointer view to exercise the runtime
        // `locked` guard that `lock()` falls back on in that case.
        let client_ptr: *mut AtClient<&FakeUart, &FakeClock, 64> = &mut client;
        let _first = unsafe { (*client_ptr).lock() }.unwrap();
        assert_eq!(unsafe { (*client_ptr).lock() }.err(), Some(Error::NotConnected));
    }
}
