//! Crate-wide error type. Plain enum propagated with `?`, no `std::error::Error`
//! impl since this crate is `#![no_std]`.

/// Whether a structured device error came back as `+CME ERROR` or `+CMS ERROR`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum DeviceErrorKind {
    Cme,
    Cms,
}

/// A structured `+CME ERROR: <code>` / `+CMS ERROR: <code>` result.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub code: u16,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum Error {
    /// The registry or an `AtClient` was used before `init`/`new`.
    NotInitialised,
    /// A caller-supplied parameter is out of range or malformed.
    InvalidParameter,
    /// The port layer (UART or GPIO) returned an error.
    PlatformError,
    /// The modem replied with plain `ERROR` or a line the parser rejected.
    AtError,
    /// The modem replied with a structured `+CME`/`+CMS ERROR`.
    DeviceError(DeviceError),
    /// No reply was seen inside the current timeout.
    NotResponding,
    /// The module has not completed `module_configure` yet.
    NotConfigured,
    /// This module variant does not support the requested feature.
    NotSupported,
    /// No transport is currently available (e.g. asleep, or never powered on).
    NotConnected,
    /// A SIM PIN is required but this crate does not manage SIM security.
    PinEntryNotSupported,
    /// A bounded collection (handle table, URC table, queue) is full.
    NoMemory,
    /// A blocking call exceeded its deadline.
    Timeout,
    /// `keep_going` returned `false`.
    Cancelled,
}

impl From<DeviceError> for Error {
    fn from(e: DeviceError) -> Self {
        Error::DeviceError(e)
    }
}
