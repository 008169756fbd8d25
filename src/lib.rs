//! AT-command engine and power/sleep state machine for u-blox cellular
//! modules (SARA-R4/R5/R422, LARA-R6, SARA-U201).

#![no_std]

pub mod at_client;
pub mod capability;
pub mod config;
pub mod error;
pub mod port;
pub mod power;
pub mod registry;
pub mod ring_buffer;
pub mod sleep;

pub use at_client::{AtClient, AtLock};
pub use capability::{ModuleCapability, ModuleKind};
pub use error::{DeviceError, DeviceErrorKind, Error};
pub use power::ModulePins;
pub use registry::{CellHandle, CellInstance, PinSet, Registry};
