//! Named constants re-exported under one path so call sites read as
//! `constants::MAX_NUM_CONTEXTS` rather than bare numbers.

pub const AT_CFUN_OFF_RESPONSE_TIME_SECONDS: u32 = 40;
pub const POWER_SAVING_UART_INACTIVITY_TIMEOUT_SECONDS: u32 = 20;
pub const POWER_SAVING_UART_WAKEUP_MARGIN_MILLISECONDS: u32 = 100;
pub const UART_POWER_SAVING_DTR_READY_MS: u32 = 20;
pub const UART_POWER_SAVING_DTR_HYSTERESIS_MS: u32 = 20;
pub const MAX_NUM_CONTEXTS: usize = 4;
pub const MAX_URC_HANDLERS: usize = crate::at_client::MAX_URC_HANDLERS;
pub const MAX_INSTANCES: usize = crate::registry::MAX_INSTANCES;
pub const DEFAULT_AT_TIMEOUT_MS: u32 = crate::at_client::DEFAULT_AT_TIMEOUT_MS;
pub const CONFIGURATION_COMMAND_TRIES: u8 = crate::power::CONFIGURATION_COMMAND_TRIES;
pub const IS_ALIVE_ATTEMPTS_POWER_ON: u8 = crate::power::IS_ALIVE_ATTEMPTS_POWER_ON;
pub const AT_CFUN_FLIP_DELAY_SECONDS: u32 = crate::power::AT_CFUN_FLIP_DELAY_SECONDS;
pub const CPWROFF_WAIT_SECONDS: u32 = crate::power::CPWROFF_WAIT_SECONDS;
