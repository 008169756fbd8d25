//! 3GPP PSM (T3324/T3412) and eDRX information-element codecs, deep-sleep
//! state tracking, and the URC parsers that feed them (`+UUPSMR`,
//! `+CEDRXP`, `+CEREG`).

use embedded_hal::digital::OutputPin;

use crate::at_client::AtClient;
use crate::capability::ModuleKind;
use crate::error::Error;
use crate::port::{Clock, UartPort};
use crate::registry::CellHandle;

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum DeepSleepState {
    Unknown,
    Unavailable,
    ProtocolStackAsleep,
    Asleep,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum Rat {
    Gsm,
    Cat1,
    CatM1,
    Nb1,
}

/// Notified with the network-negotiated active-time/periodic-TAU once an
/// extended `+CEREG` URC carries them.
pub type PsmUpdateCallback = fn(context: CellHandle, active_time_seconds: u32, periodic_wakeup_seconds: u32);

/// Notified with the assigned eDRX/paging-window values once `+CEDRXP`
/// arrives.
pub type EdrxUpdateCallback = fn(context: CellHandle, rat: Rat, edrx_seconds: u32, paging_window_centiseconds: u32);

/// Notified once `power::power_on` succeeds after starting from
/// `DeepSleepState::Asleep`.
pub type DeepSleepWakeCallback = fn(context: CellHandle);

/// Per-instance sleep bookkeeping, created lazily the first time PSM, eDRX,
/// or a wake-up callback is configured.
#[derive(Default)]
pub struct SleepContext {
    pub power_saving_3gpp_agreed: bool,
    pub power_saving_3gpp_on_not_off_cereg: bool,
    pub active_time_seconds_cereg: Option<u32>,
    pub periodic_wakeup_seconds_cereg: Option<u32>,
    pub psm_update: Option<(PsmUpdateCallback, CellHandle)>,
    pub edrx_update: Option<(EdrxUpdateCallback, CellHandle)>,
    pub deep_sleep_wake: Option<(DeepSleepWakeCallback, CellHandle)>,
}

/// Saved `AT+UPSV` mode and inactivity timeout while the user has
/// temporarily disabled UART power saving (e.g. for a firmware update),
/// so it can be restored afterwards.
pub struct UartSleepCache {
    pub upsv_mode: u8,
    pub inactivity_timeout_seconds: u32,
}

// ---- Active-time IE (T3324, GPRS-Timer-2) ----
//
// bits 8-6 unit, bits 5-1 count (0..31).
const T3324_UNIT_2S: u8 = 0b000;
const T3324_UNIT_1MIN: u8 = 0b001;
const T3324_UNIT_DECIHOUR: u8 = 0b010;
const T3324_UNIT_DEACTIVATED: u8 = 0b111;

/// Encodes a requested active time into the 8-bit GPRS-Timer-2 value. Picks
/// the smallest unit whose 5-bit count can express a value `<=` the request
/// (never rounds up past what was asked for T3324, which bounds how long the
/// device promises to keep listening).
pub fn encode_active_time(seconds: u32) -> u8 {
    if seconds == 0 {
        return (T3324_UNIT_DEACTIVATED << 5) | 0;
    }
    let count_2s = seconds / 2;
    if count_2s <= 31 {
        return (T3324_UNIT_2S << 5) | (count_2s as u8);
    }
    let count_1min = seconds / 60;
    if count_1min <= 31 {
        return (T3324_UNIT_1MIN << 5) | (count_1min as u8);
    }
    let count_decihour = seconds / 360;
    let count_decihour = count_decihour.min(31);
    (T3324_UNIT_DECIHOUR << 5) | (count_decihour as u8)
}

pub fn decode_active_time(value: u8) -> u32 {
    let unit = (value >> 5) & 0b111;
    let count = (value & 0b1_1111) as u32;
    match unit {
        x if x == T3324_UNIT_2S => count * 2,
        x if x == T3324_UNIT_1MIN => count * 60,
        x if x == T3324_UNIT_DECIHOUR => count * 360,
        _ => 0,
    }
}

/// Formats `value` as the 8-character `"0"`/`"1"` bit string `AT+CPSMS` wants.
pub fn active_time_to_bitstring(value: u8) -> heapless::String<8> {
    byte_to_bitstring(value)
}

// ---- Periodic wake-up IE (T3412-ext, GPRS-Timer-3) ----
const T3412_EXT_UNIT_10MIN: u8 = 0b000;
const T3412_EXT_UNIT_1H: u8 = 0b001;
const T3412_EXT_UNIT_10H: u8 = 0b010;
const T3412_EXT_UNIT_2S: u8 = 0b011;
const T3412_EXT_UNIT_30S: u8 = 0b100;
const T3412_EXT_UNIT_1MIN: u8 = 0b101;
const T3412_EXT_UNIT_320H: u8 = 0b110;
const T3412_EXT_UNIT_DEACTIVATED: u8 = 0b111;

/// Encodes a requested periodic TAU/wake-up interval into the 8-bit
/// GPRS-Timer-3 (T3412-ext) value. Picks the smallest unit whose 5-bit count
/// is `>=` the request, clamping to the largest representable value of the
/// coarsest unit rather than exceeding the table.
pub fn encode_periodic_wakeup(seconds: u32) -> u8 {
    if seconds == 0 {
        return (T3412_EXT_UNIT_DEACTIVATED << 5) | 0;
    }
    let candidates: [(u8, u32); 6] = [
        (T3412_EXT_UNIT_2S, 2),
        (T3412_EXT_UNIT_30S, 30),
        (T3412_EXT_UNIT_1MIN, 60),
        (T3412_EXT_UNIT_10MIN, 600),
        (T3412_EXT_UNIT_1H, 3600),
        (T3412_EXT_UNIT_10H, 36000),
    ];
    for (unit, quantum) in candidates {
        let count = div_ceil_u32(seconds, quantum);
        if count <= 31 {
            return (unit << 5) | (count as u8);
        }
    }
    let count = (seconds / 320 / 3600).min(31);
    (T3412_EXT_UNIT_320H << 5) | (count as u8)
}

pub fn decode_periodic_wakeup(value: u8) -> u32 {
    let unit = (value >> 5) & 0b111;
    let count = (value & 0b1_1111) as u32;
    match unit {
        x if x == T3412_EXT_UNIT_10MIN => count * 600,
        x if x == T3412_EXT_UNIT_1H => count * 3600,
        x if x == T3412_EXT_UNIT_10H => count * 36000,
        x if x == T3412_EXT_UNIT_2S => count * 2,
        x if x == T3412_EXT_UNIT_30S => count * 30,
        x if x == T3412_EXT_UNIT_1MIN => count * 60,
        x if x == T3412_EXT_UNIT_320H => count * 320 * 3600,
        _ => 0,
    }
}

pub fn periodic_wakeup_to_bitstring(value: u8) -> heapless::String<8> {
    byte_to_bitstring(value)
}

fn byte_to_bitstring(value: u8) -> heapless::String<8> {
    let mut s = heapless::String::new();
    for i in (0..8).rev() {
        let bit = (value >> i) & 1;
        let _ = s.push(if bit == 1 { '1' } else { '0' });
    }
    s
}

fn bitstring_to_byte(s: &str) -> Option<u8> {
    if s.len() != 8 {
        return None;
    }
    let mut value = 0u8;
    for c in s.chars() {
        value <<= 1;
        match c {
            '0' => {}
            '1' => value |= 1,
            _ => return None,
        }
    }
    Some(value)
}

pub fn parse_active_time_bitstring(s: &str) -> Option<u32> {
    bitstring_to_byte(s).map(decode_active_time)
}

pub fn parse_periodic_wakeup_bitstring(s: &str) -> Option<u32> {
    bitstring_to_byte(s).map(decode_periodic_wakeup)
}

fn div_ceil_u32(a: u32, b: u32) -> u32 {
    (a + b - 1) / b
}

// ---- eDRX ----

const CAT_M1_TABLE: [u32; 14] = [5, 10, 20, 41, 61, 82, 102, 122, 143, 164, 328, 655, 1310, 2621];
// index 0,1,4,5,6,7,8 are reserved ("-") in 24.008 table 10.5.5.32 for NB1;
// callers must not request those values back.
const NB1_TABLE: [Option<u32>; 16] = [
    None,
    None,
    Some(20),
    Some(41),
    None,
    None,
    None,
    None,
    None,
    Some(164),
    Some(328),
    Some(655),
    Some(1310),
    Some(2621),
    Some(5243),
    Some(10486),
];

/// Returns the smallest table entry `>= seconds`, clamped to the table max
/// if `seconds` exceeds it, as the 4-bit eDRX value.
pub fn edrx_seconds_to_value(rat: Rat, seconds: u32) -> Result<u8, Error> {
    match rat {
        Rat::CatM1 => {
            for (i, &v) in CAT_M1_TABLE.iter().enumerate() {
                if v >= seconds {
                    return Ok(i as u8);
                }
            }
            Ok((CAT_M1_TABLE.len() - 1) as u8)
        }
        Rat::Nb1 => {
            let mut best: Option<(usize, u32)> = None;
            for (i, entry) in NB1_TABLE.iter().enumerate() {
                if let Some(v) = entry {
                    if *v >= seconds && best.map(|(_, bv)| *v < bv).unwrap_or(true) {
                        best = Some((i, *v));
                    }
                }
            }
            if let Some((i, _)) = best {
                return Ok(i as u8);
            }
            NB1_TABLE
                .iter()
                .enumerate()
                .rev()
                .find_map(|(i, v)| v.map(|_| i as u8))
                .ok_or(Error::NotSupported)
        }
        Rat::Gsm | Rat::Cat1 => {
            let n = (seconds as u64 * 1300 / 306 / 100).min(15) as u8;
            Ok(n)
        }
    }
}

pub fn edrx_value_to_seconds(rat: Rat, value: u8) -> Result<u32, Error> {
    match rat {
        Rat::CatM1 => CAT_M1_TABLE
            .get(value as usize)
            .copied()
            .ok_or(Error::InvalidParameter),
        Rat::Nb1 => NB1_TABLE
            .get(value as usize)
            .copied()
            .flatten()
            .ok_or(Error::InvalidParameter),
        Rat::Gsm | Rat::Cat1 => Ok((value as u32) * 306 * 100 / 1300),
    }
}

/// Decodes an assigned EUTRAN paging-window value to seconds (scaled by 100
/// to stay integral: callers divide by 100 for whole seconds, or keep the
/// scaled value for fractional display).
pub fn paging_window_value_to_centiseconds(rat: Rat, value: u8) -> u32 {
    match rat {
        Rat::Nb1 => (value as u32 + 1) * 256,
        Rat::CatM1 => (value as u32 + 1) * 128,
        _ => value as u32 * 100,
    }
}

/// Inverse of [`paging_window_value_to_centiseconds`]: the smallest 4-bit
/// value whose decoded window is `>=` the requested number of seconds.
pub fn paging_window_seconds_to_value(rat: Rat, seconds: u32) -> u8 {
    let target_cs = seconds.saturating_mul(100);
    for v in 0u8..16 {
        if paging_window_value_to_centiseconds(rat, v) >= target_cs {
            return v;
        }
    }
    15
}

/// `+UUPSMR: <v>[,<blocker>]`. Returns the new deep-sleep state, and the
/// blocker id if the module reported one.
pub fn on_uupsmr_urc(body: &str, current: DeepSleepState) -> (DeepSleepState, Option<u8>) {
    let mut fields = body.split(',');
    let v: Option<u8> = fields.next().and_then(|s| s.trim().parse().ok());
    let blocker: Option<u8> = fields.next().and_then(|s| s.trim().parse().ok());
    match v {
        Some(0) => (current, None),
        Some(1) => (DeepSleepState::ProtocolStackAsleep, None),
        Some(2) => (DeepSleepState::Unavailable, blocker),
        _ => (current, None),
    }
}

/// `+CEREG: <n>,<stat>[,<tac>,<ci>,<AcT>[,<cause_type>,<reject_cause>[,<Active-Time>,<Periodic-TAU>]]]`
/// per 3GPP TS 27.007. Only the optional trailing active-time/periodic-TAU
/// fields (present with the `+CEREG` verbose reporting mode) are consumed;
/// shorter forms leave `ctx` unchanged.
pub fn on_cereg_urc(body: &str, ctx: &mut SleepContext) {
    let fields: heapless::Vec<&str, 9> = body.split(',').map(|s| s.trim()).collect();
    if fields.len() < 9 {
        return;
    }
    let active_time = fields[7].trim_matches('"');
    let periodic_tau = fields[8].trim_matches('"');
    if let Some(secs) = parse_active_time_bitstring(active_time) {
        ctx.active_time_seconds_cereg = Some(secs);
    }
    if let Some(secs) = parse_periodic_wakeup_bitstring(periodic_tau) {
        ctx.periodic_wakeup_seconds_cereg = Some(secs);
    }
    ctx.power_saving_3gpp_on_not_off_cereg = true;
    ctx.power_saving_3gpp_agreed = true;
}

/// SARA-R4 forces the low 3 bits of `AT+UPSMVER` to `100` so the modem does
/// not autonomously enter PSM before the network has agreed to it.
pub fn upsmver_guard_value(kind: ModuleKind, requested: u8) -> u8 {
    match kind {
        ModuleKind::SaraR4 => (requested & !0b111) | 0b100,
        _ => requested,
    }
}

/// `AT+CPSMS=<on>[,,,<T3412>,<T3324>]`. On SARA-R4 the active-time IE's low
/// three bits are forced per [`upsmver_guard_value`] so the modem doesn't
/// enter PSM before the network agrees.
pub fn set_requested_3gpp_power_saving<U: UartPort, C: Clock, const N: usize, P: OutputPin>(
    client: &mut AtClient<U, C, N, P>,
    kind: ModuleKind,
    on: bool,
    active_time_seconds: u32,
    periodic_wakeup_seconds: u32,
) -> Result<(), Error> {
    if kind == ModuleKind::SaraR4 {
        let current: u8 = {
            let mut lock = client.lock()?;
            lock.command_start("AT+UPSMVER?")?;
            lock.command_stop()?;
            let line = lock.response_start(Some("+UPSMVER:"))?;
            let current = line
                .trim_start_matches("+UPSMVER:")
                .trim()
                .parse()
                .unwrap_or(0);
            lock.response_stop()?;
            current
        };

        let guarded = upsmver_guard_value(kind, current);
        if guarded != current {
            let mut cmd: heapless::String<24> = heapless::String::new();
            let _ = core::fmt::write(&mut cmd, format_args!("AT+UPSMVER={guarded}"));
            let mut lock = client.lock()?;
            lock.command_start(cmd.as_str())?;
            lock.command_stop()?;
            lock.response_stop()?;
        }
    }

    let active_ie = encode_active_time(active_time_seconds);
    let periodic_ie = encode_periodic_wakeup(periodic_wakeup_seconds);

    let mut cmd: heapless::String<48> = heapless::String::new();
    let on_bit = if on { 1 } else { 0 };
    let _ = core::fmt::write(
        &mut cmd,
        format_args!(
            "AT+CPSMS={},,,\"{}\",\"{}\"",
            on_bit,
            periodic_wakeup_to_bitstring(periodic_ie).as_str(),
            active_time_to_bitstring(active_ie).as_str(),
        ),
    );
    let mut lock = client.lock()?;
    lock.command_start(cmd.as_str())?;
    lock.command_stop()?;
    lock.response_stop()
}

/// Parses a `+CPSMS:`/`+UCPSMS:` body (`<on>,,,<T3412-bitstring>,<T3324-bitstring>`)
/// into `(on, active_time_seconds, periodic_wakeup_seconds)`.
pub fn parse_3gpp_power_saving_response(body: &str) -> Option<(bool, u32, u32)> {
    let mut fields = body.split(',');
    let on = fields.next()?.trim().parse::<u8>().ok()? != 0;
    let _reserved1 = fields.next();
    let _reserved2 = fields.next();
    let periodic = fields.next()?.trim().trim_matches('"');
    let active = fields.next()?.trim().trim_matches('"');
    Some((
        on,
        parse_active_time_bitstring(active)?,
        parse_periodic_wakeup_bitstring(periodic)?,
    ))
}

/// `AT+CEDRXS=<2,rat,edrx,paging_window>`. `rat` is the `+CEDRXS` numeric AcT
/// code (4 = Cat-M1, 5 = NB1, per 3GPP TS 27.007). `paging_window_seconds` is
/// only sent on modules with [`Features::PAGING_WINDOW_SET`]; pass `None` to
/// omit it.
pub fn set_requested_edrx<U: UartPort, C: Clock, const N: usize, P: OutputPin>(
    client: &mut AtClient<U, C, N, P>,
    rat: Rat,
    on: bool,
    edrx_seconds: u32,
    paging_window_seconds: Option<u32>,
) -> Result<(), Error> {
    if !on {
        let mut cmd: heapless::String<24> = heapless::String::new();
        let _ = core::fmt::write(&mut cmd, format_args!("AT+CEDRXS=3,{}", rat_to_cedrx_act(rat)));
        let mut lock = client.lock()?;
        lock.command_start(cmd.as_str())?;
        lock.command_stop()?;
        return lock.response_stop();
    }

    let value = edrx_seconds_to_value(rat, edrx_seconds)?;
    let mut cmd: heapless::String<64> = heapless::String::new();
    match paging_window_seconds {
        Some(pw) => {
            let pw_value = paging_window_seconds_to_value(rat, pw);
            let _ = core::fmt::write(
                &mut cmd,
                format_args!(
                    "AT+CEDRXS=2,{},\"{}\",\"{}\"",
                    rat_to_cedrx_act(rat),
                    nibble_to_bitstring(value).as_str(),
                    nibble_to_bitstring(pw_value).as_str(),
                ),
            );
        }
        None => {
            let _ = core::fmt::write(
                &mut cmd,
                format_args!(
                    "AT+CEDRXS=2,{},\"{}\"",
                    rat_to_cedrx_act(rat),
                    nibble_to_bitstring(value).as_str(),
                ),
            );
        }
    }
    let mut lock = client.lock()?;
    lock.command_start(cmd.as_str())?;
    lock.command_stop()?;
    lock.response_stop()
}

fn rat_to_cedrx_act(rat: Rat) -> u8 {
    match rat {
        Rat::Gsm => 1,
        Rat::Cat1 => 3,
        Rat::CatM1 => 4,
        Rat::Nb1 => 5,
    }
}

fn nibble_to_bitstring(value: u8) -> heapless::String<4> {
    let mut s = heapless::String::new();
    for i in (0..4).rev() {
        let bit = (value >> i) & 1;
        let _ = s.push(if bit == 1 { '1' } else { '0' });
    }
    s
}

fn bitstring_to_nibble(s: &str) -> Option<u8> {
    if s.len() != 4 {
        return None;
    }
    let mut value = 0u8;
    for c in s.chars() {
        value <<= 1;
        match c {
            '0' => {}
            '1' => value |= 1,
            _ => return None,
        }
    }
    Some(value)
}

/// `+CEDRXP: <rat>,<requested>,<assigned>,<assigned-paging-window>`. Returns
/// assigned eDRX seconds and the assigned paging window in centiseconds.
pub fn parse_cedrxp_urc(body: &str) -> Option<(Rat, u32, u32)> {
    let mut fields = body.split(',');
    let act: u8 = fields.next()?.trim().parse().ok()?;
    let rat = match act {
        1 => Rat::Gsm,
        3 => Rat::Cat1,
        4 => Rat::CatM1,
        5 => Rat::Nb1,
        _ => return None,
    };
    let _requested = fields.next();
    let assigned = fields.next()?.trim().trim_matches('"');
    let paging_window = fields.next()?.trim().trim_matches('"');
    let assigned_value = bitstring_to_nibble(assigned)?;
    let paging_value = bitstring_to_nibble(paging_window)?;
    Some((
        rat,
        edrx_value_to_seconds(rat, assigned_value).ok()?,
        paging_window_value_to_centiseconds(rat, paging_value),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_time_round_trip_never_exceeds_request() {
        for seconds in 0..=(186 * 3600) {
            let v = encode_active_time(seconds);
            let decoded = decode_active_time(v);
            assert!(decoded <= seconds, "seconds={seconds} decoded={decoded}");
        }
    }

    #[test]
    fn active_time_scenario_10s_is_5_counts_of_2s() {
        let v = encode_active_time(10);
        assert_eq!(v, 0b000_00101);
        assert_eq!(active_time_to_bitstring(v).as_str(), "00000101");
    }

    #[test]
    fn periodic_wakeup_scenario_600s_is_30s_unit() {
        let v = encode_periodic_wakeup(600);
        assert_eq!(v, 0b100_10100);
        assert_eq!(periodic_wakeup_to_bitstring(v).as_str(), "10010100");
    }

    #[test]
    fn periodic_wakeup_round_trip_is_never_less_than_request() {
        for seconds in (1..=(186u32 * 3600)).step_by(37) {
            let v = encode_periodic_wakeup(seconds);
            let decoded = decode_periodic_wakeup(v);
            assert!(decoded >= seconds || v >> 5 == T3412_EXT_UNIT_320H);
        }
    }

    #[test]
    fn edrx_cat_m1_round_trip_picks_smallest_table_value_at_least_requested() {
        for seconds in 1..=86400u32 {
            let v = edrx_seconds_to_value(Rat::CatM1, seconds).unwrap();
            let got = edrx_value_to_seconds(Rat::CatM1, v).unwrap();
            assert!(got >= seconds.min(*CAT_M1_TABLE.last().unwrap()));
        }
    }

    #[test]
    fn edrx_nb1_round_trip_picks_smallest_table_value_at_least_requested() {
        let max = NB1_TABLE.iter().flatten().copied().max().unwrap();
        for seconds in (1..=86400u32).step_by(13) {
            let v = edrx_seconds_to_value(Rat::Nb1, seconds).unwrap();
            let got = edrx_value_to_seconds(Rat::Nb1, v).unwrap();
            assert!(got >= seconds.min(max));
        }
    }

    #[test]
    fn edrx_cat_m1_scenario_82s_is_value_5() {
        let v = edrx_seconds_to_value(Rat::CatM1, 82).unwrap();
        assert_eq!(v, 5);
        assert_eq!(byte_to_bitstring(v).as_str(), "00000101");
    }

    #[test]
    fn uupsmr_transitions() {
        let (s, _) = on_uupsmr_urc("1", DeepSleepState::Unknown);
        assert_eq!(s, DeepSleepState::ProtocolStackAsleep);
        let (s, blocker) = on_uupsmr_urc("2,3", DeepSleepState::Unknown);
        assert_eq!(s, DeepSleepState::Unavailable);
        assert_eq!(blocker, Some(3));
    }

    #[test]
    fn cereg_short_form_leaves_context_unchanged() {
        let mut ctx = SleepContext::default();
        on_cereg_urc("2,1", &mut ctx);
        assert!(!ctx.power_saving_3gpp_agreed);
    }

    #[test]
    fn cereg_extended_form_updates_context() {
        let mut ctx = SleepContext::default();
        on_cereg_urc(
            r#"2,1,"1A2B","01A2B3C4",7,0,0,"00000101","10010100""#,
            &mut ctx,
        );
        assert_eq!(ctx.active_time_seconds_cereg, Some(10));
        assert_eq!(ctx.periodic_wakeup_seconds_cereg, Some(600));
        assert!(ctx.power_saving_3gpp_agreed);
    }

    #[test]
    fn upsmver_guard_forces_low_bits_on_r4_only() {
        assert_eq!(upsmver_guard_value(ModuleKind::SaraR4, 0b111_111), 0b111_100);
        assert_eq!(upsmver_guard_value(ModuleKind::SaraR5, 0b111_111), 0b111_111);
    }

    #[test]
    fn cedrxp_round_trips_cat_m1_assigned_value() {
        let (rat, seconds, _pw) = parse_cedrxp_urc(r#"4,"0101","0101","0010""#).unwrap();
        assert_eq!(rat, Rat::CatM1);
        assert_eq!(seconds, 82);
    }

    #[test]
    fn parse_3gpp_power_saving_response_round_trips_scenario() {
        let (on, active, periodic) =
            parse_3gpp_power_saving_response(r#"1,,,"10010100","00000101""#).unwrap();
        assert!(on);
        assert_eq!(active, 10);
        assert_eq!(periodic, 600);
    }

    mod wire {
        use super::super::*;
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

        #[test]
        fn set_requested_3gpp_power_saving_emits_scenario_wire_bytes() {
            let uart = FakeUart::new(b"\r\nOK\r\n");
            let clock = FakeClock { ms: RefCell::new(0) };
            let mut client: AtClient<&FakeUart, &FakeClock, 64> = AtClient::new(&uart, &clock);
            set_requested_3gpp_power_saving(&mut client, ModuleKind::SaraR5, true, 10, 600)
                .unwrap();
            let sent = uart.sent();
            let text = core::str::from_utf8(&sent).unwrap();
            assert_eq!(text, "AT+CPSMS=1,,,\"10010100\",\"00000101\"\r");
        }

        #[test]
        fn set_requested_edrx_without_paging_window_emits_wire_bytes() {
            let uart = FakeUart::new(b"\r\nOK\r\n");
            let clock = FakeClock { ms: RefCell::new(0) };
            let mut client: AtClient<&FakeUart, &FakeClock, 64> = AtClient::new(&uart, &clock);
            set_requested_edrx(&mut client, Rat::CatM1, true, 82, None).unwrap();
            let sent = uart.sent();
            let text = core::str::from_utf8(&sent).unwrap();
            assert_eq!(text, "AT+CEDRXS=2,4,\"0101\"\r");
        }

        #[test]
        fn set_requested_edrx_with_paging_window_encodes_both_fields() {
            let uart = FakeUart::new(b"\r\nOK\r\n");
            let clock = FakeClock { ms: RefCell::new(0) };
            let mut client: AtClient<&FakeUart, &FakeClock, 64> = AtClient::new(&uart, &clock);
            // 82s eDRX (table value 5 = "0101"); paging window requested at
            // ~2.56s on Cat-M1, whose window unit is 1.28s, so value 1 ("0001").
            set_requested_edrx(&mut client, Rat::CatM1, true, 82, Some(2)).unwrap();
            let sent = uart.sent();
            let text = core::str::from_utf8(&sent).unwrap();
            assert_eq!(text, "AT+CEDRXS=2,4,\"0101\",\"0001\"\r");
        }
    }
}
