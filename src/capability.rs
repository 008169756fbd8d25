//! Static per-module-variant capability table. No virtual dispatch: callers
//! `match` on `ModuleKind` or index into `CAPABILITIES`.

#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub enum ModuleKind {
    SaraR4,
    SaraR5,
    SaraR422,
    LaraR6,
    SaraU201,
}

impl ModuleKind {
    pub const COUNT: usize = 5;

    const fn index(self) -> usize {
        match self {
            ModuleKind::SaraR4 => 0,
            ModuleKind::SaraR5 => 1,
            ModuleKind::SaraR422 => 2,
            ModuleKind::LaraR6 => 3,
            ModuleKind::SaraU201 => 4,
        }
    }

    pub const fn capability(self) -> &'static ModuleCapability {
        &CAPABILITIES[self.index()]
    }
}

/// Feature bitmap. Plain `u16` constants rather than a bitflags crate, to
/// match the manual-bitmask style the rest of this crate's register/IE code
/// uses.
#[derive(Clone, Copy, PartialEq, Eq, Debug, defmt::Format)]
pub struct Features(u16);

impl Features {
    pub const MNO_PROFILE: Features = Features(1 << 0);
    pub const UART_POWER_SAVING: Features = Features(1 << 1);
    pub const DTR_POWER_SAVING: Features = Features(1 << 2);
    pub const POWER_SAVING_3GPP: Features = Features(1 << 3);
    pub const EDRX: Features = Features(1 << 4);
    pub const DEEP_SLEEP_URC: Features = Features(1 << 5);
    pub const UCGED5: Features = Features(1 << 6);
    pub const PAGING_WINDOW_SET: Features = Features(1 << 7);
    pub const POWER_SAVING_3GPP_PAGING_WINDOW: Features = Features(1 << 8);
    pub const ACKAIDING_VIA_CFG_VAL: Features = Features(1 << 9);

    pub const fn empty() -> Self {
        Features(0)
    }

    pub const fn union(self, other: Features) -> Features {
        Features(self.0 | other.0)
    }

    pub const fn contains(self, other: Features) -> bool {
        (self.0 & other.0) == other.0
    }
}

#[derive(Clone, Copy, Debug, defmt::Format)]
pub struct ModuleCapability {
    pub kind: ModuleKind,
    pub supported_rats_bitmap: u8,
    pub max_num_simultaneous_rats: u8,
    pub radio_off_cfun: u8,
    pub boot_wait_ms: u32,
    pub reboot_command_wait_ms: u32,
    pub power_down_wait_ms: u32,
    pub power_on_pull_ms: u32,
    pub power_off_pull_ms: u32,
    pub response_max_wait_ms: u32,
    pub features: Features,
}

pub static CAPABILITIES: [ModuleCapability; ModuleKind::COUNT] = [
    // SARA-R4
    ModuleCapability {
        kind: ModuleKind::SaraR4,
        supported_rats_bitmap: 0b0000_0110, // Cat-M1, NB1
        max_num_simultaneous_rats: 2,
        radio_off_cfun: 0,
        boot_wait_ms: 6000,
        reboot_command_wait_ms: 35000,
        power_down_wait_ms: 23000,
        power_on_pull_ms: 150,
        power_off_pull_ms: 1500,
        response_max_wait_ms: 10000,
        features: Features::UART_POWER_SAVING
            .union(Features::POWER_SAVING_3GPP)
            .union(Features::EDRX)
            .union(Features::UCGED5),
    },
    // SARA-R5
    ModuleCapability {
        kind: ModuleKind::SaraR5,
        supported_rats_bitmap: 0b0000_0110,
        max_num_simultaneous_rats: 1,
        radio_off_cfun: 4,
        boot_wait_ms: 5000,
        reboot_command_wait_ms: 16000,
        power_down_wait_ms: 15000,
        power_on_pull_ms: 150,
        power_off_pull_ms: 1500,
        response_max_wait_ms: 10000,
        features: Features::MNO_PROFILE
            .union(Features::UART_POWER_SAVING)
            .union(Features::DTR_POWER_SAVING)
            .union(Features::POWER_SAVING_3GPP)
            .union(Features::EDRX)
            .union(Features::DEEP_SLEEP_URC)
            .union(Features::PAGING_WINDOW_SET)
            .union(Features::POWER_SAVING_3GPP_PAGING_WINDOW)
            .union(Features::ACKAIDING_VIA_CFG_VAL),
    },
    // SARA-R422
    ModuleCapability {
        kind: ModuleKind::SaraR422,
        supported_rats_bitmap: 0b0000_0110,
        max_num_simultaneous_rats: 1,
        radio_off_cfun: 4,
        boot_wait_ms: 5000,
        reboot_command_wait_ms: 16000,
        power_down_wait_ms: 15000,
        power_on_pull_ms: 150,
        power_off_pull_ms: 1500,
        response_max_wait_ms: 10000,
        features: Features::MNO_PROFILE
            .union(Features::UART_POWER_SAVING)
            .union(Features::DTR_POWER_SAVING)
            .union(Features::POWER_SAVING_3GPP)
            .union(Features::EDRX)
            .union(Features::DEEP_SLEEP_URC)
            .union(Features::PAGING_WINDOW_SET)
            .union(Features::POWER_SAVING_3GPP_PAGING_WINDOW)
            .union(Features::ACKAIDING_VIA_CFG_VAL),
    },
    // LARA-R6
    ModuleCapability {
        kind: ModuleKind::LaraR6,
        supported_rats_bitmap: 0b0000_0011, // GSM, LTE Cat1
        max_num_simultaneous_rats: 2,
        radio_off_cfun: 0,
        boot_wait_ms: 9000,
        reboot_command_wait_ms: 16000,
        power_down_wait_ms: 15000,
        power_on_pull_ms: 150,
        power_off_pull_ms: 1500,
        response_max_wait_ms: 10000,
        features: Features::MNO_PROFILE
            .union(Features::UART_POWER_SAVING)
            .union(Features::UCGED5),
    },
    // SARA-U201
    ModuleCapability {
        kind: ModuleKind::SaraU201,
        supported_rats_bitmap: 0b0000_0001, // GSM/UMTS only
        max_num_simultaneous_rats: 1,
        radio_off_cfun: 0,
        boot_wait_ms: 6000,
        reboot_command_wait_ms: 16000,
        power_down_wait_ms: 15000,
        power_on_pull_ms: 150,
        power_off_pull_ms: 1500,
        response_max_wait_ms: 10000,
        features: Features::empty(),
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_resolves_a_matching_row() {
        for kind in [
            ModuleKind::SaraR4,
            ModuleKind::SaraR5,
            ModuleKind::SaraR422,
            ModuleKind::LaraR6,
            ModuleKind::SaraU201,
        ] {
            assert_eq!(kind.capability().kind, kind);
        }
    }

    #[test]
    fn only_r5_and_r422_expose_mno_profile() {
        assert!(!ModuleKind::SaraR4
            .capability()
            .features
            .contains(Features::MNO_PROFILE));
        assert!(ModuleKind::SaraR5
            .capability()
            .features
            .contains(Features::MNO_PROFILE));
        assert!(ModuleKind::SaraR422
            .capability()
            .features
            .contains(Features::MNO_PROFILE));
    }
}
