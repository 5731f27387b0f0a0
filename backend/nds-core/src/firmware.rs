//! Wireless-firmware image builder.
//!
//! When no dump is provided, a usable firmware blob is generated from
//! scratch: wifi calibration header, user settings, and the three access
//! point slots, each guarded by the CRC16 the wifi stack and the settings
//! screens verify before trusting a block.

use crc::Crc;

const CRC16_ARC: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_ARC);
const CRC16_MODBUS: Crc<u16> = Crc::<u16>::new(&crc::CRC_16_MODBUS);

pub const DEFAULT_FIRMWARE_LEN: usize = 0x20000;

pub const DEFAULT_MAC: [u8; 6] = [0x00, 0x09, 0xBF, 0x11, 0x22, 0x33];

const GENERATED_IDENTIFIER: &[u8; 4] = b"MELN";

// Header offsets
const IDENTIFIER_OFFSET: usize = 0x08;
const CONSOLE_TYPE_OFFSET: usize = 0x1D;
const USER_DATA_POINTER_OFFSET: usize = 0x20;
const WIFI_CONFIG_CRC_OFFSET: usize = 0x2A;
const WIFI_CONFIG_LEN_OFFSET: usize = 0x2C;
const MAC_OFFSET: usize = 0x36;
const ENABLED_CHANNELS_OFFSET: usize = 0x3C;
const RF_CHIP_TYPE_OFFSET: usize = 0x40;
const BB_INIT_OFFSET: usize = 0x64;
const RF_INIT_OFFSET: usize = 0xCE;
const CHANNEL_DATA_OFFSET: usize = 0xF8;
const BOOT0_OFFSET: usize = 0x2FF;

const WIFI_CONFIG_LEN: u16 = 0x138;

// User-data block offsets
const USER_DATA_ADDR: usize = 0x7FE00;
const USER_VERSION_OFFSET: usize = 0x00;
const USER_BIRTHDAY_MONTH_OFFSET: usize = 0x03;
const USER_BIRTHDAY_DAY_OFFSET: usize = 0x04;
const USER_SETTINGS_OFFSET: usize = 0x64;
const USER_CRC_OFFSET: usize = 0x72;

// English, maximum backlight
const DEFAULT_USER_SETTINGS: u16 = 0x00C1;

// Access point slots
const ACCESS_POINTS_ADDR: usize = 0x3FA00;
const EXTENDED_ACCESS_POINTS_ADDR: usize = 0x1F400;
const AP_BLOCK_LEN: usize = 0x100;
const EXTENDED_AP_BLOCK_LEN: usize = 0x200;
const AP_SSID_OFFSET: usize = 0x40;
const AP_STATUS_OFFSET: usize = 0xE6;
const AP_CONFIGURED_OFFSET: usize = 0xE7;
const AP_MTU_OFFSET: usize = 0xEA;
const AP_CRC_OFFSET: usize = 0xFE;
const EXTENDED_AP_CRC_OFFSET: usize = 0x1FE;

const AP_STATUS_NORMAL: u8 = 0x00;
const AP_STATUS_NOT_CONFIGURED: u8 = 0xFF;

// Baseband init table served to the wifi chip
const BB_INIT: [u8; 0x69] = [
    0x03, 0x17, 0x40, 0x00, 0x1B, 0x6C, 0x48, 0x80, 0x38, 0x00, 0x35, 0x07, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0xB0, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0xC7, 0xBB, 0x01, 0x24, 0x7F,
    0x5A, 0x01, 0x3F, 0x01, 0x3F, 0x36, 0x1D, 0x00, 0x78, 0x35, 0x55, 0x12, 0x34, 0x1C, 0x00, 0x01,
    0x0E, 0x38, 0x03, 0x70, 0xC5, 0x2A, 0x0A, 0x08, 0x04, 0x01, 0x00, 0x00, 0x00, 0xFF, 0xFF, 0xFE,
    0xFE, 0xFE, 0xFE, 0xFC, 0xFC, 0xFA, 0xFA, 0xFA, 0xFA, 0xFA, 0xF8, 0xF8, 0xF6, 0x00, 0x12, 0x14,
    0x12, 0x41, 0x23, 0x03, 0x04, 0x70, 0x35, 0x0E, 0x2C, 0x2C, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x0E, 0x00, 0x00, 0x12, 0x28, 0x1C,
];

// RF init table for the type-3 RF chip
const RF_INIT: [u8; 0x29] = [
    0x31, 0x4C, 0x4F, 0x21, 0x00, 0x10, 0xB0, 0x08, 0xFA, 0x15, 0x26, 0xE6, 0xC1, 0x01, 0x0E, 0x50,
    0x05, 0x00, 0x6D, 0x12, 0x00, 0x00, 0x01, 0xFF, 0x0E, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x06,
    0x06, 0x00, 0x00, 0x00, 0x18, 0x00, 0x02, 0x00, 0x00,
];

// Per-channel BB/RF data
const CHANNEL_DATA: [u8; 0x3C] = [
    0x1E, 0x0C, 0x0C, 0x0C, 0x0C, 0x0C, 0x0C, 0x0E, 0x0E, 0x0E, 0x0E, 0x0E, 0x0E, 0x0E, 0x16, 0x26,
    0x1C, 0x1C, 0x1C, 0x1D, 0x1D, 0x1D, 0x1E, 0x1E, 0x1E, 0x1E, 0x1F, 0x1E, 0x1F, 0x18, 0x01, 0x4B,
    0x4B, 0x4B, 0x4B, 0x4C, 0x4C, 0x4C, 0x4C, 0x4C, 0x4C, 0x4C, 0x4D, 0x4D, 0x4D, 0x02, 0x6C, 0x71,
    0x76, 0x5B, 0x40, 0x45, 0x4A, 0x2F, 0x34, 0x39, 0x3E, 0x03, 0x08, 0x14,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleType {
    DsLite,
    Dsi,
}

impl ConsoleType {
    fn header_byte(self) -> u8 {
        match self {
            Self::DsLite => 0x20,
            Self::Dsi => 0x57,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Firmware {
    buffer: Vec<u8>,
    console_type: ConsoleType,
}

impl Firmware {
    /// Builds a default firmware image for the given console.
    #[must_use]
    pub fn generate(console_type: ConsoleType) -> Self {
        let mut firmware =
            Self { buffer: vec![0xFF; DEFAULT_FIRMWARE_LEN], console_type };
        let mask = firmware.mask();

        // header
        {
            let buf = &mut firmware.buffer;
            buf[..0x1D].fill(0);

            buf[IDENTIFIER_OFFSET..IDENTIFIER_OFFSET + 4].copy_from_slice(GENERATED_IDENTIFIER);
            buf[CONSOLE_TYPE_OFFSET] = console_type.header_byte();

            if console_type == ConsoleType::Dsi {
                // part of the stage2 firmware signature; must be zero
                buf[0x22..0x2A].fill(0);
            }

            buf[WIFI_CONFIG_LEN_OFFSET..WIFI_CONFIG_LEN_OFFSET + 2]
                .copy_from_slice(&WIFI_CONFIG_LEN.to_le_bytes());
            buf[MAC_OFFSET..MAC_OFFSET + 6].copy_from_slice(&DEFAULT_MAC);
            buf[ENABLED_CHANNELS_OFFSET..ENABLED_CHANNELS_OFFSET + 2]
                .copy_from_slice(&0x3FFEu16.to_le_bytes());

            // RF chip type 3, 0x94 bits per entry, 0x29 entries
            buf[RF_CHIP_TYPE_OFFSET..RF_CHIP_TYPE_OFFSET + 4]
                .copy_from_slice(&[0x03, 0x94, 0x29, 0x02]);

            let tuning: [u16; 16] = [
                0x0002, 0x0017, 0x0026, 0x1818, 0x0048, 0x4840, 0x0058, 0x0042, 0x0146, 0x8064,
                0xE6E6, 0x2443, 0x000E, 0x0001, 0x0001, 0x0402,
            ];
            for (i, value) in tuning.into_iter().enumerate() {
                buf[0x44 + 2 * i..0x46 + 2 * i].copy_from_slice(&value.to_le_bytes());
            }

            buf[BB_INIT_OFFSET..BB_INIT_OFFSET + BB_INIT.len()].copy_from_slice(&BB_INIT);
            buf[BB_INIT_OFFSET + BB_INIT.len()] = 0;
            buf[RF_INIT_OFFSET..RF_INIT_OFFSET + RF_INIT.len()].copy_from_slice(&RF_INIT);
            // BB indices per channel
            buf[RF_INIT_OFFSET + RF_INIT.len()] = 0x02;
            buf[CHANNEL_DATA_OFFSET..CHANNEL_DATA_OFFSET + CHANNEL_DATA.len()]
                .copy_from_slice(&CHANNEL_DATA);

            // boot0: use NAND as the stage2 medium
            buf[BOOT0_OFFSET] = 0x80;
        }

        // user data
        let user_data = firmware.user_data_addr();
        {
            let block = &mut firmware.buffer[user_data..user_data + 0x74];
            block.fill(0);
            block[USER_VERSION_OFFSET] = 5;
            block[USER_BIRTHDAY_MONTH_OFFSET] = 1;
            block[USER_BIRTHDAY_DAY_OFFSET] = 1;
            block[USER_SETTINGS_OFFSET..USER_SETTINGS_OFFSET + 2]
                .copy_from_slice(&DEFAULT_USER_SETTINGS.to_le_bytes());
        }
        let pointer = (user_data as u32 >> 3) as u16;
        firmware.buffer[USER_DATA_POINTER_OFFSET..USER_DATA_POINTER_OFFSET + 2]
            .copy_from_slice(&pointer.to_le_bytes());

        // access points: the first one usable, the other two blank
        for slot in 0..3 {
            let base = (ACCESS_POINTS_ADDR & mask) + slot * AP_BLOCK_LEN;
            let block = &mut firmware.buffer[base..base + AP_BLOCK_LEN];
            block.fill(0);

            if slot == 0 {
                block[AP_SSID_OFFSET..AP_SSID_OFFSET + 7].copy_from_slice(b"melonAP");
                block[AP_STATUS_OFFSET] = AP_STATUS_NORMAL;
                if console_type == ConsoleType::Dsi {
                    block[AP_MTU_OFFSET..AP_MTU_OFFSET + 2]
                        .copy_from_slice(&1400u16.to_le_bytes());
                }
            } else {
                block[AP_STATUS_OFFSET] = AP_STATUS_NOT_CONFIGURED;
            }
            block[AP_CONFIGURED_OFFSET] = 0x01;
        }

        if console_type == ConsoleType::Dsi {
            for slot in 0..3 {
                let base = (EXTENDED_ACCESS_POINTS_ADDR & mask) + slot * EXTENDED_AP_BLOCK_LEN;
                firmware.buffer[base..base + EXTENDED_AP_BLOCK_LEN].fill(0);
                firmware.buffer[base + AP_STATUS_OFFSET] =
                    if slot == 0 { AP_STATUS_NORMAL } else { AP_STATUS_NOT_CONFIGURED };
                firmware.buffer[base + AP_CONFIGURED_OFFSET] = 0x01;
            }
        }

        firmware.update_checksums();
        firmware
    }

    /// Wraps an existing dump, padded up to a power of two.
    #[must_use]
    pub fn from_image(mut data: Vec<u8>, console_type: ConsoleType) -> Self {
        nds_common::rom::pad_to_power_of_two(&mut data, 0x20000);
        Self { buffer: data, console_type }
    }

    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    #[must_use]
    pub fn console_type(&self) -> ConsoleType {
        self.console_type
    }

    #[must_use]
    pub fn mask(&self) -> usize {
        self.buffer.len() - 1
    }

    #[must_use]
    pub fn mac_address(&self) -> [u8; 6] {
        self.buffer[MAC_OFFSET..MAC_OFFSET + 6].try_into().unwrap()
    }

    #[must_use]
    pub fn user_data_addr(&self) -> usize {
        USER_DATA_ADDR & self.mask()
    }

    /// Recomputes every CRC16 the image carries.
    pub fn update_checksums(&mut self) {
        let wifi_crc = {
            let len = u16::from_le_bytes(
                self.buffer[WIFI_CONFIG_LEN_OFFSET..WIFI_CONFIG_LEN_OFFSET + 2].try_into().unwrap(),
            ) as usize;
            CRC16_ARC.checksum(&self.buffer[WIFI_CONFIG_LEN_OFFSET..WIFI_CONFIG_LEN_OFFSET + len])
        };
        self.buffer[WIFI_CONFIG_CRC_OFFSET..WIFI_CONFIG_CRC_OFFSET + 2]
            .copy_from_slice(&wifi_crc.to_le_bytes());

        let user_data = self.user_data_addr();
        let user_crc = CRC16_MODBUS.checksum(&self.buffer[user_data..user_data + 0x70]);
        self.buffer[user_data + USER_CRC_OFFSET..user_data + USER_CRC_OFFSET + 2]
            .copy_from_slice(&user_crc.to_le_bytes());

        let mask = self.mask();
        for slot in 0..3 {
            let base = (ACCESS_POINTS_ADDR & mask) + slot * AP_BLOCK_LEN;
            let crc = CRC16_ARC.checksum(&self.buffer[base..base + 0xFE]);
            self.buffer[base + AP_CRC_OFFSET..base + AP_CRC_OFFSET + 2]
                .copy_from_slice(&crc.to_le_bytes());
        }

        if self.console_type == ConsoleType::Dsi {
            for slot in 0..3 {
                let base = (EXTENDED_ACCESS_POINTS_ADDR & mask) + slot * EXTENDED_AP_BLOCK_LEN;
                let crc = CRC16_ARC.checksum(&self.buffer[base + 0x100..base + 0x100 + 0xFD]);
                self.buffer[base + EXTENDED_AP_CRC_OFFSET..base + EXTENDED_AP_CRC_OFFSET + 2]
                    .copy_from_slice(&crc.to_le_bytes());
            }
        }
    }

    /// Checks every CRC16 without modifying the image.
    #[must_use]
    pub fn verify_checksums(&self) -> bool {
        let wifi_len = u16::from_le_bytes(
            self.buffer[WIFI_CONFIG_LEN_OFFSET..WIFI_CONFIG_LEN_OFFSET + 2].try_into().unwrap(),
        ) as usize;
        let wifi_crc =
            CRC16_ARC.checksum(&self.buffer[WIFI_CONFIG_LEN_OFFSET..WIFI_CONFIG_LEN_OFFSET + wifi_len]);
        if self.read_u16(WIFI_CONFIG_CRC_OFFSET) != wifi_crc {
            return false;
        }

        let user_data = self.user_data_addr();
        let user_crc = CRC16_MODBUS.checksum(&self.buffer[user_data..user_data + 0x70]);
        if self.read_u16(user_data + USER_CRC_OFFSET) != user_crc {
            return false;
        }

        let mask = self.mask();
        for slot in 0..3 {
            let base = (ACCESS_POINTS_ADDR & mask) + slot * AP_BLOCK_LEN;
            let crc = CRC16_ARC.checksum(&self.buffer[base..base + 0xFE]);
            if self.read_u16(base + AP_CRC_OFFSET) != crc {
                return false;
            }
        }

        if self.console_type == ConsoleType::Dsi {
            for slot in 0..3 {
                let base = (EXTENDED_ACCESS_POINTS_ADDR & mask) + slot * EXTENDED_AP_BLOCK_LEN;
                let crc = CRC16_ARC.checksum(&self.buffer[base + 0x100..base + 0x100 + 0xFD]);
                if self.read_u16(base + EXTENDED_AP_CRC_OFFSET) != crc {
                    return false;
                }
            }
        }

        true
    }

    fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes(self.buffer[offset..offset + 2].try_into().unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_firmware_verifies() {
        for console_type in [ConsoleType::DsLite, ConsoleType::Dsi] {
            let firmware = Firmware::generate(console_type);
            assert!(firmware.verify_checksums(), "{console_type:?}");
        }
    }

    #[test]
    fn header_fields() {
        let firmware = Firmware::generate(ConsoleType::DsLite);
        let buf = firmware.buffer();

        assert_eq!(&buf[IDENTIFIER_OFFSET..IDENTIFIER_OFFSET + 4], GENERATED_IDENTIFIER);
        assert_eq!(buf[CONSOLE_TYPE_OFFSET], 0x20);
        assert_eq!(buf[BOOT0_OFFSET], 0x80);
        assert_eq!(firmware.mac_address(), DEFAULT_MAC);
        assert_eq!(
            &buf[BB_INIT_OFFSET..BB_INIT_OFFSET + BB_INIT.len()],
            &BB_INIT[..]
        );
    }

    #[test]
    fn user_data_pointer_matches_block() {
        let firmware = Firmware::generate(ConsoleType::DsLite);

        let pointer = u16::from_le_bytes(
            firmware.buffer()[USER_DATA_POINTER_OFFSET..USER_DATA_POINTER_OFFSET + 2]
                .try_into()
                .unwrap(),
        );
        assert_eq!((pointer as usize) << 3, firmware.user_data_addr());

        let user_data = firmware.user_data_addr();
        assert_eq!(firmware.buffer()[user_data + USER_VERSION_OFFSET], 5);
        assert_eq!(firmware.buffer()[user_data + USER_BIRTHDAY_MONTH_OFFSET], 1);
    }

    #[test]
    fn first_access_point_is_configured() {
        let firmware = Firmware::generate(ConsoleType::DsLite);
        let base = ACCESS_POINTS_ADDR & firmware.mask();
        let buf = firmware.buffer();

        assert_eq!(&buf[base + AP_SSID_OFFSET..base + AP_SSID_OFFSET + 7], b"melonAP");
        assert_eq!(buf[base + AP_STATUS_OFFSET], AP_STATUS_NORMAL);
        assert_eq!(buf[base + AP_BLOCK_LEN + AP_STATUS_OFFSET], AP_STATUS_NOT_CONFIGURED);
    }

    #[test]
    fn dsi_zeroes_signature_bytes_and_sets_mtu() {
        let firmware = Firmware::generate(ConsoleType::Dsi);
        let buf = firmware.buffer();

        assert!(buf[0x22..0x2A].iter().all(|&b| b == 0));
        assert_eq!(buf[CONSOLE_TYPE_OFFSET], 0x57);

        let base = ACCESS_POINTS_ADDR & firmware.mask();
        assert_eq!(&buf[base + AP_MTU_OFFSET..base + AP_MTU_OFFSET + 2], &1400u16.to_le_bytes());
    }

    #[test]
    fn corruption_is_detected_and_repairable() {
        let mut firmware = Firmware::generate(ConsoleType::DsLite);
        assert!(firmware.verify_checksums());

        let user_data = firmware.user_data_addr();
        firmware.buffer[user_data + USER_BIRTHDAY_DAY_OFFSET] = 25;
        assert!(!firmware.verify_checksums());

        firmware.update_checksums();
        assert!(firmware.verify_checksums());
    }
}
