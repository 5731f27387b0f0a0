//! The SD/MMC controller's child devices: the DSi's internal NAND chip and
//! the removable SD card.
//!
//! Only the card side of the bus lives here. The host register file is an
//! external collaborator reached through [`SdHost`]; devices never store a
//! host reference, every command entry point takes it as a parameter.

use nds_common::savestate::{SavestateReader, SavestateWriter, Snapshot};

const SECTOR_LEN: usize = 0x200;

// CSD template for a 16 GB-class card; the DSi firmware only looks at a few
// fields of it
const CSD_TEMPLATE: [u8; 16] = [
    0x40, 0x40, 0x96, 0xE9, 0x7F, 0xDB, 0xF6, 0xDF, 0x01, 0x59, 0x0F, 0x2A, 0x01, 0x26, 0x90, 0x00,
];

/// The host side of the SD/MMC bus, as seen by a card.
pub trait SdHost {
    /// Pushes a 32-bit response word; `last` marks the final word.
    fn send_response(&mut self, val: u32, last: bool);

    /// How many bytes of the current block the host FIFO can take.
    fn transferrable_len(&self, block_size: u32) -> u32;

    /// Card-to-host data. Returns the number of bytes accepted.
    fn data_rx(&mut self, data: &[u8]) -> u32;

    /// Host-to-card data. Returns the number of bytes provided.
    fn data_tx(&mut self, out: &mut [u8]) -> u32;
}

// Register state shared by both devices. `internal` distinguishes the NAND
// (which answers CMD1 and pins its relative card address) from the SD card.
#[derive(Debug)]
struct StorageCore {
    internal: bool,

    cid: [u8; 16],
    csd: [u8; 16],

    csr: u32,
    ocr: u32,
    rca: u32,
    scr: [u8; 8],
    ssr: [u8; 64],

    block_size: u32,
    rw_command: u32,
    rw_address: u64,
}

// A block transfer the device has to carry out against its backing image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockOp {
    Read,
    Write,
}

impl StorageCore {
    fn new(internal: bool) -> Self {
        let mut core = Self {
            internal,
            cid: [0; 16],
            csd: [0; 16],
            csr: 0,
            ocr: 0,
            rca: 0,
            scr: [0; 8],
            ssr: [0; 64],
            block_size: 0,
            rw_command: 0,
            rw_address: 0,
        };
        core.reset();
        core
    }

    fn reset(&mut self) {
        self.csr = 0x0000_0100;
        self.ocr = 0x80FF_8000;
        self.csd = CSD_TEMPLATE;

        self.scr = [0; 8];
        self.scr[0..4].copy_from_slice(&0x012A_0000u32.to_le_bytes());

        self.ssr = [0; 64];

        self.block_size = 0;
        self.rw_command = 0;
        self.rw_address = 0;
    }

    fn set_cid(&mut self, cid: &[u8; 16]) {
        self.cid = *cid;
    }

    fn set_state(&mut self, state: u32) {
        self.csr = (self.csr & !(0xF << 9)) | (state << 9);
    }

    fn send_cmd(&mut self, host: &mut dyn SdHost, cmd: u8, param: u32) -> Option<BlockOp> {
        if self.csr & (1 << 5) != 0 {
            self.csr &= !(1 << 5);
            self.send_acmd(host, cmd, param);
            return None;
        }

        match cmd {
            0 => {
                host.send_response(self.csr, true);
                None
            }

            // SEND_OP_COND; MMC-only
            1 => {
                if self.internal {
                    let param = param & !(1 << 30);
                    self.ocr &= 0xBF00_0000;
                    self.ocr |= param & 0x40FF_FFFF;
                    host.send_response(self.ocr, true);
                    self.set_state(0x01);
                } else {
                    log::debug!("CMD1 on SD card!!");
                }
                None
            }

            2 | 10 => {
                self.send_reg_response(host, &self.cid.clone());
                if cmd == 2 {
                    self.set_state(0x02);
                }
                None
            }

            // get/set relative card address
            3 => {
                if self.internal {
                    self.rca = param >> 16;
                    host.send_response(self.csr | 0x10000, true);
                } else {
                    host.send_response(
                        (self.csr & 0x1FFF)
                            | ((self.csr >> 6) & 0x2000)
                            | ((self.csr >> 8) & 0xC000)
                            | (1 << 16),
                        true,
                    );
                }
                None
            }

            // MMC SWITCH / select card
            6 | 7 => {
                host.send_response(self.csr, true);
                None
            }

            // set voltage
            8 => {
                host.send_response(param, true);
                None
            }

            9 => {
                self.send_reg_response(host, &self.csd.clone());
                None
            }

            // stop operation
            12 => {
                self.set_state(0x04);
                self.rw_command = 0;
                host.send_response(self.csr, true);
                None
            }

            13 => {
                host.send_response(self.csr, true);
                None
            }

            16 => {
                self.block_size = param;
                if self.block_size > SECTOR_LEN as u32 {
                    log::warn!("!! SD/MMC: BAD BLOCK LEN {}", self.block_size);
                    self.block_size = SECTOR_LEN as u32;
                }
                self.set_state(0x04);
                host.send_response(self.csr, true);
                None
            }

            // read multiple blocks
            18 => {
                self.rw_address = param.into();
                if self.ocr & (1 << 30) != 0 {
                    // SDHC: sector-addressed
                    self.rw_address <<= 9;
                    self.block_size = SECTOR_LEN as u32;
                }
                self.rw_command = 18;
                host.send_response(self.csr, true);
                self.set_state(0x05);
                Some(BlockOp::Read)
            }

            // write multiple blocks
            25 => {
                self.rw_address = param.into();
                if self.ocr & (1 << 30) != 0 {
                    self.rw_address <<= 9;
                    self.block_size = SECTOR_LEN as u32;
                }
                self.rw_command = 25;
                host.send_response(self.csr, true);
                self.set_state(0x04);
                Some(BlockOp::Write)
            }

            // APP_CMD prefix
            55 => {
                self.csr |= 1 << 5;
                host.send_response(self.csr, true);
                None
            }

            _ => {
                log::warn!("MMC: unknown CMD {cmd} {param:08X}");
                None
            }
        }
    }

    fn send_acmd(&mut self, host: &mut dyn SdHost, cmd: u8, param: u32) {
        match cmd {
            // set bus width
            6 => host.send_response(self.csr, true),

            // SD status
            13 => {
                host.send_response(self.csr, true);
                host.data_rx(&self.ssr);
            }

            // set operating conditions
            41 => {
                let param = if self.internal { param & !(1 << 30) } else { param };
                self.ocr &= 0xBF00_0000;
                self.ocr |= param & 0x40FF_FFFF;
                host.send_response(self.ocr, true);
                self.set_state(0x01);
            }

            42 => host.send_response(self.csr, true),

            // SD configuration register
            51 => {
                host.send_response(self.csr, true);
                host.data_rx(&self.scr);
            }

            _ => log::warn!("MMC: unknown ACMD {cmd} {param:08X}"),
        }
    }

    // CID/CSD go out as four response words, high bytes first
    fn send_reg_response(&mut self, host: &mut dyn SdHost, reg: &[u8; 16]) {
        for (i, chunk) in reg.chunks_exact(4).enumerate().rev() {
            host.send_response(u32::from_le_bytes(chunk.try_into().unwrap()), i == 0);
        }
    }

    fn continue_op(&self) -> Option<BlockOp> {
        match self.rw_command {
            18 => Some(BlockOp::Read),
            25 => Some(BlockOp::Write),
            _ => None,
        }
    }

    fn save(&mut self, file: &mut SavestateWriter<'_>, section: [u8; 4]) {
        file.section(section);

        file.var_array(&self.cid);
        file.var_array(&self.csd);

        file.var_u32(self.csr);
        file.var_u32(self.ocr);
        file.var_u32(self.rca);
        file.var_array(&self.scr);
        file.var_array(&self.ssr);

        file.var_u32(self.block_size);
        file.var_u64(self.rw_address);
        file.var_u32(self.rw_command);
    }

    fn load(&mut self, file: &mut SavestateReader<'_>, section: [u8; 4]) {
        file.section(section);

        file.var_array(&mut self.cid);
        file.var_array(&mut self.csd);

        self.csr = file.var_u32();
        self.ocr = file.var_u32();
        self.rca = file.var_u32();
        file.var_array(&mut self.scr);
        file.var_array(&mut self.ssr);

        self.block_size = file.var_u32();
        self.rw_address = file.var_u64();
        self.rw_command = file.var_u32();
    }
}

// Image-backed sector IO shared by both devices
fn read_block(image: &[u8], host: &mut dyn SdHost, addr: u64, block_size: u32) -> u32 {
    let len = host.transferrable_len(block_size).min(SECTOR_LEN as u32);

    let mut data = [0; SECTOR_LEN];
    let start = (addr as usize).min(image.len());
    let end = (start + len as usize).min(image.len());
    data[..end - start].copy_from_slice(&image[start..end]);

    host.data_rx(&data[..len as usize])
}

fn write_block(image: &mut [u8], host: &mut dyn SdHost, addr: u64, block_size: u32) -> u32 {
    let len = host.transferrable_len(block_size).min(SECTOR_LEN as u32);

    let mut data = [0; SECTOR_LEN];
    let written = host.data_tx(&mut data[..len as usize]);
    if written != 0 {
        let start = (addr as usize).min(image.len());
        let end = (start + written as usize).min(image.len());
        image[start..end].copy_from_slice(&data[..end - start]);
    }

    written
}

/// The DSi's internal eMMC NAND chip.
#[derive(Debug)]
pub struct NandStorage {
    core: StorageCore,
    image: Vec<u8>,
}

impl NandStorage {
    #[must_use]
    pub fn new(image: Vec<u8>) -> Self {
        Self { core: StorageCore::new(true), image }
    }

    pub fn reset(&mut self) {
        self.core.reset();
    }

    pub fn set_cid(&mut self, cid: &[u8; 16]) {
        self.core.set_cid(cid);
    }

    pub fn send_cmd(&mut self, host: &mut dyn SdHost, cmd: u8, param: u32) {
        if let Some(op) = self.core.send_cmd(host, cmd, param) {
            self.run_op(host, op);
        }
    }

    pub fn continue_transfer(&mut self, host: &mut dyn SdHost) {
        if let Some(op) = self.core.continue_op() {
            self.run_op(host, op);
        }
    }

    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    fn run_op(&mut self, host: &mut dyn SdHost, op: BlockOp) {
        let advanced = match op {
            BlockOp::Read => read_block(&self.image, host, self.core.rw_address, self.core.block_size),
            BlockOp::Write => {
                write_block(&mut self.image, host, self.core.rw_address, self.core.block_size)
            }
        };
        self.core.rw_address += u64::from(advanced);
    }
}

impl Snapshot for NandStorage {
    fn save(&mut self, file: &mut SavestateWriter<'_>) {
        self.core.save(file, *b"NAND");
    }

    fn load(&mut self, file: &mut SavestateReader<'_>) {
        self.core.load(file, *b"NAND");
    }
}

/// The removable SD card.
#[derive(Debug)]
pub struct SdCardStorage {
    core: StorageCore,
    image: Vec<u8>,
    read_only: bool,
}

impl SdCardStorage {
    #[must_use]
    pub fn new(image: Vec<u8>, read_only: bool) -> Self {
        Self { core: StorageCore::new(false), image, read_only }
    }

    pub fn reset(&mut self) {
        self.core.reset();
    }

    pub fn set_cid(&mut self, cid: &[u8; 16]) {
        self.core.set_cid(cid);
    }

    pub fn send_cmd(&mut self, host: &mut dyn SdHost, cmd: u8, param: u32) {
        if let Some(op) = self.core.send_cmd(host, cmd, param) {
            self.run_op(host, op);
        }
    }

    pub fn continue_transfer(&mut self, host: &mut dyn SdHost) {
        if let Some(op) = self.core.continue_op() {
            self.run_op(host, op);
        }
    }

    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.image
    }

    fn run_op(&mut self, host: &mut dyn SdHost, op: BlockOp) {
        let advanced = match op {
            BlockOp::Read => read_block(&self.image, host, self.core.rw_address, self.core.block_size),
            BlockOp::Write => {
                if self.read_only {
                    // still drain the host FIFO, just don't persist
                    let mut scratch = vec![0; SECTOR_LEN];
                    host.data_tx(&mut scratch)
                } else {
                    write_block(&mut self.image, host, self.core.rw_address, self.core.block_size)
                }
            }
        };
        self.core.rw_address += u64::from(advanced);
    }
}

impl Snapshot for SdCardStorage {
    fn save(&mut self, file: &mut SavestateWriter<'_>) {
        self.core.save(file, *b"SDCR");
    }

    fn load(&mut self, file: &mut SavestateReader<'_>) {
        self.core.load(file, *b"SDCR");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct MockHost {
        responses: Vec<(u32, bool)>,
        rx: Vec<u8>,
        tx: Vec<u8>,
        fifo_len: u32,
    }

    impl MockHost {
        fn new() -> Self {
            Self { fifo_len: SECTOR_LEN as u32, ..Self::default() }
        }
    }

    impl SdHost for MockHost {
        fn send_response(&mut self, val: u32, last: bool) {
            self.responses.push((val, last));
        }

        fn transferrable_len(&self, block_size: u32) -> u32 {
            self.fifo_len.min(block_size.max(1))
        }

        fn data_rx(&mut self, data: &[u8]) -> u32 {
            self.rx.extend_from_slice(data);
            data.len() as u32
        }

        fn data_tx(&mut self, out: &mut [u8]) -> u32 {
            let len = out.len().min(self.tx.len());
            out[..len].copy_from_slice(&self.tx[..len]);
            self.tx.drain(..len);
            len as u32
        }
    }

    fn test_image(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 253) as u8).collect()
    }

    #[test]
    fn cid_reads_back_in_four_responses() {
        let mut nand = NandStorage::new(test_image(0x10000));
        let cid = [
            0xEC, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15,
        ];
        nand.set_cid(&cid);

        let mut host = MockHost::new();
        nand.send_cmd(&mut host, 2, 0);

        assert_eq!(host.responses.len(), 4);
        assert_eq!(host.responses[0], (u32::from_le_bytes(cid[12..16].try_into().unwrap()), false));
        assert_eq!(host.responses[3], (u32::from_le_bytes(cid[0..4].try_into().unwrap()), true));
    }

    #[test]
    fn block_length_is_clamped() {
        let mut nand = NandStorage::new(test_image(0x10000));
        let mut host = MockHost::new();

        nand.send_cmd(&mut host, 16, 0x1000);
        assert_eq!(nand.core.block_size, 0x200);
    }

    #[test]
    fn read_multiple_blocks_streams_image_data() {
        let image = test_image(0x10000);
        let mut nand = NandStorage::new(image.clone());
        let mut host = MockHost::new();

        nand.send_cmd(&mut host, 16, 0x200);
        host.responses.clear();
        host.rx.clear();

        nand.send_cmd(&mut host, 18, 0x400);
        assert_eq!(host.rx, &image[0x400..0x600]);
        // State moved to data-transfer
        assert_eq!((nand.core.csr >> 9) & 0xF, 0x5);

        nand.continue_transfer(&mut host);
        assert_eq!(host.rx, &image[0x400..0x800]);

        // CMD12 stops the transfer
        nand.send_cmd(&mut host, 12, 0);
        nand.continue_transfer(&mut host);
        assert_eq!(host.rx.len(), 0x400);
    }

    #[test]
    fn sdhc_addressing_shifts_sectors() {
        let image = test_image(0x10000);
        let mut sd = SdCardStorage::new(image.clone(), false);
        let mut host = MockHost::new();

        // OCR bit 30 set via ACMD41 marks the card SDHC
        sd.send_cmd(&mut host, 55, 0);
        sd.send_cmd(&mut host, 41, 1 << 30);
        assert_ne!(sd.core.ocr & (1 << 30), 0);
        host.rx.clear();

        sd.send_cmd(&mut host, 18, 2);
        assert_eq!(host.rx, &image[0x400..0x600]);
    }

    #[test]
    fn write_multiple_blocks_updates_image() {
        let mut sd = SdCardStorage::new(test_image(0x10000), false);
        let mut host = MockHost::new();
        host.tx = vec![0xAB; 0x200];

        sd.send_cmd(&mut host, 16, 0x200);
        sd.send_cmd(&mut host, 25, 0x800);

        assert_eq!(&sd.image()[0x800..0xA00], &[0xAB; 0x200][..]);
        assert_eq!(&sd.image()[0xA00..0xA04], &test_image(0x10000)[0xA00..0xA04]);
    }

    #[test]
    fn read_only_card_drops_writes() {
        let image = test_image(0x10000);
        let mut sd = SdCardStorage::new(image.clone(), true);
        let mut host = MockHost::new();
        host.tx = vec![0xAB; 0x200];

        sd.send_cmd(&mut host, 16, 0x200);
        sd.send_cmd(&mut host, 25, 0x800);

        assert_eq!(sd.image(), &image[..]);
    }

    #[test]
    fn app_cmd_prefix_routes_acmds() {
        let mut sd = SdCardStorage::new(test_image(0x1000), false);
        let mut host = MockHost::new();

        sd.send_cmd(&mut host, 55, 0);
        assert_ne!(sd.core.csr & (1 << 5), 0);

        // ACMD51 returns the SCR over the data line
        sd.send_cmd(&mut host, 51, 0);
        assert_eq!(sd.core.csr & (1 << 5), 0);
        assert_eq!(host.rx, sd.core.scr);
    }

    #[test]
    fn nand_keeps_cmd1_sd_does_not() {
        let mut nand = NandStorage::new(test_image(0x1000));
        let mut host = MockHost::new();
        nand.send_cmd(&mut host, 1, 0x40FF_8000);
        assert_eq!(host.responses.len(), 1);

        let mut sd = SdCardStorage::new(test_image(0x1000), false);
        let mut host = MockHost::new();
        sd.send_cmd(&mut host, 1, 0x40FF_8000);
        assert!(host.responses.is_empty());
    }
}
