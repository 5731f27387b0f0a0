/// Pads a ROM image with zeroes until its length is a power of two, with a
/// floor of `min_len` (which must itself be a power of two).
///
/// DS game paks present their contents behind a power-of-two address mask, so
/// loaders round every dump up before wiring it to the bus.
pub fn pad_to_power_of_two(rom: &mut Vec<u8>, min_len: usize) {
    debug_assert!(min_len.is_power_of_two());

    if rom.is_empty() {
        log::error!("Cannot pad empty ROM");
        return;
    }

    let target_len = rom.len().next_power_of_two().max(min_len);
    if target_len != rom.len() {
        log::debug!("ROM len is {}; zero-padding to {target_len}", rom.len());
        rom.resize(target_len, 0);
    }
}
