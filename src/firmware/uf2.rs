// src/firmware/uf2.rs - UF2 container unpacking
//
// A UF2 file is a sequence of 512-byte blocks, each carrying up to 476 bytes
// of payload for a target flash address. The image handed to the firmware is
// the payload laid out contiguously from the lowest address, with gaps
// filled as erased flash (0xFF).
use thiserror::Error;

pub const BLOCK_SIZE: usize = 512;
pub const MAGIC_START0: u32 = 0x0A32_4655;
pub const MAGIC_START1: u32 = 0x9E5D_5157;
pub const MAGIC_END: u32 = 0x0AB1_6F30;
const MAX_PAYLOAD: usize = 476;
const FLAG_NOT_MAIN_FLASH: u32 = 0x0000_0001;
/// Largest image the blocks may span. Covers the flash of every supported board.
pub const MAX_IMAGE_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, Error, PartialEq)]
pub enum Uf2Error {
    #[error("UF2 file size {0} is not a multiple of 512")]
    Truncated(usize),
    #[error("Invalid magic in UF2 block {0}")]
    BadMagic(usize),
    #[error("Invalid payload size {size} in UF2 block {block}")]
    BadPayload { block: usize, size: usize },
    #[error("UF2 file contains no flash data")]
    Empty,
    #[error("UF2 blocks span {0} bytes, more than any board holds")]
    TooLarge(u64),
}

fn word(block: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&block[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

pub fn is_uf2(data: &[u8]) -> bool {
    data.len() >= BLOCK_SIZE && word(data, 0) == MAGIC_START0 && word(data, 4) == MAGIC_START1
}

pub fn unpack(data: &[u8]) -> Result<Vec<u8>, Uf2Error> {
    if data.len() % BLOCK_SIZE != 0 {
        return Err(Uf2Error::Truncated(data.len()));
    }

    let mut chunks = Vec::new();
    for (index, block) in data.chunks_exact(BLOCK_SIZE).enumerate() {
        if word(block, 0) != MAGIC_START0 || word(block, 4) != MAGIC_START1 || word(block, 508) != MAGIC_END {
            return Err(Uf2Error::BadMagic(index));
        }
        if word(block, 8) & FLAG_NOT_MAIN_FLASH != 0 {
            continue;
        }
        let address = word(block, 12) as u64;
        let size = word(block, 16) as usize;
        if size > MAX_PAYLOAD {
            return Err(Uf2Error::BadPayload { block: index, size });
        }
        chunks.push((address, &block[32..32 + size]));
    }

    let base = chunks.iter().map(|(address, _)| *address).min().ok_or(Uf2Error::Empty)?;
    let end = chunks.iter().map(|(address, payload)| address + payload.len() as u64).max().unwrap_or(base);
    if end - base > MAX_IMAGE_SIZE {
        return Err(Uf2Error::TooLarge(end - base));
    }
    let mut image = vec![0xFF; (end - base) as usize];
    for (address, payload) in chunks {
        let offset = (address - base) as usize;
        image[offset..offset + payload.len()].copy_from_slice(payload);
    }
    Ok(image)
}

#[cfg(test)]
pub(crate) fn pack_block(address: u32, payload: &[u8], block_no: u32, num_blocks: u32) -> Vec<u8> {
    let mut block = vec![0u8; BLOCK_SIZE];
    block[0..4].copy_from_slice(&MAGIC_START0.to_le_bytes());
    block[4..8].copy_from_slice(&MAGIC_START1.to_le_bytes());
    block[12..16].copy_from_slice(&address.to_le_bytes());
    block[16..20].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    block[20..24].copy_from_slice(&block_no.to_le_bytes());
    block[24..28].copy_from_slice(&num_blocks.to_le_bytes());
    block[32..32 + payload.len()].copy_from_slice(payload);
    block[508..512].copy_from_slice(&MAGIC_END.to_le_bytes());
    block
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unpacks_out_of_order_blocks_with_gap() {
        let mut data = pack_block(0x0040_0100, &[5, 6], 1, 2);
        data.extend(pack_block(0x0040_0000, &[1, 2, 3, 4], 0, 2));
        assert!(is_uf2(&data));
        let image = unpack(&data).unwrap();
        assert_eq!(image.len(), 0x102);
        assert_eq!(&image[..4], &[1, 2, 3, 4]);
        assert_eq!(image[4], 0xFF);
        assert_eq!(&image[0x100..], &[5, 6]);
    }

    #[test]
    fn rejects_damaged_files() {
        let mut block = pack_block(0, &[1], 0, 1);
        assert_eq!(unpack(&block[..100]).unwrap_err(), Uf2Error::Truncated(100));
        block[508] ^= 0xFF;
        assert_eq!(unpack(&block).unwrap_err(), Uf2Error::BadMagic(0));
        assert!(!is_uf2(b"plain binary"));
    }

    #[test]
    fn skips_blocks_not_for_main_flash() {
        let mut block = pack_block(0, &[9], 0, 1);
        block[8] = 1;
        assert_eq!(unpack(&block).unwrap_err(), Uf2Error::Empty);
    }

    #[test]
    fn refuses_blocks_spread_across_the_address_space() {
        let mut data = pack_block(0, &[1], 0, 2);
        data.extend(pack_block(0xFFFF_FFF0, &[2], 1, 2));
        assert_eq!(unpack(&data).unwrap_err(), Uf2Error::TooLarge(0xFFFF_FFF1));
    }
}
