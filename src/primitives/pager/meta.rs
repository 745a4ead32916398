//! Meta pages: the dual-slot crash-safe root handoff.
//!
//! Pages 0 and 1 each hold one meta record. A commit overwrites the slot
//! with the older transaction id, so a torn meta write can only damage the
//! slot that was already stale; the other slot keeps the previous root set.

use std::ops::Range;

use crate::primitives::io::FileIo;
use crate::types::{
    PageId, Result, TxId, ZatError, FIRST_DATA_PAGE, FORMAT_VERSION, MAGIC, MIN_PAGE_SIZE,
};

/// Number of meta bytes actually used; the rest of the page is zero padding.
pub const META_LEN: usize = 92;

const META_MAGIC: Range<usize> = 0..4;
const META_VERSION: Range<usize> = 4..8;
const META_PAGE_SIZE: Range<usize> = 8..12;
const META_FLAGS: Range<usize> = 12..16;
const META_TX_ID: Range<usize> = 16..24;
const META_EAV_ROOT: Range<usize> = 24..32;
const META_AVE_ROOT: Range<usize> = 32..40;
const META_VAE_ROOT: Range<usize> = 40..48;
const META_TXLOG_ROOT: Range<usize> = 48..56;
const META_FREE_ROOT: Range<usize> = 56..64;
const META_NEXT_ENTITY: Range<usize> = 64..72;
const META_NEXT_PAGE: Range<usize> = 72..80;
const META_DATOM_COUNT: Range<usize> = 80..88;
const META_CRC32: Range<usize> = 88..92;

/// Page sizes probed when slot 0 is unreadable and slot 1's offset is
/// therefore unknown.
const PAGE_SIZE_CANDIDATES: [u32; 8] = [512, 1024, 2048, 4096, 8192, 16384, 32768, 65536];

/// Decoded meta record: one committed snapshot of the whole database.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    pub page_size: u32,
    pub flags: u32,
    pub tx_id: TxId,
    pub eav_root: PageId,
    pub ave_root: PageId,
    pub vae_root: PageId,
    pub txlog_root: PageId,
    pub free_root: PageId,
    pub next_entity: u64,
    pub next_page: PageId,
    pub datom_count: u64,
}

impl Meta {
    /// Meta record for a freshly created file, before bootstrap runs.
    pub fn initial(page_size: u32) -> Self {
        Meta {
            page_size,
            flags: 0,
            tx_id: TxId(0),
            eav_root: PageId(0),
            ave_root: PageId(0),
            vae_root: PageId(0),
            txlog_root: PageId(0),
            free_root: PageId(0),
            next_entity: 1,
            next_page: PageId(FIRST_DATA_PAGE),
            datom_count: 0,
        }
    }
}

/// Encode `meta` into `buf` (at least `META_LEN` bytes; callers pass a whole
/// zeroed page) and stamp the trailing CRC.
pub fn encode_meta(buf: &mut [u8], meta: &Meta) -> Result<()> {
    if buf.len() < META_LEN {
        return Err(ZatError::Invalid("meta buffer too small"));
    }
    buf[..META_LEN].fill(0);
    buf[META_MAGIC].copy_from_slice(&MAGIC.to_be_bytes());
    buf[META_VERSION].copy_from_slice(&FORMAT_VERSION.to_be_bytes());
    buf[META_PAGE_SIZE].copy_from_slice(&meta.page_size.to_be_bytes());
    buf[META_FLAGS].copy_from_slice(&meta.flags.to_be_bytes());
    buf[META_TX_ID].copy_from_slice(&meta.tx_id.0.to_be_bytes());
    buf[META_EAV_ROOT].copy_from_slice(&meta.eav_root.0.to_be_bytes());
    buf[META_AVE_ROOT].copy_from_slice(&meta.ave_root.0.to_be_bytes());
    buf[META_VAE_ROOT].copy_from_slice(&meta.vae_root.0.to_be_bytes());
    buf[META_TXLOG_ROOT].copy_from_slice(&meta.txlog_root.0.to_be_bytes());
    buf[META_FREE_ROOT].copy_from_slice(&meta.free_root.0.to_be_bytes());
    buf[META_NEXT_ENTITY].copy_from_slice(&meta.next_entity.to_be_bytes());
    buf[META_NEXT_PAGE].copy_from_slice(&meta.next_page.0.to_be_bytes());
    buf[META_DATOM_COUNT].copy_from_slice(&meta.datom_count.to_be_bytes());
    let crc = crc32fast::hash(&buf[..META_CRC32.start]);
    buf[META_CRC32].copy_from_slice(&crc.to_be_bytes());
    Ok(())
}

/// Decode and validate a meta record. A slot is valid iff magic, version,
/// and checksum all verify.
pub fn decode_meta(buf: &[u8]) -> Result<Meta> {
    if buf.len() < META_LEN {
        return Err(ZatError::Corrupt("meta record truncated"));
    }
    let magic = u32::from_be_bytes(buf[META_MAGIC].try_into().unwrap());
    if magic != MAGIC {
        return Err(ZatError::Corrupt("bad meta magic"));
    }
    let version = u32::from_be_bytes(buf[META_VERSION].try_into().unwrap());
    if version != FORMAT_VERSION {
        return Err(ZatError::Corrupt("unsupported format version"));
    }
    let stored_crc = u32::from_be_bytes(buf[META_CRC32].try_into().unwrap());
    let crc = crc32fast::hash(&buf[..META_CRC32.start]);
    if crc != stored_crc {
        return Err(ZatError::Corrupt("meta checksum mismatch"));
    }
    let page_size = u32::from_be_bytes(buf[META_PAGE_SIZE].try_into().unwrap());
    if page_size < MIN_PAGE_SIZE || !page_size.is_power_of_two() {
        return Err(ZatError::Corrupt("meta page size out of range"));
    }
    Ok(Meta {
        page_size,
        flags: u32::from_be_bytes(buf[META_FLAGS].try_into().unwrap()),
        tx_id: TxId(u64::from_be_bytes(buf[META_TX_ID].try_into().unwrap())),
        eav_root: PageId(u64::from_be_bytes(buf[META_EAV_ROOT].try_into().unwrap())),
        ave_root: PageId(u64::from_be_bytes(buf[META_AVE_ROOT].try_into().unwrap())),
        vae_root: PageId(u64::from_be_bytes(buf[META_VAE_ROOT].try_into().unwrap())),
        txlog_root: PageId(u64::from_be_bytes(
            buf[META_TXLOG_ROOT].try_into().unwrap(),
        )),
        free_root: PageId(u64::from_be_bytes(buf[META_FREE_ROOT].try_into().unwrap())),
        next_entity: u64::from_be_bytes(buf[META_NEXT_ENTITY].try_into().unwrap()),
        next_page: PageId(u64::from_be_bytes(buf[META_NEXT_PAGE].try_into().unwrap())),
        datom_count: u64::from_be_bytes(buf[META_DATOM_COUNT].try_into().unwrap()),
    })
}

/// Write `meta` into file slot `slot` (0 or 1). Slot 1 lives at offset
/// `page_size`.
pub fn write_slot(io: &dyn FileIo, slot: u8, meta: &Meta) -> Result<()> {
    debug_assert!(slot < 2);
    let mut buf = vec![0u8; meta.page_size as usize];
    encode_meta(&mut buf, meta)?;
    io.write_at(slot as u64 * meta.page_size as u64, &buf)?;
    Ok(())
}

fn probe(io: &dyn FileIo, off: u64) -> Option<Meta> {
    let mut buf = [0u8; META_LEN];
    io.read_at(off, &mut buf).ok()?;
    decode_meta(&buf).ok()
}

/// Read both meta slots and return `(slot, meta)` for the valid record with
/// the highest transaction id.
///
/// Slot 1's offset equals the page size, which normally comes from slot 0;
/// when slot 0 is unreadable the offset is recovered by probing every
/// supported page size.
pub fn load_active(io: &dyn FileIo) -> Result<(u8, Meta)> {
    let slot0 = probe(io, 0);
    let slot1 = match &slot0 {
        Some(meta) => probe(io, meta.page_size as u64),
        None => PAGE_SIZE_CANDIDATES
            .iter()
            .find_map(|&ps| probe(io, ps as u64).filter(|m| m.page_size == ps)),
    };
    match (slot0, slot1) {
        (Some(a), Some(b)) => {
            if a.tx_id >= b.tx_id {
                Ok((0, a))
            } else {
                Ok((1, b))
            }
        }
        (Some(a), None) => Ok((0, a)),
        (None, Some(b)) => Ok((1, b)),
        (None, None) => Err(ZatError::Corrupt("both meta slots invalid")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::StdFileIo;
    use tempfile::tempdir;

    fn sample(tx: u64) -> Meta {
        let mut meta = Meta::initial(4096);
        meta.tx_id = TxId(tx);
        meta.eav_root = PageId(10 + tx);
        meta.next_page = PageId(100 + tx);
        meta.datom_count = tx * 3;
        meta
    }

    #[test]
    fn meta_roundtrip() {
        let meta = sample(7);
        let mut buf = vec![0u8; 4096];
        encode_meta(&mut buf, &meta).unwrap();
        assert_eq!(decode_meta(&buf).unwrap(), meta);
    }

    #[test]
    fn checksum_rejects_flipped_byte() {
        let mut buf = vec![0u8; 4096];
        encode_meta(&mut buf, &sample(1)).unwrap();
        buf[30] ^= 0xFF;
        assert!(matches!(
            decode_meta(&buf),
            Err(ZatError::Corrupt("meta checksum mismatch"))
        ));
    }

    #[test]
    fn active_slot_is_highest_valid_tx() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("meta.db")).unwrap();
        write_slot(&io, 0, &sample(4)).unwrap();
        write_slot(&io, 1, &sample(5)).unwrap();
        let (slot, meta) = load_active(&io).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(meta.tx_id, TxId(5));
    }

    #[test]
    fn corrupt_slot_falls_back_to_other() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("meta.db")).unwrap();
        write_slot(&io, 0, &sample(9)).unwrap();
        write_slot(&io, 1, &sample(8)).unwrap();
        // Torn write over the newer slot.
        io.write_at(40, &[0xAB; 16]).unwrap();
        let (slot, meta) = load_active(&io).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(meta.tx_id, TxId(8));
    }

    #[test]
    fn slot1_found_without_slot0_page_size() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("meta.db")).unwrap();
        let mut meta = sample(3);
        meta.page_size = 8192;
        write_slot(&io, 1, &meta).unwrap();
        io.write_at(0, &vec![0u8; 8192]).unwrap();
        let (slot, found) = load_active(&io).unwrap();
        assert_eq!(slot, 1);
        assert_eq!(found.tx_id, TxId(3));
    }

    #[test]
    fn both_slots_invalid_is_fatal() {
        let dir = tempdir().unwrap();
        let io = StdFileIo::open(dir.path().join("meta.db")).unwrap();
        io.write_at(0, &vec![0x55u8; 16384]).unwrap();
        assert!(matches!(
            load_active(&io),
            Err(ZatError::Corrupt("both meta slots invalid"))
        ));
    }
}
