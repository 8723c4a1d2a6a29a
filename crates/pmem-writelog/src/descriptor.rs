//! Fixed-layout log entry descriptors.
//!
//! One descriptor describes one logged write (or sync point). The layout is
//! little-endian, exactly 64 bytes, and must be preserved across processes:
//!
//! ```text
//! | 0..8    sync_gen_number        u64 |
//! | 8..16   write_sequence_number  u64 |
//! | 16..24  image_offset_bytes    u64 |
//! | 24..32  write_bytes           u64 |
//! | 32..40  payload_handle        u64 |
//! | 40      flags                 u8  |
//! | 41..64  reserved                  |
//! ```

use byteorder::{ByteOrder, LittleEndian};

use crate::extent::{block_extent, BlockExtent};

pub const DESCRIPTOR_SIZE: usize = 64;

/// Slot occupied by a live entry.
pub const FLAG_ENTRY_VALID: u8 = 1 << 0;
/// No data; marks the sync point for this sync gen number.
pub const FLAG_SYNC_POINT: u8 = 1 << 1;
/// `write_sequence_number` is meaningful.
pub const FLAG_SEQUENCED: u8 = 1 << 2;
/// `payload_handle` references pool-resident payload bytes.
pub const FLAG_HAS_DATA: u8 = 1 << 3;
/// Entry records an unmap; `has_data` is clear.
pub const FLAG_UNMAP: u8 = 1 << 4;

/// In-memory image of one pool-resident descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DescriptorRecord {
    pub sync_gen_number: u64,
    pub write_sequence_number: u64,
    pub image_offset_bytes: u64,
    pub write_bytes: u64,
    pub payload_handle: u64,
    pub flags: u8,
}

impl DescriptorRecord {
    /// Descriptor for a write of `write_bytes` at `image_offset_bytes`.
    pub fn for_write(image_offset_bytes: u64, write_bytes: u64) -> Self {
        Self {
            image_offset_bytes,
            write_bytes,
            ..Default::default()
        }
    }

    /// Descriptor marking the sync point of `sync_gen_number`.
    pub fn for_sync_point(sync_gen_number: u64, final_op_sequence: u64) -> Self {
        let mut record = DescriptorRecord {
            sync_gen_number,
            write_sequence_number: final_op_sequence,
            ..Default::default()
        };
        record.set_flag(FLAG_SYNC_POINT, true);
        record.set_flag(FLAG_SEQUENCED, final_op_sequence != 0);
        record
    }

    #[inline]
    pub fn flag(&self, bit: u8) -> bool {
        self.flags & bit != 0
    }

    #[inline]
    pub fn set_flag(&mut self, bit: u8, value: bool) {
        if value {
            self.flags |= bit;
        } else {
            self.flags &= !bit;
        }
    }

    #[inline]
    pub fn entry_valid(&self) -> bool {
        self.flag(FLAG_ENTRY_VALID)
    }

    #[inline]
    pub fn is_sync_point(&self) -> bool {
        self.flag(FLAG_SYNC_POINT)
    }

    #[inline]
    pub fn has_data(&self) -> bool {
        self.flag(FLAG_HAS_DATA)
    }

    /// Block extent covered by this entry's write.
    pub fn block_extent(&self) -> BlockExtent {
        block_extent(self.image_offset_bytes, self.write_bytes)
    }

    pub fn encode(&self, buf: &mut [u8; DESCRIPTOR_SIZE]) {
        buf.fill(0);
        LittleEndian::write_u64(&mut buf[0..8], self.sync_gen_number);
        LittleEndian::write_u64(&mut buf[8..16], self.write_sequence_number);
        LittleEndian::write_u64(&mut buf[16..24], self.image_offset_bytes);
        LittleEndian::write_u64(&mut buf[24..32], self.write_bytes);
        LittleEndian::write_u64(&mut buf[32..40], self.payload_handle);
        buf[40] = self.flags;
    }

    pub fn decode(buf: &[u8; DESCRIPTOR_SIZE]) -> Self {
        Self {
            sync_gen_number: LittleEndian::read_u64(&buf[0..8]),
            write_sequence_number: LittleEndian::read_u64(&buf[8..16]),
            image_offset_bytes: LittleEndian::read_u64(&buf[16..24]),
            write_bytes: LittleEndian::read_u64(&buf[24..32]),
            payload_handle: LittleEndian::read_u64(&buf[32..40]),
            flags: buf[40],
        }
    }
}

const _: () = {
    assert!(DESCRIPTOR_SIZE == 64);
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut record = DescriptorRecord::for_write(4096, 1024);
        record.sync_gen_number = 7;
        record.write_sequence_number = 42;
        record.payload_handle = 0xdead_0000;
        record.set_flag(FLAG_ENTRY_VALID, true);
        record.set_flag(FLAG_SEQUENCED, true);
        record.set_flag(FLAG_HAS_DATA, true);

        let mut buf = [0u8; DESCRIPTOR_SIZE];
        record.encode(&mut buf);
        assert_eq!(DescriptorRecord::decode(&buf), record);
    }

    #[test]
    fn flag_bit_positions_are_stable() {
        let mut record = DescriptorRecord::default();
        record.set_flag(FLAG_ENTRY_VALID, true);
        record.set_flag(FLAG_HAS_DATA, true);
        let mut buf = [0u8; DESCRIPTOR_SIZE];
        record.encode(&mut buf);
        assert_eq!(buf[40], 0b0000_1001);
    }

    #[test]
    fn sync_point_record_has_no_data() {
        let record = DescriptorRecord::for_sync_point(3, 19);
        assert!(record.is_sync_point());
        assert!(!record.has_data());
        assert!(record.flag(FLAG_SEQUENCED));
        assert_eq!(record.write_sequence_number, 19);
    }

    #[test]
    fn zeroed_slot_decodes_invalid() {
        let buf = [0u8; DESCRIPTOR_SIZE];
        let record = DescriptorRecord::decode(&buf);
        assert!(!record.entry_valid());
    }

    #[test]
    fn block_extent_of_write() {
        let record = DescriptorRecord::for_write(512, 1024);
        assert_eq!(record.block_extent(), BlockExtent::new(1, 2));
    }
}
