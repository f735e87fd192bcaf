pub(crate) trait SliceExt {
    fn read_u16(&self) -> u16;
    fn read_u32(&self) -> u32;
    fn read_u64(&self) -> u64;

    fn read_le_i32(&self) -> i32;
    fn read_le_i64(&self) -> i64;
    fn read_le_u64(&self) -> u64;
}

// The table files keep the little endian layout of their on-disk format while everything the
// write-ahead log produces is big endian.
impl SliceExt for [u8] {
    fn read_u16(&self) -> u16 {
        u16::from_be_bytes(self[..2].try_into().unwrap())
    }
    fn read_u32(&self) -> u32 {
        u32::from_be_bytes(self[..4].try_into().unwrap())
    }
    fn read_u64(&self) -> u64 {
        u64::from_be_bytes(self[..8].try_into().unwrap())
    }

    fn read_le_i32(&self) -> i32 {
        i32::from_le_bytes(self[..4].try_into().unwrap())
    }
    fn read_le_i64(&self) -> i64 {
        i64::from_le_bytes(self[..8].try_into().unwrap())
    }
    fn read_le_u64(&self) -> u64 {
        u64::from_le_bytes(self[..8].try_into().unwrap())
    }
}
