use std::io::{Read, Write};

use crate::error::{Result, SnapshotError};

macro_rules! write_le {
    ($($name:ident: $ty:ty),* $(,)?) => {$(
        fn $name(&mut self, v: $ty) -> Result<()> {
            self.write_all(&v.to_le_bytes())?;
            Ok(())
        }
    )*};
}

macro_rules! read_le {
    ($($name:ident: $ty:ty),* $(,)?) => {$(
        fn $name(&mut self) -> Result<$ty> {
            let mut buf = [0u8; core::mem::size_of::<$ty>()];
            self.read_exact(&mut buf)?;
            Ok(<$ty>::from_le_bytes(buf))
        }
    )*};
}

/// Little-endian writers for the fields a [`crate::CpuRecord`] is made of.
pub trait WriteLeExt: Write {
    write_le!(
        write_u8: u8,
        write_u16_le: u16,
        write_u32_le: u32,
        write_i32_le: i32,
        write_u64_le: u64,
    );

    fn write_bool(&mut self, v: bool) -> Result<()> {
        self.write_u8(v as u8)
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

pub trait ReadLeExt: Read {
    read_le!(
        read_u8: u8,
        read_u16_le: u16,
        read_u32_le: u32,
        read_i32_le: i32,
        read_u64_le: u64,
    );

    /// Strict: anything other than 0 or 1 is corrupt.
    fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(SnapshotError::Corrupt("invalid bool")),
        }
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn bools_must_be_zero_or_one() {
        let mut cursor = Cursor::new(vec![1u8, 0, 2]);
        assert!(cursor.read_bool().unwrap());
        assert!(!cursor.read_bool().unwrap());
        assert!(matches!(
            cursor.read_bool().unwrap_err(),
            SnapshotError::Corrupt(_)
        ));
    }

    #[test]
    fn truncated_input_is_io_error() {
        let mut cursor = Cursor::new(vec![0x34u8, 0x12, 0x00]);
        assert_eq!(cursor.read_u16_le().unwrap(), 0x1234);
        assert!(matches!(cursor.read_u32_le().unwrap_err(), SnapshotError::Io(_)));
    }

    #[test]
    fn signed_values_keep_their_sign() {
        let mut buf = Vec::new();
        buf.write_i32_le(-1).unwrap();
        buf.write_u64_le(0x0102_0304_0506_0708).unwrap();
        assert_eq!(&buf[..4], &[0xff; 4]);
        let mut cursor = Cursor::new(buf);
        assert_eq!(cursor.read_i32_le().unwrap(), -1);
        assert_eq!(cursor.read_u64_le().unwrap(), 0x0102_0304_0506_0708);
    }
}
