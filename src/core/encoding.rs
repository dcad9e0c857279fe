//! Wire encodings shared by every message and object
//!
//! Integers are big endian. `var_int` uses the 0xfd/0xfe/0xff prefixes and
//! must be minimally encoded.

use bytes::BufMut;
use std::io::{self, Read};
use thiserror::Error;

/// Errors raised while decoding wire data
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
    #[error("var_int is not minimally encoded")]
    NonMinimalVarInt,
    #[error("Length {0} exceeds limit {1}")]
    TooLong(u64, usize),
    #[error("Invalid UTF-8 string")]
    InvalidString,
    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Write a variable length integer
pub fn put_var_int(buf: &mut impl BufMut, value: u64) {
    if value < 0xfd {
        buf.put_u8(value as u8);
    } else if value <= 0xffff {
        buf.put_u8(0xfd);
        buf.put_u16(value as u16);
    } else if value <= 0xffff_ffff {
        buf.put_u8(0xfe);
        buf.put_u32(value as u32);
    } else {
        buf.put_u8(0xff);
        buf.put_u64(value);
    }
}

/// Write a length-prefixed byte string
pub fn put_var_bytes(buf: &mut impl BufMut, data: &[u8]) {
    put_var_int(buf, data.len() as u64);
    buf.put_slice(data);
}

/// Write a length-prefixed UTF-8 string
pub fn put_var_str(buf: &mut impl BufMut, value: &str) {
    put_var_bytes(buf, value.as_bytes());
}

/// Write a count-prefixed list of var_ints
pub fn put_var_int_list(buf: &mut impl BufMut, values: &[u64]) {
    put_var_int(buf, values.len() as u64);
    for value in values {
        put_var_int(buf, *value);
    }
}

/// Encode a single var_int into a fresh buffer
pub fn var_int_bytes(value: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    put_var_int(&mut buf, value);
    buf
}

pub fn read_array<const N: usize>(r: &mut impl Read) -> Result<[u8; N], DecodeError> {
    let mut out = [0u8; N];
    r.read_exact(&mut out)?;
    Ok(out)
}

pub fn read_bytes(r: &mut impl Read, len: usize) -> Result<Vec<u8>, DecodeError> {
    let mut out = vec![0u8; len];
    r.read_exact(&mut out)?;
    Ok(out)
}

pub fn read_u8(r: &mut impl Read) -> Result<u8, DecodeError> {
    Ok(read_array::<1>(r)?[0])
}

pub fn read_u16(r: &mut impl Read) -> Result<u16, DecodeError> {
    Ok(u16::from_be_bytes(read_array(r)?))
}

pub fn read_u32(r: &mut impl Read) -> Result<u32, DecodeError> {
    Ok(u32::from_be_bytes(read_array(r)?))
}

pub fn read_u64(r: &mut impl Read) -> Result<u64, DecodeError> {
    Ok(u64::from_be_bytes(read_array(r)?))
}

pub fn read_i64(r: &mut impl Read) -> Result<i64, DecodeError> {
    Ok(i64::from_be_bytes(read_array(r)?))
}

/// Read a variable length integer, rejecting non-minimal encodings
pub fn read_var_int(r: &mut impl Read) -> Result<u64, DecodeError> {
    let (value, minimum) = match read_u8(r)? {
        0xfd => (read_u16(r)? as u64, 0xfd),
        0xfe => (read_u32(r)? as u64, 0x1_0000),
        0xff => (read_u64(r)?, 0x1_0000_0000),
        small => return Ok(small as u64),
    };
    if value < minimum {
        return Err(DecodeError::NonMinimalVarInt);
    }
    Ok(value)
}

/// Read a var_int length and check it against a limit
pub fn read_length(r: &mut impl Read, max: usize) -> Result<usize, DecodeError> {
    let len = read_var_int(r)?;
    if len > max as u64 {
        return Err(DecodeError::TooLong(len, max));
    }
    Ok(len as usize)
}

pub fn read_var_bytes(r: &mut impl Read, max: usize) -> Result<Vec<u8>, DecodeError> {
    let len = read_length(r, max)?;
    read_bytes(r, len)
}

pub fn read_var_str(r: &mut impl Read, max: usize) -> Result<String, DecodeError> {
    String::from_utf8(read_var_bytes(r, max)?).map_err(|_| DecodeError::InvalidString)
}

pub fn read_var_int_list(r: &mut impl Read, max: usize) -> Result<Vec<u64>, DecodeError> {
    let count = read_length(r, max)?;
    (0..count).map(|_| read_var_int(r)).collect()
}

/// Read everything left in the reader
pub fn read_remaining(r: &mut impl Read) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::new();
    r.read_to_end(&mut out)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_var_int_boundaries() {
        let cases: [(u64, usize); 7] = [
            (0, 1),
            (0xfc, 1),
            (0xfd, 3),
            (0xffff, 3),
            (0x1_0000, 5),
            (0xffff_ffff, 5),
            (0x1_0000_0000, 9),
        ];
        for (value, len) in cases {
            let encoded = var_int_bytes(value);
            assert_eq!(encoded.len(), len, "length of {value:#x}");
            assert_eq!(read_var_int(&mut Cursor::new(encoded)).unwrap(), value);
        }
    }

    #[test]
    fn test_non_minimal_var_int_rejected() {
        let encoded = [0xfd, 0x00, 0x10];
        assert!(matches!(
            read_var_int(&mut Cursor::new(encoded)),
            Err(DecodeError::NonMinimalVarInt)
        ));
    }

    #[test]
    fn test_var_str_limit() {
        let mut buf = Vec::new();
        put_var_str(&mut buf, "/mini-bitmessage:0.1.0/");
        assert!(read_var_str(&mut Cursor::new(buf.clone()), 5).is_err());
        assert_eq!(
            read_var_str(&mut Cursor::new(buf), 100).unwrap(),
            "/mini-bitmessage:0.1.0/"
        );
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let mut buf = Vec::new();
        put_var_bytes(&mut buf, &[1, 2, 3, 4]);
        buf.truncate(3);
        assert!(read_var_bytes(&mut Cursor::new(buf), 100).is_err());
    }
}
