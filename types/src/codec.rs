use bytes::{Buf, BufMut, Bytes};
use commonware_codec::{Error, ReadExt, Write};

/// Helper to write a string as length-prefixed UTF-8 bytes.
pub fn write_string(s: &str, writer: &mut impl BufMut) {
    let bytes = s.as_bytes();
    (bytes.len() as u32).write(writer);
    writer.put_slice(bytes);
}

/// Helper to read a string from length-prefixed UTF-8 bytes.
pub fn read_string(reader: &mut impl Buf, max_len: usize) -> Result<String, Error> {
    let bytes = read_bytes(reader, max_len)?;
    match std::str::from_utf8(&bytes) {
        Ok(s) => Ok(s.to_owned()),
        Err(_) => Err(Error::Invalid("String", "invalid UTF-8")),
    }
}

/// Helper to get encode size of a string.
pub fn string_encode_size(s: &str) -> usize {
    4 + s.len()
}

/// Helper to write a byte buffer as length-prefixed bytes.
pub fn write_bytes(bytes: &Bytes, writer: &mut impl BufMut) {
    (bytes.len() as u32).write(writer);
    writer.put_slice(bytes);
}

/// Helper to read a length-prefixed byte buffer.
pub fn read_bytes(reader: &mut impl Buf, max_len: usize) -> Result<Bytes, Error> {
    let len = u32::read(reader)? as usize;
    if len > max_len {
        return Err(Error::Invalid("Bytes", "too long"));
    }
    if reader.remaining() < len {
        return Err(Error::EndOfBuffer);
    }
    Ok(reader.copy_to_bytes(len))
}

/// Helper to get encode size of a byte buffer.
pub fn bytes_encode_size(bytes: &Bytes) -> usize {
    4 + bytes.len()
}

/// Helper to write an optional string (presence byte + contents).
pub fn write_option_string(s: &Option<String>, writer: &mut impl BufMut) {
    match s {
        Some(s) => {
            1u8.write(writer);
            write_string(s, writer);
        }
        None => 0u8.write(writer),
    }
}

/// Helper to read an optional string.
pub fn read_option_string(reader: &mut impl Buf, max_len: usize) -> Result<Option<String>, Error> {
    let present = u8::read(reader)?;
    match present {
        0 => Ok(None),
        1 => Ok(Some(read_string(reader, max_len)?)),
        _ => Err(Error::InvalidEnum(present)),
    }
}

/// Helper to get encode size of an optional string.
pub fn option_string_encode_size(s: &Option<String>) -> usize {
    1 + s.as_ref().map_or(0, |s| string_encode_size(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    #[test]
    fn read_string_rejects_too_long() {
        let mut buf = BytesMut::new();
        write_string("hello", &mut buf);

        let mut reader = buf.as_ref();
        let err = read_string(&mut reader, 4).expect_err("should reject too-long string");
        assert!(matches!(err, Error::Invalid("Bytes", "too long")));
    }

    #[test]
    fn read_string_rejects_truncated_buffers() {
        let mut buf = BytesMut::new();
        (3u32).write(&mut buf);
        buf.extend_from_slice(b"ab");

        let mut reader = buf.as_ref();
        let err = read_string(&mut reader, 10).expect_err("should reject truncated buffer");
        assert!(matches!(err, Error::EndOfBuffer));
    }

    #[test]
    fn read_string_rejects_invalid_utf8() {
        let mut buf = BytesMut::new();
        (2u32).write(&mut buf);
        buf.extend_from_slice(&[0xff, 0xff]);

        let mut reader = buf.as_ref();
        let err = read_string(&mut reader, 10).expect_err("should reject invalid UTF-8");
        assert!(matches!(err, Error::Invalid("String", "invalid UTF-8")));
    }

    #[test]
    fn option_string_rejects_bad_presence_byte() {
        let mut buf = BytesMut::new();
        2u8.write(&mut buf);

        let mut reader = buf.as_ref();
        let err = read_option_string(&mut reader, 10).expect_err("should reject presence byte");
        assert!(matches!(err, Error::InvalidEnum(2)));
    }

    #[test]
    fn bytes_round_trip_at_bound() {
        let payload = Bytes::from(vec![7u8; 32]);
        let mut buf = BytesMut::new();
        write_bytes(&payload, &mut buf);
        assert_eq!(buf.len(), bytes_encode_size(&payload));

        let mut reader = buf.as_ref();
        let decoded = read_bytes(&mut reader, 32).expect("within bound");
        assert_eq!(decoded, payload);
    }
}
