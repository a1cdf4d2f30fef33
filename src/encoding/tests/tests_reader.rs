//! Tests for the encoding primitives and the [`Reader`] cursor.

#[cfg(test)]
mod tests {
    use crate::encoding::*;

    #[test]
    fn integers_are_little_endian() {
        let bytes = encode_to_vec(&0xDEAD_BEEFu32).unwrap();
        assert_eq!(bytes, [0xEF, 0xBE, 0xAD, 0xDE]);
        assert_eq!(decode_exact::<u32>(&bytes).unwrap(), 0xDEAD_BEEF);

        let bytes = encode_to_vec(&0x0102_0304_0506_0708u64).unwrap();
        assert_eq!(bytes, [8, 7, 6, 5, 4, 3, 2, 1]);
    }

    #[test]
    fn reader_decodes_a_sequence_of_fields() {
        let mut buf = Vec::new();
        7u8.encode_to(&mut buf).unwrap();
        b"key".to_vec().encode_to(&mut buf).unwrap();
        Some(42u64).encode_to(&mut buf).unwrap();
        None::<u64>.encode_to(&mut buf).unwrap();
        "name".to_string().encode_to(&mut buf).unwrap();
        true.encode_to(&mut buf).unwrap();

        let mut reader = Reader::new(&buf);
        assert_eq!(reader.read::<u8>().unwrap(), 7);
        assert_eq!(reader.read::<Vec<u8>>().unwrap(), b"key");
        assert_eq!(reader.read::<Option<u64>>().unwrap(), Some(42));
        assert_eq!(reader.read::<Option<u64>>().unwrap(), None);
        assert_eq!(reader.read::<String>().unwrap(), "name");
        assert!(reader.read::<bool>().unwrap());
        assert_eq!(reader.remaining(), 0);
        assert_eq!(reader.position(), buf.len());
    }

    #[test]
    fn empty_byte_vector_is_preserved() {
        let bytes = encode_to_vec(&Vec::<u8>::new()).unwrap();
        assert_eq!(bytes, [0, 0, 0, 0]);
        let decoded: Vec<u8> = decode_exact(&bytes).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn truncated_input_reports_eof() {
        let bytes = encode_to_vec(&b"abcdef".to_vec()).unwrap();
        let err = decode_exact::<Vec<u8>>(&bytes[..bytes.len() - 2]).unwrap_err();
        assert!(matches!(
            err,
            EncodingError::UnexpectedEof {
                needed: 6,
                available: 4
            }
        ));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = encode_to_vec(&1u32).unwrap();
        bytes.push(0);
        assert!(matches!(
            decode_exact::<u32>(&bytes),
            Err(EncodingError::TrailingBytes(1))
        ));
    }

    #[test]
    fn invalid_bool_and_option_tags() {
        assert!(matches!(
            decode_exact::<bool>(&[2]),
            Err(EncodingError::InvalidBool(2))
        ));
        assert!(matches!(
            decode_exact::<Option<u8>>(&[9, 0]),
            Err(EncodingError::InvalidTag { tag: 9, .. })
        ));
    }

    #[test]
    fn oversized_lengths_are_rejected_before_allocation() {
        let mut bytes = Vec::new();
        (MAX_BYTE_LEN + 1).encode_to(&mut bytes).unwrap();
        assert!(matches!(
            decode_exact::<Vec<u8>>(&bytes),
            Err(EncodingError::LengthOverflow(_))
        ));

        let mut bytes = Vec::new();
        (MAX_VEC_ELEMENTS + 1).encode_to(&mut bytes).unwrap();
        let mut reader = Reader::new(&bytes);
        assert!(matches!(
            decode_vec::<u64>(&mut reader),
            Err(EncodingError::LengthOverflow(_))
        ));
    }

    #[test]
    fn vectors_of_structs_use_count_prefix() {
        let mut buf = Vec::new();
        encode_vec(&[1u16, 2, 3], &mut buf).unwrap();
        assert_eq!(&buf[..4], &3u32.to_le_bytes());
        let mut reader = Reader::new(&buf);
        assert_eq!(decode_vec::<u16>(&mut reader).unwrap(), vec![1, 2, 3]);
    }
}
