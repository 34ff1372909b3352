//! Typed primitive codec: scalar and array values with a selectable
//! byte order.
//!
//! The byte order is a property of the file (fixed by the CDR encoding),
//! not of individual calls, so every function here is parametric in it.
//! Record headers do not go through this module; they are always
//! big-endian and handled by [`crate::records`].

use byteorder::{BigEndian, ByteOrder as _, LittleEndian};

use crate::error::Error;
use crate::models::{ByteOrder, CdfType, Epoch16, Values};

macro_rules! read_into {
    ($buf:expr, $count:expr, $order:expr, $width:literal, $read:ident, $t:ty) => {{
        let mut out: Vec<$t> = vec![Default::default(); $count];
        match $order {
            ByteOrder::Big => BigEndian::$read(&$buf[..$count * $width], &mut out),
            ByteOrder::Little => LittleEndian::$read(&$buf[..$count * $width], &mut out),
        }
        out
    }};
}

macro_rules! write_from {
    ($vals:expr, $order:expr, $width:literal, $write:ident) => {{
        let mut out = vec![0u8; $vals.len() * $width];
        match $order {
            ByteOrder::Big => BigEndian::$write($vals, &mut out),
            ByteOrder::Little => LittleEndian::$write($vals, &mut out),
        }
        out
    }};
}

/// Decodes `count` values of `ty` from the front of `buf`.
///
/// `num_elems` is the fixed character length for string types and must be
/// 1 otherwise. Fails with [`Error::UnexpectedEof`] when `buf` is shorter
/// than `count * byte_size`; there is no silent truncation.
pub fn read_array(
    buf: &[u8],
    ty: CdfType,
    count: usize,
    num_elems: usize,
    order: ByteOrder,
) -> Result<Values, Error> {
    let needed = count * ty.byte_size(num_elems);
    if buf.len() < needed {
        return Err(Error::UnexpectedEof);
    }
    Ok(match ty {
        CdfType::Int1 | CdfType::Byte => {
            Values::Int1(bytemuck::cast_slice(&buf[..count]).to_vec())
        }
        CdfType::UInt1 => Values::UInt1(buf[..count].to_vec()),
        CdfType::Int2 => Values::Int2(read_into!(buf, count, order, 2, read_i16_into, i16)),
        CdfType::UInt2 => Values::UInt2(read_into!(buf, count, order, 2, read_u16_into, u16)),
        CdfType::Int4 => Values::Int4(read_into!(buf, count, order, 4, read_i32_into, i32)),
        CdfType::UInt4 => Values::UInt4(read_into!(buf, count, order, 4, read_u32_into, u32)),
        CdfType::Int8 => Values::Int8(read_into!(buf, count, order, 8, read_i64_into, i64)),
        CdfType::TimeTt2000 => {
            Values::TimeTt2000(read_into!(buf, count, order, 8, read_i64_into, i64))
        }
        CdfType::Real4 | CdfType::Float => {
            Values::Real4(read_into!(buf, count, order, 4, read_f32_into, f32))
        }
        CdfType::Real8 | CdfType::Double => {
            Values::Real8(read_into!(buf, count, order, 8, read_f64_into, f64))
        }
        CdfType::Epoch => Values::Epoch(read_into!(buf, count, order, 8, read_f64_into, f64)),
        CdfType::Epoch16 => {
            let flat: Vec<f64> = read_into!(buf, 2 * count, order, 8, read_f64_into, f64);
            Values::Epoch16(
                flat.chunks_exact(2)
                    .map(|p| Epoch16::new(p[0], p[1]))
                    .collect(),
            )
        }
        CdfType::Char | CdfType::UChar => {
            let mut strings = Vec::with_capacity(count);
            for i in 0..count {
                let raw = &buf[i * num_elems..(i + 1) * num_elems];
                // Everything after the first NUL is padding.
                let end = raw.iter().position(|&b| b == 0).unwrap_or(num_elems);
                strings.push(String::from_utf8_lossy(&raw[..end]).into_owned());
            }
            Values::Char(strings)
        }
    })
}

/// Decodes a single value of `ty` from the front of `buf`.
pub fn read_scalar(
    buf: &[u8],
    ty: CdfType,
    num_elems: usize,
    order: ByteOrder,
) -> Result<Values, Error> {
    read_array(buf, ty, 1, num_elems, order)
}

/// Encodes `vals` as on-disk bytes for `ty`.
///
/// The variant of `vals` must be storage-compatible with `ty`
/// ([`Values::compatible_with`]); strings longer than `num_elems` are an
/// error, shorter ones are NUL-padded to the fixed width.
pub fn write_array(
    vals: &Values,
    ty: CdfType,
    num_elems: usize,
    order: ByteOrder,
) -> Result<Vec<u8>, Error> {
    if !vals.compatible_with(ty) {
        return Err(Error::OutOfRange(format!(
            "value class {} cannot be stored as {}",
            vals.data_type().name(),
            ty.name()
        )));
    }
    Ok(match vals {
        Values::Int1(v) => bytemuck::cast_slice(v).to_vec(),
        Values::UInt1(v) => v.clone(),
        Values::Int2(v) => write_from!(v, order, 2, write_i16_into),
        Values::UInt2(v) => write_from!(v, order, 2, write_u16_into),
        Values::Int4(v) => write_from!(v, order, 4, write_i32_into),
        Values::UInt4(v) => write_from!(v, order, 4, write_u32_into),
        Values::Int8(v) | Values::TimeTt2000(v) => write_from!(v, order, 8, write_i64_into),
        Values::Real4(v) => write_from!(v, order, 4, write_f32_into),
        Values::Real8(v) | Values::Epoch(v) => write_from!(v, order, 8, write_f64_into),
        Values::Epoch16(v) => {
            let flat: Vec<f64> = v
                .iter()
                .flat_map(|e| [e.seconds, e.picoseconds])
                .collect();
            write_from!(&flat, order, 8, write_f64_into)
        }
        Values::Char(strings) => {
            let mut out = Vec::with_capacity(strings.len() * num_elems);
            for s in strings {
                let bytes = s.as_bytes();
                if bytes.len() > num_elems {
                    return Err(Error::OutOfRange(format!(
                        "string of {} bytes exceeds the declared element count {}",
                        bytes.len(),
                        num_elems
                    )));
                }
                out.extend_from_slice(bytes);
                out.resize(out.len() + num_elems - bytes.len(), 0);
            }
            out
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integers_round_trip_both_orders() {
        for order in [ByteOrder::Big, ByteOrder::Little] {
            let vals = Values::Int4(vec![-2, 0, 7_000_000]);
            let bytes = write_array(&vals, CdfType::Int4, 1, order).unwrap();
            assert_eq!(bytes.len(), 12);
            let back = read_array(&bytes, CdfType::Int4, 3, 1, order).unwrap();
            assert_eq!(back, vals);
        }
    }

    #[test]
    fn doubles_respect_byte_order() {
        let vals = Values::Real8(vec![1.5]);
        let be = write_array(&vals, CdfType::Real8, 1, ByteOrder::Big).unwrap();
        let le = write_array(&vals, CdfType::Real8, 1, ByteOrder::Little).unwrap();
        assert_eq!(be, le.iter().rev().copied().collect::<Vec<u8>>());
        assert_eq!(
            read_array(&be, CdfType::Real8, 1, 1, ByteOrder::Big).unwrap(),
            vals
        );
    }

    #[test]
    fn epoch16_pairs() {
        let vals = Values::Epoch16(vec![Epoch16::new(63113904000.0, 5.0e11)]);
        let bytes = write_array(&vals, CdfType::Epoch16, 1, ByteOrder::Big).unwrap();
        assert_eq!(bytes.len(), 16);
        let back = read_array(&bytes, CdfType::Epoch16, 1, 1, ByteOrder::Big).unwrap();
        assert_eq!(back, vals);
    }

    #[test]
    fn strings_pad_and_strip() {
        let vals = Values::Char(vec!["abc".into(), "hello".into()]);
        let bytes = write_array(&vals, CdfType::Char, 8, ByteOrder::Big).unwrap();
        assert_eq!(bytes.len(), 16);
        let back = read_array(&bytes, CdfType::Char, 2, 8, ByteOrder::Big).unwrap();
        assert_eq!(back, vals);
    }

    #[test]
    fn oversized_string_rejected() {
        let vals = Values::Char(vec!["too long".into()]);
        assert!(write_array(&vals, CdfType::Char, 4, ByteOrder::Big).is_err());
    }

    #[test]
    fn short_buffer_rejected() {
        let bytes = [0u8; 6];
        assert!(matches!(
            read_array(&bytes, CdfType::Real8, 1, 1, ByteOrder::Big),
            Err(Error::UnexpectedEof)
        ));
    }

    #[test]
    fn class_mismatch_rejected() {
        let vals = Values::Int2(vec![1]);
        assert!(write_array(&vals, CdfType::Real8, 1, ByteOrder::Big).is_err());
    }
}
