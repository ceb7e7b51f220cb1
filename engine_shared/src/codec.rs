//! Datagram codec.
//!
//! Binary encoding for the values carried inside one framed payload. All
//! integers are big-endian:
//! - bool: 1 byte (0/1)
//! - int: 8-byte signed
//! - float: 8-byte IEEE-754
//! - string: 4-byte length + UTF-8 bytes
//! - Vec2/Vec3/Vec4: 2/3/4 consecutive floats
//! - tuple: elements back to back, no prefix
//! - list: 2-byte element count + elements back to back
//! - blob: 4-byte length + raw bytes
//!
//! The read side never infers a type from the bytes; the caller names the
//! type it expects. Application types join the codec by implementing
//! [`Datagram`] in terms of the builtin encodings.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::math::{Vec2, Vec3, Vec4};

/// Errors raised while encoding or decoding datagram values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The buffer ended before the requested value was complete.
    #[error("unexpected end of datagram: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof { needed: usize, remaining: usize },

    /// A received list declared more elements than the reader allows.
    #[error("list of {len} elements exceeds limit of {max}")]
    ListExceedsLimit { len: usize, max: usize },

    /// A value is too long for its length prefix.
    #[error("{kind} of length {len} does not fit its length prefix")]
    TooLong { kind: &'static str, len: usize },

    #[error("invalid bool byte: {0}")]
    InvalidBool(u8),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// Bytes left over once every expected value was read.
    #[error("{0} trailing bytes after the last value")]
    TrailingBytes(usize),
}

/// Type descriptor for a datagram value.
///
/// Used as the explicit per-argument descriptor of registered procedures.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TypeTag {
    Bool,
    Int,
    Float,
    Str,
    Vec2,
    Vec3,
    Vec4,
    Blob,
    Tuple(Vec<TypeTag>),
    List(Box<TypeTag>),
    /// Application type, named for diagnostics.
    Custom(&'static str),
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeTag::Bool => write!(f, "bool"),
            TypeTag::Int => write!(f, "int"),
            TypeTag::Float => write!(f, "float"),
            TypeTag::Str => write!(f, "str"),
            TypeTag::Vec2 => write!(f, "vec2"),
            TypeTag::Vec3 => write!(f, "vec3"),
            TypeTag::Vec4 => write!(f, "vec4"),
            TypeTag::Blob => write!(f, "bytes"),
            TypeTag::Tuple(items) => {
                write!(f, "(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, ")")
            }
            TypeTag::List(inner) => write!(f, "list[{inner}]"),
            TypeTag::Custom(name) => write!(f, "{name}"),
        }
    }
}

/// A value with a fixed datagram encoding.
pub trait Datagram: Sized {
    /// Descriptor of this type's encoding.
    fn type_tag() -> TypeTag;

    fn write_to(&self, w: &mut DatagramWriter) -> Result<(), CodecError>;

    fn read_from(r: &mut DatagramReader<'_>) -> Result<Self, CodecError>;
}

/// Appends encoded values to an in-progress payload.
#[derive(Debug, Default)]
pub struct DatagramWriter {
    buf: BytesMut,
}

impl DatagramWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Encodes any datagram value.
    pub fn write<T: Datagram>(&mut self, value: &T) -> Result<(), CodecError> {
        value.write_to(self)
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn put_int(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn put_float(&mut self, v: f64) {
        self.buf.put_f64(v);
    }

    /// Raw 4-byte integer, used for procedure ids.
    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn put_str(&mut self, v: &str) -> Result<(), CodecError> {
        self.put_blob(v.as_bytes()).map_err(|_| CodecError::TooLong {
            kind: "string",
            len: v.len(),
        })
    }

    pub fn put_blob(&mut self, v: &[u8]) -> Result<(), CodecError> {
        let len = u32::try_from(v.len()).map_err(|_| CodecError::TooLong {
            kind: "blob",
            len: v.len(),
        })?;
        self.buf.put_u32(len);
        self.buf.put_slice(v);
        Ok(())
    }

    /// Writes a list element count.
    pub fn put_list_len(&mut self, len: usize) -> Result<(), CodecError> {
        let count = u16::try_from(len).map_err(|_| CodecError::TooLong { kind: "list", len })?;
        self.buf.put_u16(count);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finishes the payload.
    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Consumes encoded values from a received payload.
///
/// Every list read through this reader, nested or not, is bounded by
/// `max_list_length`.
#[derive(Debug)]
pub struct DatagramReader<'a> {
    buf: &'a [u8],
    max_list_length: usize,
}

impl<'a> DatagramReader<'a> {
    pub fn new(buf: &'a [u8], max_list_length: usize) -> Self {
        Self {
            buf,
            max_list_length,
        }
    }

    /// Decodes a value of the requested type.
    pub fn read<T: Datagram>(&mut self) -> Result<T, CodecError> {
        T::read_from(self)
    }

    pub fn max_list_length(&self) -> usize {
        self.max_list_length
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize) -> Result<(), CodecError> {
        if self.buf.remaining() < needed {
            return Err(CodecError::UnexpectedEof {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_bool(&mut self) -> Result<bool, CodecError> {
        self.ensure(1)?;
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    pub fn get_int(&mut self) -> Result<i64, CodecError> {
        self.ensure(8)?;
        Ok(self.buf.get_i64())
    }

    pub fn get_float(&mut self) -> Result<f64, CodecError> {
        self.ensure(8)?;
        Ok(self.buf.get_f64())
    }

    pub fn get_i32(&mut self) -> Result<i32, CodecError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn get_string(&mut self) -> Result<String, CodecError> {
        let raw = self.get_blob()?;
        String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
    }

    pub fn get_blob(&mut self) -> Result<Bytes, CodecError> {
        self.ensure(4)?;
        let len = self.buf.get_u32() as usize;
        self.ensure(len)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    /// Reads a list element count, rejecting counts above the limit.
    pub fn get_list_len(&mut self) -> Result<usize, CodecError> {
        self.ensure(2)?;
        let len = self.buf.get_u16() as usize;
        if len > self.max_list_length {
            return Err(CodecError::ListExceedsLimit {
                len,
                max: self.max_list_length,
            });
        }
        Ok(len)
    }

    /// Fails if any bytes are left unread.
    pub fn finish(&self) -> Result<(), CodecError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(CodecError::TrailingBytes(n)),
        }
    }
}

impl Datagram for bool {
    fn type_tag() -> TypeTag {
        TypeTag::Bool
    }
    fn write_to(&self, w: &mut DatagramWriter) -> Result<(), CodecError> {
        w.put_bool(*self);
        Ok(())
    }
    fn read_from(r: &mut DatagramReader<'_>) -> Result<Self, CodecError> {
        r.get_bool()
    }
}

impl Datagram for i64 {
    fn type_tag() -> TypeTag {
        TypeTag::Int
    }
    fn write_to(&self, w: &mut DatagramWriter) -> Result<(), CodecError> {
        w.put_int(*self);
        Ok(())
    }
    fn read_from(r: &mut DatagramReader<'_>) -> Result<Self, CodecError> {
        r.get_int()
    }
}

impl Datagram for f64 {
    fn type_tag() -> TypeTag {
        TypeTag::Float
    }
    fn write_to(&self, w: &mut DatagramWriter) -> Result<(), CodecError> {
        w.put_float(*self);
        Ok(())
    }
    fn read_from(r: &mut DatagramReader<'_>) -> Result<Self, CodecError> {
        r.get_float()
    }
}

impl Datagram for String {
    fn type_tag() -> TypeTag {
        TypeTag::Str
    }
    fn write_to(&self, w: &mut DatagramWriter) -> Result<(), CodecError> {
        w.put_str(self)
    }
    fn read_from(r: &mut DatagramReader<'_>) -> Result<Self, CodecError> {
        r.get_string()
    }
}

impl Datagram for Bytes {
    fn type_tag() -> TypeTag {
        TypeTag::Blob
    }
    fn write_to(&self, w: &mut DatagramWriter) -> Result<(), CodecError> {
        w.put_blob(self)
    }
    fn read_from(r: &mut DatagramReader<'_>) -> Result<Self, CodecError> {
        r.get_blob()
    }
}

impl Datagram for Vec2 {
    fn type_tag() -> TypeTag {
        TypeTag::Vec2
    }
    fn write_to(&self, w: &mut DatagramWriter) -> Result<(), CodecError> {
        w.put_float(self.x);
        w.put_float(self.y);
        Ok(())
    }
    fn read_from(r: &mut DatagramReader<'_>) -> Result<Self, CodecError> {
        Ok(Vec2::new(r.get_float()?, r.get_float()?))
    }
}

impl Datagram for Vec3 {
    fn type_tag() -> TypeTag {
        TypeTag::Vec3
    }
    fn write_to(&self, w: &mut DatagramWriter) -> Result<(), CodecError> {
        w.put_float(self.x);
        w.put_float(self.y);
        w.put_float(self.z);
        Ok(())
    }
    fn read_from(r: &mut DatagramReader<'_>) -> Result<Self, CodecError> {
        Ok(Vec3::new(r.get_float()?, r.get_float()?, r.get_float()?))
    }
}

impl Datagram for Vec4 {
    fn type_tag() -> TypeTag {
        TypeTag::Vec4
    }
    fn write_to(&self, w: &mut DatagramWriter) -> Result<(), CodecError> {
        w.put_float(self.x);
        w.put_float(self.y);
        w.put_float(self.z);
        w.put_float(self.w);
        Ok(())
    }
    fn read_from(r: &mut DatagramReader<'_>) -> Result<Self, CodecError> {
        Ok(Vec4::new(
            r.get_float()?,
            r.get_float()?,
            r.get_float()?,
            r.get_float()?,
        ))
    }
}

impl<T: Datagram> Datagram for Vec<T> {
    fn type_tag() -> TypeTag {
        TypeTag::List(Box::new(T::type_tag()))
    }
    fn write_to(&self, w: &mut DatagramWriter) -> Result<(), CodecError> {
        w.put_list_len(self.len())?;
        for item in self {
            item.write_to(w)?;
        }
        Ok(())
    }
    fn read_from(r: &mut DatagramReader<'_>) -> Result<Self, CodecError> {
        let len = r.get_list_len()?;
        let mut out = Vec::with_capacity(len);
        for _ in 0..len {
            out.push(T::read_from(r)?);
        }
        Ok(out)
    }
}

macro_rules! impl_tuple_datagram {
    ($($name:ident),+) => {
        impl<$($name: Datagram),+> Datagram for ($($name,)+) {
            fn type_tag() -> TypeTag {
                TypeTag::Tuple(vec![$($name::type_tag()),+])
            }

            #[allow(non_snake_case)]
            fn write_to(&self, w: &mut DatagramWriter) -> Result<(), CodecError> {
                let ($($name,)+) = self;
                $($name.write_to(w)?;)+
                Ok(())
            }

            fn read_from(r: &mut DatagramReader<'_>) -> Result<Self, CodecError> {
                Ok(($($name::read_from(r)?,)+))
            }
        }
    };
}

impl_tuple_datagram!(A, B);
impl_tuple_datagram!(A, B, C);
impl_tuple_datagram!(A, B, C, D);

/// Encodes a single value into a fresh payload.
pub fn encode<T: Datagram>(value: &T) -> Result<Bytes, CodecError> {
    let mut w = DatagramWriter::new();
    w.write(value)?;
    Ok(w.finish())
}

/// Decodes exactly one value of type `T`; trailing bytes are an error.
pub fn decode<T: Datagram>(bytes: &[u8], max_list_length: usize) -> Result<T, CodecError> {
    let mut r = DatagramReader::new(bytes, max_list_length);
    let value = r.read()?;
    r.finish()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: usize = 1024;

    #[test]
    fn scalar_encodings_are_big_endian() {
        assert_eq!(encode(&true).unwrap().as_ref(), &[1]);
        assert_eq!(encode(&false).unwrap().as_ref(), &[0]);
        assert_eq!(
            encode(&-2i64).unwrap().as_ref(),
            &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xfe]
        );
        assert_eq!(encode(&1.0f64).unwrap().as_ref(), &1.0f64.to_be_bytes());
        assert_eq!(
            encode(&"hi".to_string()).unwrap().as_ref(),
            &[0, 0, 0, 2, b'h', b'i']
        );
    }

    #[test]
    fn list_has_two_byte_count() {
        let bytes = encode(&vec![1i64, 2]).unwrap();
        assert_eq!(&bytes[..2], &[0, 2]);
        assert_eq!(bytes.len(), 2 + 16);
        assert_eq!(decode::<Vec<i64>>(&bytes, MAX).unwrap(), vec![1, 2]);
    }

    #[test]
    fn tuple_has_no_prefix() {
        let value = (true, 7i64, Vec2::new(1.5, -2.0));
        let bytes = encode(&value).unwrap();
        assert_eq!(bytes.len(), 1 + 8 + 16);
        assert_eq!(decode::<(bool, i64, Vec2)>(&bytes, MAX).unwrap(), value);
    }

    #[test]
    fn structured_values_roundtrip() {
        let value = vec![
            (Vec3::new(1.0, 2.0, 3.0), Vec4::new(0.0, 0.0, 0.0, 1.0)),
            (Vec3::ZERO, Vec4::default()),
        ];
        let bytes = encode(&value).unwrap();
        assert_eq!(
            decode::<Vec<(Vec3, Vec4)>>(&bytes, MAX).unwrap(),
            value
        );

        let blob = Bytes::from_static(&[0, 1, 2, 255]);
        let bytes = encode(&blob).unwrap();
        assert_eq!(&bytes[..4], &[0, 0, 0, 4]);
        assert_eq!(decode::<Bytes>(&bytes, MAX).unwrap(), blob);

        let text = "héllo wörld".to_string();
        assert_eq!(decode::<String>(&encode(&text).unwrap(), MAX).unwrap(), text);
    }

    #[test]
    fn list_over_limit_is_rejected() {
        let bytes = encode(&vec![0i64; 11]).unwrap();
        assert_eq!(
            decode::<Vec<i64>>(&bytes, 10),
            Err(CodecError::ListExceedsLimit { len: 11, max: 10 })
        );
    }

    #[test]
    fn nested_lists_share_the_limit() {
        let value = vec![vec![true; 3], vec![false; 5]];
        let bytes = encode(&value).unwrap();
        assert!(decode::<Vec<Vec<bool>>>(&bytes, 5).is_ok());
        assert!(matches!(
            decode::<Vec<Vec<bool>>>(&bytes, 4),
            Err(CodecError::ListExceedsLimit { len: 5, max: 4 })
        ));
    }

    #[test]
    fn malformed_input_is_rejected() {
        assert_eq!(decode::<bool>(&[2], MAX), Err(CodecError::InvalidBool(2)));
        assert!(matches!(
            decode::<i64>(&[0, 0, 0], MAX),
            Err(CodecError::UnexpectedEof { needed: 8, remaining: 3 })
        ));
        assert_eq!(
            decode::<String>(&[0, 0, 0, 2, 0xc3, 0x28], MAX),
            Err(CodecError::InvalidUtf8)
        );
        assert_eq!(decode::<bool>(&[1, 0], MAX), Err(CodecError::TrailingBytes(1)));
        // Declared blob length longer than the buffer.
        assert!(matches!(
            decode::<Bytes>(&[0, 0, 1, 0, 1, 2], MAX),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn oversized_list_fails_to_encode() {
        let value = vec![false; u16::MAX as usize + 1];
        assert!(matches!(
            encode(&value),
            Err(CodecError::TooLong { kind: "list", .. })
        ));
    }

    #[test]
    fn type_tags_describe_nesting() {
        assert_eq!(
            <Vec<(i64, String)>>::type_tag().to_string(),
            "list[(int, str)]"
        );
    }
}
