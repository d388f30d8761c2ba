use serde::ser;
use crate::{Error, Result};

// Bencode dictionary keys must themselves be byte strings, and `SerializeMap`
// needs a key's raw bytes *before* it knows where the entry will land in the
// lexicographically-sorted item list - so keys are serialized through this
// narrow serializer instead of the full `Encoder` (which would wrap them in
// bencode's own length-prefix framing).
pub struct StringSerializer;

impl ser::Serializer for &mut StringSerializer {

    type Ok = Vec<u8>;
    type Error = Error;

    type SerializeSeq           = ser::Impossible<Vec<u8>, Error>;
    type SerializeMap           = ser::Impossible<Vec<u8>, Error>;
    type SerializeStruct        = ser::Impossible<Vec<u8>, Error>;
    type SerializeStructVariant = ser::Impossible<Vec<u8>, Error>;
    type SerializeTuple         = ser::Impossible<Vec<u8>, Error>;
    type SerializeTupleStruct   = ser::Impossible<Vec<u8>, Error>;
    type SerializeTupleVariant  = ser::Impossible<Vec<u8>, Error>;

    fn serialize_str(self, v: &str) -> Result<Vec<u8>> {
        Ok(v.as_bytes().to_vec())
    }

    fn serialize_bytes(self, v: &[u8]) -> Result<Vec<u8>> {
        Ok(v.to_vec())
    }

    fn serialize_char(self, v: char) -> Result<Vec<u8>> {
        let mut buf = [0; 4];
        self.serialize_str(v.encode_utf8(&mut buf))
    }

    fn serialize_unit_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        variant: &'static str,
    ) -> Result<Vec<u8>> {
        self.serialize_str(variant)
    }

    fn serialize_newtype_struct<T: ?Sized>(self, _name: &'static str, value: &T) -> Result<Vec<u8>>
        where T: serde::Serialize
    {
        value.serialize(self)
    }

    fn serialize_i64(self, v: i64) -> Result<Vec<u8>> { self.serialize_str(&v.to_string()) }
    fn serialize_u64(self, v: u64) -> Result<Vec<u8>> { self.serialize_str(&v.to_string()) }
    fn serialize_i8(self, v: i8) -> Result<Vec<u8>> { self.serialize_i64(v as i64) }
    fn serialize_i16(self, v: i16) -> Result<Vec<u8>> { self.serialize_i64(v as i64) }
    fn serialize_i32(self, v: i32) -> Result<Vec<u8>> { self.serialize_i64(v as i64) }
    fn serialize_u8(self, v: u8) -> Result<Vec<u8>> { self.serialize_u64(v as u64) }
    fn serialize_u16(self, v: u16) -> Result<Vec<u8>> { self.serialize_u64(v as u64) }
    fn serialize_u32(self, v: u32) -> Result<Vec<u8>> { self.serialize_u64(v as u64) }

    fn serialize_bool(self, _: bool) -> Result<Vec<u8>> {
        Err(Error::InvalidType("bool key".to_string()))
    }

    fn serialize_f32(self, _: f32) -> Result<Vec<u8>> {
        Err(Error::InvalidType("f32 key".to_string()))
    }

    fn serialize_f64(self, _: f64) -> Result<Vec<u8>> {
        Err(Error::InvalidType("f64 key".to_string()))
    }

    fn serialize_none(self) -> Result<Vec<u8>> {
        Err(Error::InvalidType("none key".to_string()))
    }

    fn serialize_some<T: ?Sized>(self, value: &T) -> Result<Vec<u8>>
        where T: serde::Serialize
    {
        value.serialize(self)
    }

    fn serialize_unit(self) -> Result<Vec<u8>> {
        Err(Error::InvalidType("unit key".to_string()))
    }

    fn serialize_unit_struct(self, _name: &'static str) -> Result<Vec<u8>> {
        Err(Error::InvalidType("unit struct key".to_string()))
    }

    fn serialize_newtype_variant<T: ?Sized>(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _value: &T,
    ) -> Result<Vec<u8>>
        where T: serde::Serialize
    {
        Err(Error::InvalidType("newtype variant key".to_string()))
    }

    fn serialize_seq(self, _len: Option<usize>) -> Result<Self::SerializeSeq> {
        Err(Error::InvalidType("sequence key".to_string()))
    }

    fn serialize_tuple(self, _len: usize) -> Result<Self::SerializeTuple> {
        Err(Error::InvalidType("tuple key".to_string()))
    }

    fn serialize_tuple_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeTupleStruct> {
        Err(Error::InvalidType("tuple struct key".to_string()))
    }

    fn serialize_tuple_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeTupleVariant> {
        Err(Error::InvalidType("tuple variant key".to_string()))
    }

    fn serialize_map(self, _len: Option<usize>) -> Result<Self::SerializeMap> {
        Err(Error::InvalidType("map key".to_string()))
    }

    fn serialize_struct(self, _name: &'static str, _len: usize) -> Result<Self::SerializeStruct> {
        Err(Error::InvalidType("struct key".to_string()))
    }

    fn serialize_struct_variant(
        self,
        _name: &'static str,
        _variant_index: u32,
        _variant: &'static str,
        _len: usize,
    ) -> Result<Self::SerializeStructVariant> {
        Err(Error::InvalidType("struct variant key".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[test]
    fn serializes_str_key_to_raw_bytes() {
        let mut ser = StringSerializer;
        let bytes = "foo".serialize(&mut ser).unwrap();
        assert_eq!(bytes, b"foo");
    }

    #[test]
    fn serializes_int_key_to_ascii_bytes() {
        let mut ser = StringSerializer;
        let bytes = 42u32.serialize(&mut ser).unwrap();
        assert_eq!(bytes, b"42");
    }
}
