//! Interface to the record serializer shared with task execution

use std::io::Cursor;

use bytes::Bytes;
use serde::Deserialize;
use serde_bytes::ByteBuf;

use crate::data::DataTag;
use crate::error::Error;

/// One record of a block held in deserialized form. The engine treats
/// record payloads as opaque; only the serializer interprets them.
pub type Record = Bytes;

/// Stream of records flowing into or out of the store
pub type ValuesIter = Box<dyn Iterator<Item = Record> + Send>;

/// Converts between a block's records and its serialized representation.
///
/// The serializer proper lives outside this subsystem; the block store
/// only needs the two directions plus an incremental encoder for
/// unroll-to-bytes, and passes the block's `DataTag` through untouched.
pub trait BlockSerializer: Send + Sync {
	/// Append the encoding of one record to a partially written block
	fn serialize_one(&self, tag: &DataTag, value: &Record, out: &mut Vec<u8>)
		-> Result<(), Error>;

	fn serialize_values(&self, tag: &DataTag, values: &[Record]) -> Result<Bytes, Error> {
		let mut out = Vec::new();
		for v in values {
			self.serialize_one(tag, v, &mut out)?;
		}
		Ok(out.into())
	}

	fn deserialize_values(&self, tag: &DataTag, bytes: &[u8]) -> Result<Vec<Record>, Error>;
}

/// Default serializer: records framed as consecutive messagepack byte
/// strings, no outer envelope, so a block can be written incrementally.
pub struct MsgPackSerializer;

impl BlockSerializer for MsgPackSerializer {
	fn serialize_one(
		&self,
		_tag: &DataTag,
		value: &Record,
		out: &mut Vec<u8>,
	) -> Result<(), Error> {
		rmp_serde::encode::write(out, &ByteBuf::from(value.to_vec()))?;
		Ok(())
	}

	fn deserialize_values(&self, _tag: &DataTag, bytes: &[u8]) -> Result<Vec<Record>, Error> {
		let len = bytes.len() as u64;
		let mut cursor = Cursor::new(bytes);
		let mut values = Vec::new();
		while cursor.position() < len {
			let mut de = rmp_serde::Deserializer::new(&mut cursor);
			let buf = ByteBuf::deserialize(&mut de)?;
			values.push(Bytes::from(buf.into_vec()));
		}
		Ok(values)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_msgpack_framing() {
		let ser = MsgPackSerializer;
		let tag = DataTag::of("test");
		let values: Vec<Record> = vec![
			Bytes::from_static(b"alpha"),
			Bytes::from_static(b""),
			Bytes::from_static(b"\x00\x01\x02"),
		];

		let bytes = ser.serialize_values(&tag, &values).unwrap();
		assert_eq!(ser.deserialize_values(&tag, &bytes).unwrap(), values);

		// Incremental encoding produces the same stream
		let mut out = Vec::new();
		for v in &values {
			ser.serialize_one(&tag, v, &mut out).unwrap();
		}
		assert_eq!(Bytes::from(out), bytes);

		assert!(ser.deserialize_values(&tag, b"\xc1garbage").is_err());
	}
}
