//! External Term Format (ETF) codec for the gateway's binary encoding.
//!
//! The gateway accepts ETF as an alternative to JSON. It is Erlang's external
//! binary format, of which Discord uses a subset: atoms, integers (small, big),
//! floats, binaries, lists, tuples and maps. Snowflakes travel as plain
//! integers here rather than the decimal strings JSON uses.
//!
//! Both directions convert between ETF bytes and [`serde_json::Value`], so
//! payloads look identical to the rest of the pipeline regardless of the wire
//! encoding.

use base64::Engine;
use serde_json::{Map, Number, Value};

use crate::error::GatewayError;

/// ETF format version tag.
const FORMAT_VERSION: u8 = 131;

/// ETF term tags.
mod tags {
    pub const NEW_FLOAT: u8 = 70;
    pub const COMPRESSED: u8 = 80;
    pub const SMALL_INTEGER: u8 = 97;
    pub const INTEGER: u8 = 98;
    pub const FLOAT: u8 = 99;
    pub const ATOM: u8 = 100;
    pub const SMALL_TUPLE: u8 = 104;
    pub const LARGE_TUPLE: u8 = 105;
    pub const NIL: u8 = 106;
    pub const STRING: u8 = 107;
    pub const LIST: u8 = 108;
    pub const BINARY: u8 = 109;
    pub const SMALL_BIG: u8 = 110;
    pub const LARGE_BIG: u8 = 111;
    pub const MAP: u8 = 116;
    pub const ATOM_UTF8: u8 = 118;
    pub const SMALL_ATOM_UTF8: u8 = 119;
}

/// Wire encoding negotiated in the connection query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    /// JSON encoding (default, human-readable).
    #[default]
    Json,
    /// ETF encoding (smaller, snowflakes as integers).
    Etf,
}

impl Encoding {
    /// The encoding name used in the gateway URL query string.
    pub const fn as_str(self) -> &'static str {
        match self {
            Encoding::Json => "json",
            Encoding::Etf => "etf",
        }
    }
}

/// Decode an ETF payload.
pub fn unpack(data: &[u8]) -> Result<Value, GatewayError> {
    let mut reader = Reader::new(data);

    let version = reader.read_u8()?;
    if version != FORMAT_VERSION {
        return Err(GatewayError::EtfDecode(format!(
            "invalid format version: expected {FORMAT_VERSION}, got {version}"
        )));
    }

    reader.read_term()
}

/// Encode a value as an ETF payload.
pub fn pack(value: &Value) -> Result<Vec<u8>, GatewayError> {
    let mut out = Vec::with_capacity(64);
    out.push(FORMAT_VERSION);
    write_term(&mut out, value)?;
    Ok(out)
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_term(&mut self) -> Result<Value, GatewayError> {
        let tag = self.read_u8()?;

        match tag {
            tags::SMALL_INTEGER => {
                let value = self.read_u8()?;
                Ok(Value::Number(Number::from(value)))
            }

            tags::INTEGER => {
                let value = self.read_i32()?;
                Ok(Value::Number(Number::from(value)))
            }

            tags::FLOAT => {
                // Old float format: 31 bytes of zero-padded ASCII.
                let bytes = self.read_bytes(31)?;
                let text = std::str::from_utf8(bytes)
                    .map_err(|source| {
                        GatewayError::EtfDecode(format!("invalid float string: {source}"))
                    })?
                    .trim_end_matches('\0');
                let value: f64 = text
                    .parse()
                    .map_err(|source| GatewayError::EtfDecode(format!("invalid float: {source}")))?;
                float_value(value)
            }

            tags::NEW_FLOAT => {
                let bytes = self.read_bytes(8)?;
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                float_value(f64::from_be_bytes(raw))
            }

            tags::ATOM | tags::ATOM_UTF8 => {
                let len = self.read_u16()? as usize;
                let bytes = self.read_bytes(len)?;
                Ok(atom_value(&String::from_utf8_lossy(bytes)))
            }

            tags::SMALL_ATOM_UTF8 => {
                let len = self.read_u8()? as usize;
                let bytes = self.read_bytes(len)?;
                Ok(atom_value(&String::from_utf8_lossy(bytes)))
            }

            tags::SMALL_TUPLE => {
                let arity = self.read_u8()? as usize;
                self.read_sequence(arity)
            }

            tags::LARGE_TUPLE => {
                let arity = self.read_u32()? as usize;
                self.read_sequence(arity)
            }

            tags::NIL => Ok(Value::Array(Vec::new())),

            tags::STRING => {
                // A list of bytes; Discord only uses this for short text.
                let len = self.read_u16()? as usize;
                let bytes = self.read_bytes(len)?;
                Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
            }

            tags::LIST => {
                let len = self.read_u32()? as usize;
                let list = self.read_sequence(len)?;
                // Proper lists carry a NIL tail; read and discard it.
                let _tail = self.read_term()?;
                Ok(list)
            }

            tags::BINARY => {
                let len = self.read_u32()? as usize;
                let bytes = self.read_bytes(len)?;
                match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Ok(Value::String(text)),
                    // Non-UTF-8 binaries are rare; base64 keeps them printable.
                    Err(_) => Ok(Value::String(
                        base64::engine::general_purpose::STANDARD.encode(bytes),
                    )),
                }
            }

            tags::SMALL_BIG => {
                let n = self.read_u8()? as usize;
                self.read_big(n)
            }

            tags::LARGE_BIG => {
                let n = self.read_u32()? as usize;
                self.read_big(n)
            }

            tags::MAP => {
                let arity = self.read_u32()? as usize;
                let mut map = Map::new();
                for _ in 0..arity {
                    let key = match self.read_term()? {
                        Value::String(text) => text,
                        other => other.to_string(),
                    };
                    let value = self.read_term()?;
                    map.insert(key, value);
                }
                Ok(Value::Object(map))
            }

            tags::COMPRESSED => {
                let uncompressed_size = self.read_u32()? as usize;
                let compressed = &self.data[self.pos..];

                use flate2::read::ZlibDecoder;
                use std::io::Read;

                let mut decoder = ZlibDecoder::new(compressed);
                let mut decompressed = Vec::with_capacity(uncompressed_size);
                decoder.read_to_end(&mut decompressed).map_err(|source| {
                    GatewayError::EtfDecode(format!("term decompression failed: {source}"))
                })?;

                self.pos = self.data.len();

                Reader::new(&decompressed).read_term()
            }

            _ => Err(GatewayError::EtfDecode(format!(
                "unknown term tag {tag} at position {}",
                self.pos - 1
            ))),
        }
    }

    fn read_sequence(&mut self, len: usize) -> Result<Value, GatewayError> {
        let mut elements = Vec::with_capacity(len.min(4096));
        for _ in 0..len {
            elements.push(self.read_term()?);
        }
        Ok(Value::Array(elements))
    }

    fn read_big(&mut self, n: usize) -> Result<Value, GatewayError> {
        let sign = self.read_u8()?;
        let bytes = self.read_bytes(n)?;

        if bytes.len() > 16 {
            return Err(GatewayError::EtfDecode(format!(
                "big integer of {n} bytes is out of range"
            )));
        }

        // Little-endian magnitude.
        let mut magnitude: i128 = 0;
        for (i, &byte) in bytes.iter().enumerate() {
            magnitude |= (byte as i128) << (i * 8);
        }

        let value = if sign != 0 { -magnitude } else { magnitude };
        Ok(integer_value(value))
    }

    #[inline]
    fn read_u8(&mut self) -> Result<u8, GatewayError> {
        if self.pos >= self.data.len() {
            return Err(unexpected_end());
        }
        let byte = self.data[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    fn read_u16(&mut self) -> Result<u16, GatewayError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    #[inline]
    fn read_u32(&mut self) -> Result<u32, GatewayError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    #[inline]
    fn read_i32(&mut self) -> Result<i32, GatewayError> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], GatewayError> {
        if self.pos + n > self.data.len() {
            return Err(unexpected_end());
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }
}

fn unexpected_end() -> GatewayError {
    GatewayError::EtfDecode("unexpected end of term data".to_string())
}

/// Atoms double as JSON's scalar keywords in Discord's usage.
fn atom_value(name: &str) -> Value {
    match name {
        "nil" | "null" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => Value::String(name.to_string()),
    }
}

fn float_value(value: f64) -> Result<Value, GatewayError> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| GatewayError::EtfDecode("float is not a number".to_string()))
}

/// Map a decoded integer onto the tightest JSON number that holds it.
///
/// Snowflakes arrive as unsigned big integers and must survive as `u64`.
fn integer_value(value: i128) -> Value {
    if value >= 0 && value <= u64::MAX as i128 {
        Value::Number(Number::from(value as u64))
    } else if value >= i64::MIN as i128 && value < 0 {
        Value::Number(Number::from(value as i64))
    } else {
        Value::String(value.to_string())
    }
}

fn write_term(out: &mut Vec<u8>, value: &Value) -> Result<(), GatewayError> {
    match value {
        Value::Null => write_atom(out, "nil"),
        Value::Bool(true) => write_atom(out, "true"),
        Value::Bool(false) => write_atom(out, "false"),

        Value::Number(number) => write_number(out, number)?,

        Value::String(text) => write_binary(out, text.as_bytes()),

        Value::Array(items) if items.is_empty() => out.push(tags::NIL),
        Value::Array(items) => {
            out.push(tags::LIST);
            out.extend((items.len() as u32).to_be_bytes());
            for item in items {
                write_term(out, item)?;
            }
            out.push(tags::NIL);
        }

        Value::Object(map) => {
            out.push(tags::MAP);
            out.extend((map.len() as u32).to_be_bytes());
            for (key, item) in map {
                write_binary(out, key.as_bytes());
                write_term(out, item)?;
            }
        }
    }

    Ok(())
}

fn write_atom(out: &mut Vec<u8>, name: &str) {
    out.push(tags::SMALL_ATOM_UTF8);
    out.push(name.len() as u8);
    out.extend(name.as_bytes());
}

fn write_binary(out: &mut Vec<u8>, bytes: &[u8]) {
    out.push(tags::BINARY);
    out.extend((bytes.len() as u32).to_be_bytes());
    out.extend(bytes);
}

fn write_number(out: &mut Vec<u8>, number: &Number) -> Result<(), GatewayError> {
    if let Some(unsigned) = number.as_u64() {
        if unsigned <= u8::MAX as u64 {
            out.push(tags::SMALL_INTEGER);
            out.push(unsigned as u8);
        } else if unsigned <= i32::MAX as u64 {
            out.push(tags::INTEGER);
            out.extend((unsigned as i32).to_be_bytes());
        } else {
            write_small_big(out, unsigned as i128);
        }
    } else if let Some(signed) = number.as_i64() {
        if signed >= i32::MIN as i64 {
            out.push(tags::INTEGER);
            out.extend((signed as i32).to_be_bytes());
        } else {
            write_small_big(out, signed as i128);
        }
    } else if let Some(float) = number.as_f64() {
        out.push(tags::NEW_FLOAT);
        out.extend(float.to_be_bytes());
    } else {
        return Err(GatewayError::EtfDecode(
            "number cannot be represented as a term".to_string(),
        ));
    }

    Ok(())
}

fn write_small_big(out: &mut Vec<u8>, value: i128) {
    let sign = u8::from(value < 0);
    let mut magnitude = value.unsigned_abs();

    let mut bytes = Vec::with_capacity(8);
    while magnitude > 0 {
        bytes.push((magnitude & 0xff) as u8);
        magnitude >>= 8;
    }

    out.push(tags::SMALL_BIG);
    out.push(bytes.len() as u8);
    out.push(sign);
    out.extend(bytes);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_small_int() {
        // Version byte + small_integer tag + value.
        let data = [131, 97, 42];
        assert_eq!(unpack(&data).unwrap(), json!(42));
    }

    #[test]
    fn test_decode_integer() {
        // Version byte + integer tag + 4 bytes BE.
        let data = [131, 98, 0, 0, 1, 0];
        assert_eq!(unpack(&data).unwrap(), json!(256));
    }

    #[test]
    fn test_decode_nil_is_empty_list() {
        let data = [131, 106];
        assert_eq!(unpack(&data).unwrap(), json!([]));
    }

    #[test]
    fn test_decode_binary() {
        let data = [131, 109, 0, 0, 0, 5, b'h', b'e', b'l', b'l', b'o'];
        assert_eq!(unpack(&data).unwrap(), json!("hello"));
    }

    #[test]
    fn test_decode_atoms() {
        // small_atom_utf8 "nil" / "true" / "false".
        assert_eq!(unpack(&[131, 119, 3, b'n', b'i', b'l']).unwrap(), json!(null));
        assert_eq!(
            unpack(&[131, 119, 4, b't', b'r', b'u', b'e']).unwrap(),
            json!(true)
        );
        assert_eq!(
            unpack(&[131, 119, 5, b'f', b'a', b'l', b's', b'e']).unwrap(),
            json!(false)
        );
    }

    #[test]
    fn test_decode_map() {
        // %{a => 1}
        let data = [
            131, // version
            116, // map tag
            0, 0, 0, 1, // arity = 1
            119, 1, b'a', // small_atom_utf8 "a"
            97, 1, // small_integer 1
        ];
        assert_eq!(unpack(&data).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_decode_truncated_input() {
        assert!(unpack(&[131, 109, 0, 0, 0, 5, b'h', b'i']).is_err());
        assert!(unpack(&[131]).is_err());
    }

    #[test]
    fn test_decode_wrong_version() {
        assert!(unpack(&[130, 106]).is_err());
    }

    #[test]
    fn test_round_trip_envelope() {
        let payload = json!({
            "op": 0,
            "s": 42,
            "t": "MESSAGE_CREATE",
            "d": {
                "id": 175928847299117063u64,
                "content": "hello",
                "mentions": [],
                "tts": false,
                "nonce": null,
            },
        });

        let packed = pack(&payload).unwrap();
        assert_eq!(packed[0], FORMAT_VERSION);
        assert_eq!(unpack(&packed).unwrap(), payload);
    }

    #[test]
    fn test_round_trip_snowflake_scale_integers() {
        let payload = json!({"id": u64::MAX, "negative": -5_000_000_000i64});
        let packed = pack(&payload).unwrap();
        assert_eq!(unpack(&packed).unwrap(), payload);
    }

    #[test]
    fn test_round_trip_floats() {
        let payload = json!({"ratio": 0.25});
        let packed = pack(&payload).unwrap();
        assert_eq!(unpack(&packed).unwrap(), payload);
    }

    #[test]
    fn test_encoding_query_values() {
        assert_eq!(Encoding::Json.as_str(), "json");
        assert_eq!(Encoding::Etf.as_str(), "etf");
    }
}
