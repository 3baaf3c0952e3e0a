/// qpack serialization, the body format of SiriDB packets
///
/// Values map onto `serde_json::Value`: raw strings become JSON strings
/// (lossy for non UTF-8 data) and map keys are always rendered as strings.
use bytes::{BufMut, BytesMut};
use serde_json::{Map, Number, Value};

const INT_INLINE_MAX: u8 = 0x3f;
const NEG_INLINE_MIN: u8 = 0x40;
const NEG_INLINE_MAX: u8 = 0x7b;
const HOOK: u8 = 0x7c;
const DOUBLE_N1: u8 = 0x7d;
const DOUBLE_0: u8 = 0x7e;
const DOUBLE_1: u8 = 0x7f;
const RAW_INLINE: u8 = 0x80;
const RAW_INLINE_MAX_LEN: usize = 99;
const RAW8: u8 = 0xe4;
const RAW16: u8 = 0xe5;
const RAW32: u8 = 0xe6;
const RAW64: u8 = 0xe7;
const INT8: u8 = 0xe8;
const INT16: u8 = 0xe9;
const INT32: u8 = 0xea;
const INT64: u8 = 0xeb;
const DOUBLE: u8 = 0xec;
const ARRAY0: u8 = 0xed;
const ARRAY5: u8 = 0xf2;
const MAP0: u8 = 0xf3;
const MAP5: u8 = 0xf8;
const TRUE: u8 = 0xf9;
const FALSE: u8 = 0xfa;
const NULL: u8 = 0xfb;
const ARRAY_OPEN: u8 = 0xfc;
const MAP_OPEN: u8 = 0xfd;
const ARRAY_CLOSE: u8 = 0xfe;
const MAP_CLOSE: u8 = 0xff;

/// qpack decode errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QpackError {
    #[error("unexpected end of data")]
    UnexpectedEnd,
    #[error("unexpected marker 0x{0:02x}")]
    UnexpectedMarker(u8),
    #[error("{0} trailing bytes after value")]
    TrailingData(usize),
    #[error("length {0} does not fit in memory")]
    TooLarge(u64),
}

/// Serialize a value into a new buffer
pub fn pack(value: &Value) -> BytesMut {
    let mut buf = BytesMut::new();
    pack_into(value, &mut buf);
    buf
}

pub fn pack_into(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Null => buf.put_u8(NULL),
        Value::Bool(true) => buf.put_u8(TRUE),
        Value::Bool(false) => buf.put_u8(FALSE),
        Value::Number(n) => match n.as_i64() {
            Some(i) => pack_int(i, buf),
            None => pack_double(n.as_f64().unwrap_or(0.0), buf),
        },
        Value::String(s) => pack_raw(s.as_bytes(), buf),
        Value::Array(items) => {
            if items.len() <= 5 {
                buf.put_u8(ARRAY0 + items.len() as u8);
                items.iter().for_each(|item| pack_into(item, buf));
            } else {
                buf.put_u8(ARRAY_OPEN);
                items.iter().for_each(|item| pack_into(item, buf));
                buf.put_u8(ARRAY_CLOSE);
            }
        }
        Value::Object(map) => {
            let small = map.len() <= 5;
            buf.put_u8(if small { MAP0 + map.len() as u8 } else { MAP_OPEN });
            for (key, item) in map {
                pack_raw(key.as_bytes(), buf);
                pack_into(item, buf);
            }
            if !small {
                buf.put_u8(MAP_CLOSE);
            }
        }
    }
}

fn pack_int(i: i64, buf: &mut BytesMut) {
    match i {
        0..=63 => buf.put_u8(i as u8),
        -60..=-1 => buf.put_u8((63 - i) as u8),
        _ if i8::try_from(i).is_ok() => {
            buf.put_u8(INT8);
            buf.put_i8(i as i8);
        }
        _ if i16::try_from(i).is_ok() => {
            buf.put_u8(INT16);
            buf.put_i16_le(i as i16);
        }
        _ if i32::try_from(i).is_ok() => {
            buf.put_u8(INT32);
            buf.put_i32_le(i as i32);
        }
        _ => {
            buf.put_u8(INT64);
            buf.put_i64_le(i);
        }
    }
}

fn pack_double(d: f64, buf: &mut BytesMut) {
    if d == 0.0 {
        buf.put_u8(DOUBLE_0);
    } else if d == 1.0 {
        buf.put_u8(DOUBLE_1);
    } else if d == -1.0 {
        buf.put_u8(DOUBLE_N1);
    } else {
        buf.put_u8(DOUBLE);
        buf.put_f64_le(d);
    }
}

fn pack_raw(raw: &[u8], buf: &mut BytesMut) {
    let len = raw.len();
    if len <= RAW_INLINE_MAX_LEN {
        buf.put_u8(RAW_INLINE + len as u8);
    } else if let Ok(n) = u8::try_from(len) {
        buf.put_u8(RAW8);
        buf.put_u8(n);
    } else if let Ok(n) = u16::try_from(len) {
        buf.put_u8(RAW16);
        buf.put_u16_le(n);
    } else if let Ok(n) = u32::try_from(len) {
        buf.put_u8(RAW32);
        buf.put_u32_le(n);
    } else {
        buf.put_u8(RAW64);
        buf.put_u64_le(len as u64);
    }
    buf.put_slice(raw);
}

/// Decode exactly one value from `data`
pub fn unpack(data: &[u8]) -> Result<Value, QpackError> {
    let mut reader = Reader { data, pos: 0 };
    let value = match reader.next_marker()? {
        Some(marker) => reader.value(marker)?,
        None => return Err(QpackError::UnexpectedEnd),
    };
    match data.len() - reader.pos {
        0 => Ok(value),
        n => Err(QpackError::TrailingData(n)),
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Next marker byte, skipping hooks; `None` at the end of data
    fn next_marker(&mut self) -> Result<Option<u8>, QpackError> {
        while let Some(&marker) = self.data.get(self.pos) {
            self.pos += 1;
            if marker != HOOK {
                return Ok(Some(marker));
            }
        }
        Ok(None)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], QpackError> {
        let end = self.pos.checked_add(n).ok_or(QpackError::UnexpectedEnd)?;
        let slice = self.data.get(self.pos..end).ok_or(QpackError::UnexpectedEnd)?;
        self.pos = end;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N], QpackError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn required(&mut self) -> Result<Value, QpackError> {
        match self.next_marker()? {
            Some(marker) => self.value(marker),
            None => Err(QpackError::UnexpectedEnd),
        }
    }

    fn value(&mut self, marker: u8) -> Result<Value, QpackError> {
        let value = match marker {
            0..=INT_INLINE_MAX => Value::from(marker),
            NEG_INLINE_MIN..=NEG_INLINE_MAX => Value::from(63 - i64::from(marker)),
            DOUBLE_N1 => Value::from(-1.0),
            DOUBLE_0 => Value::from(0.0),
            DOUBLE_1 => Value::from(1.0),
            RAW_INLINE..=0xe3 => self.raw((marker - RAW_INLINE) as usize)?,
            RAW8 => {
                let [n] = self.take_array::<1>()?;
                self.raw(n as usize)?
            }
            RAW16 => {
                let n = u16::from_le_bytes(self.take_array()?);
                self.raw(n as usize)?
            }
            RAW32 => {
                let n = u32::from_le_bytes(self.take_array()?);
                self.raw(n as usize)?
            }
            RAW64 => {
                let n = u64::from_le_bytes(self.take_array()?);
                let n = usize::try_from(n).map_err(|_| QpackError::TooLarge(n))?;
                self.raw(n)?
            }
            INT8 => Value::from(i8::from_le_bytes(self.take_array()?)),
            INT16 => Value::from(i16::from_le_bytes(self.take_array()?)),
            INT32 => Value::from(i32::from_le_bytes(self.take_array()?)),
            INT64 => Value::from(i64::from_le_bytes(self.take_array()?)),
            DOUBLE => {
                let d = f64::from_le_bytes(self.take_array()?);
                Number::from_f64(d).map(Value::Number).unwrap_or(Value::Null)
            }
            ARRAY0..=ARRAY5 => {
                let n = (marker - ARRAY0) as usize;
                let mut items = Vec::with_capacity(n);
                for _ in 0..n {
                    items.push(self.required()?);
                }
                Value::Array(items)
            }
            MAP0..=MAP5 => {
                let n = (marker - MAP0) as usize;
                let mut map = Map::new();
                for _ in 0..n {
                    let key = self.required()?;
                    let item = self.required()?;
                    map.insert(key_string(key), item);
                }
                Value::Object(map)
            }
            TRUE => Value::Bool(true),
            FALSE => Value::Bool(false),
            NULL => Value::Null,
            ARRAY_OPEN => {
                let mut items = Vec::new();
                loop {
                    match self.next_marker()? {
                        None | Some(ARRAY_CLOSE) => break,
                        Some(m) => items.push(self.value(m)?),
                    }
                }
                Value::Array(items)
            }
            MAP_OPEN => {
                let mut map = Map::new();
                loop {
                    match self.next_marker()? {
                        None | Some(MAP_CLOSE) => break,
                        Some(m) => {
                            let key = self.value(m)?;
                            let item = self.required()?;
                            map.insert(key_string(key), item);
                        }
                    }
                }
                Value::Object(map)
            }
            other => return Err(QpackError::UnexpectedMarker(other)),
        };
        Ok(value)
    }

    fn raw(&mut self, n: usize) -> Result<Value, QpackError> {
        let bytes = self.take(n)?;
        Ok(Value::String(String::from_utf8_lossy(bytes).into_owned()))
    }
}

fn key_string(key: Value) -> String {
    match key {
        Value::String(s) => s,
        other => other.to_string(),
    }
}
