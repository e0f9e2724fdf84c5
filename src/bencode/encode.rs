use super::value::Value;
use bytes::{BufMut, Bytes, BytesMut};

/// Encodes `value` into its canonical bencoded form.
///
/// Dictionary keys come out in byte order because [`Value::Dict`] is a
/// `BTreeMap`, which is what the wire format requires.
pub fn encode(value: &Value) -> Bytes {
    let mut buf = BytesMut::with_capacity(encoded_len(value));
    write_value(value, &mut buf);
    buf.freeze()
}

fn write_value(value: &Value, buf: &mut BytesMut) {
    match value {
        Value::Integer(i) => {
            buf.put_u8(b'i');
            buf.put_slice(i.to_string().as_bytes());
            buf.put_u8(b'e');
        }
        Value::Bytes(b) => write_bytes(b, buf),
        Value::List(items) => {
            buf.put_u8(b'l');
            for item in items {
                write_value(item, buf);
            }
            buf.put_u8(b'e');
        }
        Value::Dict(dict) => {
            buf.put_u8(b'd');
            for (key, val) in dict {
                write_bytes(key, buf);
                write_value(val, buf);
            }
            buf.put_u8(b'e');
        }
    }
}

fn write_bytes(bytes: &[u8], buf: &mut BytesMut) {
    buf.put_slice(bytes.len().to_string().as_bytes());
    buf.put_u8(b':');
    buf.put_slice(bytes);
}

fn decimal_len(mut n: u64) -> usize {
    let mut len = 1;
    while n >= 10 {
        n /= 10;
        len += 1;
    }
    len
}

fn string_len(len: usize) -> usize {
    decimal_len(len as u64) + 1 + len
}

/// Exact number of bytes [`encode`] will produce for `value`.
pub(crate) fn encoded_len(value: &Value) -> usize {
    match value {
        Value::Integer(i) => 2 + decimal_len(i.unsigned_abs()) + usize::from(*i < 0),
        Value::Bytes(b) => string_len(b.len()),
        Value::List(items) => 2 + items.iter().map(encoded_len).sum::<usize>(),
        Value::Dict(dict) => {
            2 + dict
                .iter()
                .map(|(k, v)| string_len(k.len()) + encoded_len(v))
                .sum::<usize>()
        }
    }
}
