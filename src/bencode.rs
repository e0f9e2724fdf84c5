//! Bencode codec used for DHT datagrams.
//!
//! Every DHT message is a single bencoded dictionary. This module provides
//! the four-variant [`Value`] model plus [`encode`] and [`decode`]; the DHT
//! engine never looks past the handful of well-known message keys, so
//! argument dictionaries travel through it untouched.
//!
//! | Type | Format | Example |
//! |------|--------|---------|
//! | Integer | `i<number>e` | `i42e` → 42 |
//! | Byte String | `<length>:<data>` | `4:ping` → "ping" |
//! | List | `l<items>e` | `li201e5:oopse` → [201, "oops"] |
//! | Dictionary | `d<key><value>...e` | `d1:y1:qe` → {"y": "q"} |
//!
//! ```
//! use dht_engine::bencode::{decode, encode, Value};
//!
//! let value = decode(b"d1:t2:421:y1:qe").unwrap();
//! assert_eq!(value.get(b"y").and_then(Value::as_str), Some("q"));
//! assert_eq!(&encode(&value)[..], b"d1:t2:421:y1:qe");
//! ```
//!
//! Decoding is strict about framing (no trailing bytes, no leading zeros in
//! integers, bounded nesting) so that hostile datagrams fail fast with a
//! [`BencodeError`] that records where the input went wrong.

mod decode;
mod encode;
mod error;
mod value;

pub use decode::decode;
pub use encode::encode;
pub use error::BencodeError;
pub use value::{Dict, Value};
