//! The name-value pair format carried inside PARAMS, GET_VALUES and GET_VALUES_RESULT content.
//!
//! Each pair is `nameLength valueLength name value`, where a length below 128 is one byte and
//! anything longer is four big-endian bytes with the top bit set.

use crate::error::{FastcgiError, Result};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use std::collections::HashMap;

/// Largest length the four-byte form can express.
pub const MAX_PARAM_LEN: usize = 0x7FFF_FFFF;

fn invalid<T>(msg: String) -> Result<T> {
    error!("{}", msg);
    Err(FastcgiError::Protocol(msg))
}

pub fn encode_length<B: BufMut>(buf: &mut B, len: usize) -> Result<()> {
    if len < 0x80 {
        buf.put_u8(len as u8);
    } else if len <= MAX_PARAM_LEN {
        buf.put_u32(len as u32 | 0x8000_0000);
    } else {
        return invalid(format!("un-encodable name-value pair length: {:#x}", len));
    }
    Ok(())
}

pub fn decode_length<B: Buf>(buf: &mut B) -> Result<usize> {
    if !buf.has_remaining() {
        return invalid("name-value data ended before a length".to_owned());
    }
    let first_byte = buf.chunk()[0];
    if first_byte < 0x80 {
        buf.advance(1);
        Ok(first_byte as usize)
    } else if buf.remaining() < 4 {
        invalid(format!("four-byte length truncated to {} bytes", buf.remaining()))
    } else {
        Ok((buf.get_u32() & 0x7FFF_FFFF) as usize)
    }
}

/// Encodes every pair in iteration order.
pub fn encode_params(params: &Params) -> Result<Bytes> {
    let mut out = BytesMut::new();
    for (name, value) in params {
        encode_length(&mut out, name.len())?;
        encode_length(&mut out, value.len())?;
        out.extend_from_slice(name);
        out.extend_from_slice(value);
    }
    Ok(out.freeze())
}

/// Decodes pairs until the input is exhausted. A trailing partial pair is an error.
pub fn decode_params(mut buf: Bytes) -> Result<Params> {
    let mut params = Params::new();
    while buf.has_remaining() {
        let name_len = decode_length(&mut buf)?;
        let value_len = decode_length(&mut buf)?;
        let needed = name_len.saturating_add(value_len);
        if buf.remaining() < needed {
            return invalid(format!(
                "name-value pair needs {} bytes but only {} remain", needed, buf.remaining()));
        }
        let name = buf.split_to(name_len);
        let value = buf.split_to(value_len);
        debug!("param ({}, {})",
               String::from_utf8_lossy(&name),
               String::from_utf8_lossy(&value));
        params.insert(name.to_vec(), value.to_vec());
    }
    Ok(params)
}

/// Request parameters, as populated by the web server (REQUEST_METHOD, SCRIPT_NAME, ...).
///
/// Names and values are opaque byte strings. Iteration follows first-insertion order; inserting
/// a name that is already present replaces its value in place.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Params {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    index: HashMap<Vec<u8>, usize>,
}

impl Params {
    pub fn new() -> Params {
        Params::default()
    }

    /// Sets `name` to `value`, returning the previous value if there was one.
    pub fn insert<N: Into<Vec<u8>>, V: Into<Vec<u8>>>(&mut self, name: N, value: V) -> Option<Vec<u8>> {
        let name = name.into();
        let value = value.into();
        match self.index.get(&name) {
            Some(&i) => Some(std::mem::replace(&mut self.entries[i].1, value)),
            None => {
                self.index.insert(name.clone(), self.entries.len());
                self.entries.push((name, value));
                None
            }
        }
    }

    pub fn get<K: AsRef<[u8]>>(&self, name: K) -> Option<&[u8]> {
        self.index.get(name.as_ref()).map(|&i| self.entries[i].1.as_slice())
    }

    /// The value as text, if present and valid UTF-8.
    pub fn get_str<K: AsRef<[u8]>>(&self, name: K) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    pub fn contains<K: AsRef<[u8]>>(&self, name: K) -> bool {
        self.index.contains_key(name.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], &[u8])> {
        self.entries.iter().map(|(n, v)| (n.as_slice(), v.as_slice()))
    }

    /// A lossy text copy, for code that wants `HashMap<String, String>` like an environment.
    pub fn to_string_map(&self) -> HashMap<String, String> {
        self.iter()
            .map(|(n, v)| (String::from_utf8_lossy(n).into_owned(),
                           String::from_utf8_lossy(v).into_owned()))
            .collect()
    }
}

impl<'a> IntoIterator for &'a Params {
    type Item = (&'a [u8], &'a [u8]);
    type IntoIter = Box<dyn Iterator<Item = (&'a [u8], &'a [u8])> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

impl<N: Into<Vec<u8>>, V: Into<Vec<u8>>> Extend<(N, V)> for Params {
    fn extend<I: IntoIterator<Item = (N, V)>>(&mut self, iter: I) {
        for (name, value) in iter {
            self.insert(name, value);
        }
    }
}

impl<N: Into<Vec<u8>>, V: Into<Vec<u8>>> FromIterator<(N, V)> for Params {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Params {
        let mut params = Params::new();
        params.extend(iter);
        params
    }
}
