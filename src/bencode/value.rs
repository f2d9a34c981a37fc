use std::collections::BTreeMap;

/// A decoded bencode value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    /// i<number>e
    Int(i64),
    /// <length>:<contents>
    Bytes(Vec<u8>),
    /// l<values>e
    List(Vec<Bencode>),
    /// d<key-value pairs>e
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

impl Bencode {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Bencode::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Bencode::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Bencode]> {
        match self {
            Bencode::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn get(&self, key: &[u8]) -> Option<&Bencode> {
        match self {
            Bencode::Dict(d) => d.get(key),
            _ => None,
        }
    }

    /// Non-negative integer under `key`
    pub fn get_u64(&self, key: &[u8]) -> Option<u64> {
        self.get(key)?.as_int().and_then(|i| u64::try_from(i).ok())
    }

    pub fn get_str(&self, key: &[u8]) -> Option<&str> {
        self.get(key)?.as_str()
    }
}
