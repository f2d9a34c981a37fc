use super::Bencode;
use crate::error::{BittorrentError, Result};
use std::collections::BTreeMap;
use std::ops::Range;

/// Decode a complete bencoded document
pub fn decode(data: &[u8]) -> Result<Bencode> {
    let mut decoder = Decoder::new(data);
    let value = decoder.decode_value()?;
    if !decoder.is_at_end() {
        return Err(bencode_error("Trailing data after value"));
    }
    Ok(value)
}

/// Cursor over bencoded input.
///
/// Exposes the position so callers can recover the raw bytes a value
/// was decoded from (the info-hash is computed over those bytes).
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn peek(&self) -> Result<u8> {
        self.data
            .get(self.pos)
            .copied()
            .ok_or_else(|| bencode_error("Unexpected end of input"))
    }

    /// Consume `token` if it is the next byte
    pub fn eat(&mut self, token: u8) -> Result<bool> {
        if self.peek()? == token {
            self.pos += 1;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn decode_value(&mut self) -> Result<Bencode> {
        match self.peek()? {
            b'i' => self.decode_int(),
            b'l' => self.decode_list(),
            b'd' => self.decode_dict(),
            b'0'..=b'9' => self.decode_bytes().map(Bencode::Bytes),
            c => Err(bencode_error(&format!("Invalid token: {}", c as char))),
        }
    }

    /// Decode a value and report the byte range it occupied
    pub fn decode_value_with_span(&mut self) -> Result<(Bencode, Range<usize>)> {
        let start = self.pos;
        let value = self.decode_value()?;
        Ok((value, start..self.pos))
    }

    fn read_until(&mut self, terminator: u8) -> Result<&'a str> {
        let start = self.pos;
        let len = self.data[start..]
            .iter()
            .position(|&b| b == terminator)
            .ok_or_else(|| bencode_error("Unterminated token"))?;
        self.pos = start + len + 1;
        std::str::from_utf8(&self.data[start..start + len])
            .map_err(|_| bencode_error("Non-ASCII number"))
    }

    fn decode_int(&mut self) -> Result<Bencode> {
        self.pos += 1;
        let digits = self.read_until(b'e')?;
        digits
            .parse::<i64>()
            .map(Bencode::Int)
            .map_err(|_| bencode_error(&format!("Invalid integer: {}", digits)))
    }

    pub fn decode_bytes(&mut self) -> Result<Vec<u8>> {
        let digits = self.read_until(b':')?;
        let len = digits
            .parse::<usize>()
            .map_err(|_| bencode_error(&format!("Invalid string length: {}", digits)))?;

        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| bencode_error("String length exceeds data"))?;

        let bytes = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(bytes)
    }

    fn decode_list(&mut self) -> Result<Bencode> {
        self.pos += 1;
        let mut list = Vec::new();
        while !self.eat(b'e')? {
            list.push(self.decode_value()?);
        }
        Ok(Bencode::List(list))
    }

    fn decode_dict(&mut self) -> Result<Bencode> {
        self.pos += 1;
        let mut dict = BTreeMap::new();
        while !self.eat(b'e')? {
            let key = self.decode_bytes()?;
            let value = self.decode_value()?;
            dict.insert(key, value);
        }
        Ok(Bencode::Dict(dict))
    }
}

fn bencode_error(message: &str) -> BittorrentError {
    BittorrentError::BencodeError(message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_document() {
        let value = decode(b"d3:bar4:spam3:fooli42ei-3eee").unwrap();
        assert_eq!(value.get_str(b"bar"), Some("spam"));
        let list = value.get(b"foo").and_then(|v| v.as_list()).unwrap();
        assert_eq!(list, &[Bencode::Int(42), Bencode::Int(-3)]);
    }

    #[test]
    fn test_span_covers_raw_value() {
        let data = b"l4:spamd1:ai1eee";
        let mut decoder = Decoder::new(data);
        assert!(decoder.eat(b'l').unwrap());
        decoder.decode_value().unwrap();
        let (_, span) = decoder.decode_value_with_span().unwrap();
        assert_eq!(&data[span], b"d1:ai1ee");
    }

    #[test]
    fn test_malformed_input() {
        assert!(decode(b"i12").is_err());
        assert!(decode(b"5:abc").is_err());
        assert!(decode(b"l").is_err());
        assert!(decode(b"x").is_err());
        assert!(decode(b"i1ei2e").is_err());
        assert!(decode(b"99999999999999999999999:a").is_err());
    }
}
