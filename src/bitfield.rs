/// Per-piece bitmap, most significant bit first, as sent on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Bitfield {
    bits: Vec<u8>,
    len: usize,
}

impl Bitfield {
    pub fn new(len: usize) -> Self {
        Self {
            bits: vec![0u8; len.div_ceil(8)],
            len,
        }
    }

    /// Build from a wire payload, truncating or zero-padding to `len` pieces.
    /// Spare trailing bits are cleared.
    pub fn from_bytes(bytes: &[u8], len: usize) -> Self {
        let mut bitfield = Self::new(len);
        let n = bitfield.bits.len().min(bytes.len());
        bitfield.bits[..n].copy_from_slice(&bytes[..n]);

        let spare = bitfield.bits.len() * 8 - len;
        if spare > 0 {
            if let Some(last) = bitfield.bits.last_mut() {
                *last &= 0xffu8 << spare;
            }
        }
        bitfield
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        (self.bits[index / 8] >> (7 - index % 8)) & 1 == 1
    }

    pub fn set(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] |= 1 << (7 - index % 8);
        }
    }

    pub fn clear(&mut self, index: usize) {
        if index < self.len {
            self.bits[index / 8] &= !(1 << (7 - index % 8));
        }
    }

    pub fn count_ones(&self) -> usize {
        self.bits.iter().map(|b| b.count_ones() as usize).sum()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bits
    }
}
