//! Wrapper types around Bitvec.
use bitvec::prelude::*;

/// Bitfield where index = piece.
pub type Bitfield = BitVec<u8, Msb0>;

pub trait BitfieldExt {
    /// A bitfield of `pieces` bits, all unset.
    fn from_piece(pieces: usize) -> Bitfield {
        bitvec![u8, Msb0; 0; pieces]
    }

    /// Build a bitfield from the bytes of a Bitfield message. The wire format
    /// pads the last byte, so the padding bits are cut to `len`.
    fn from_wire(bytes: Vec<u8>, len: usize) -> Bitfield {
        let mut b = Bitfield::from_vec(bytes);
        b.resize(len, false);
        b
    }

    /// Set the bit, growing the bitfield when `index` is past the end.
    fn safe_set(&mut self, index: usize);

    /// Get the bit, out of bound indices are unset.
    fn has(&self, index: usize) -> bool;
}

impl BitfieldExt for Bitfield {
    fn safe_set(&mut self, index: usize) {
        if self.len() <= index {
            self.resize(index + 1, false);
        }
        self.set(index, true);
    }

    fn has(&self, index: usize) -> bool {
        self.get(index).map(|b| *b).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_piece() {
        let bitfield = Bitfield::from_piece(1407);
        assert_eq!(bitfield.len(), 1407);
        assert_eq!(bitfield.count_ones(), 0);
    }

    #[test]
    fn safe_set() {
        let mut bitfield = Bitfield::from_wire(vec![0], 2);
        assert_eq!(bitfield.len(), 2);

        bitfield.safe_set(2);
        assert_eq!(bitfield.len(), 3);
        assert!(bitfield.has(2));

        bitfield.safe_set(10);
        assert_eq!(bitfield.len(), 11);
        assert!(bitfield.has(10));
    }

    #[test]
    fn has_out_of_bounds() {
        let bitfield = Bitfield::from_piece(3);
        assert!(!bitfield.has(10));
        assert_eq!(bitfield.len(), 3);
    }

    #[test]
    fn from_wire_cuts_padding() {
        // 0b1110_0001, only the first 3 bits are pieces
        let bitfield = Bitfield::from_wire(vec![0b1110_0001], 3);
        assert_eq!(bitfield.len(), 3);
        assert_eq!(bitfield.count_ones(), 3);

        let bitfield = Bitfield::from_wire(vec![0xff, 0x80], 9);
        assert_eq!(bitfield.len(), 9);
        assert_eq!(bitfield.count_ones(), 9);

        // a short message is padded with unset bits
        let bitfield = Bitfield::from_wire(vec![0xff], 12);
        assert_eq!(bitfield.len(), 12);
        assert_eq!(bitfield.count_ones(), 8);
    }
}
