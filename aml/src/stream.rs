use crate::{
    namespace::{AmlName, NameComponent, NameSeg},
    opcode::Opcode,
    AmlError,
};
use alloc::{string::String, sync::Arc, vec, vec::Vec};
use bit_field::BitField;
use byteorder::{ByteOrder, LittleEndian};

pub const NULL_NAME: u8 = 0x00;
pub const DUAL_NAME_PREFIX: u8 = 0x2e;
pub const MULTI_NAME_PREFIX: u8 = 0x2f;
pub const ROOT_CHAR: u8 = b'\\';
pub const PREFIX_CHAR: u8 = b'^';
pub const EXT_OPCODE_PREFIX: u8 = 0x5b;
pub const LNOT_OP: u8 = 0x92;

/// A range of AML inside a table. The table's bytes are shared, so methods and deferred objects can refer to
/// their code for as long as they live, even after the table itself is unloaded.
#[derive(Clone)]
pub struct AmlCode {
    bytes: Arc<[u8]>,
    start: usize,
    end: usize,
}

impl AmlCode {
    pub fn new(bytes: Arc<[u8]>, start: usize, end: usize) -> AmlCode {
        let end = end.min(bytes.len());
        AmlCode { bytes, start: start.min(end), end }
    }

    /// A range covering all of `bytes`.
    pub fn whole(bytes: Arc<[u8]>) -> AmlCode {
        let end = bytes.len();
        AmlCode { bytes, start: 0, end }
    }

    pub fn bytes(&self) -> &Arc<[u8]> {
        &self.bytes
    }

    pub fn start(&self) -> usize {
        self.start
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// A sub-range of this code, given in absolute offsets into the table.
    pub fn range(&self, start: usize, end: usize) -> AmlCode {
        AmlCode::new(self.bytes.clone(), start.max(self.start), end.min(self.end))
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[self.start..self.end]
    }
}

/// A cursor over AML. Offsets are absolute within the underlying bytes, so they can be stored in blocks and
/// deferred ranges and compared directly.
pub struct AmlStream<'a> {
    bytes: &'a [u8],
    pc: &'a mut usize,
    end: usize,
}

impl<'a> AmlStream<'a> {
    pub fn new(bytes: &'a [u8], pc: &'a mut usize, end: usize) -> AmlStream<'a> {
        let end = end.min(bytes.len());
        AmlStream { bytes, pc, end }
    }

    pub fn pc(&self) -> usize {
        *self.pc
    }

    pub fn end(&self) -> usize {
        self.end
    }

    pub fn is_empty(&self) -> bool {
        *self.pc >= self.end
    }

    pub fn peek(&self) -> Result<u8, AmlError> {
        if *self.pc >= self.end {
            return Err(AmlError::RunOutOfStream);
        }

        Ok(self.bytes[*self.pc])
    }

    pub fn next(&mut self) -> Result<u8, AmlError> {
        let byte = self.peek()?;
        *self.pc += 1;
        Ok(byte)
    }

    /// Consume `n` bytes from the stream and return them.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], AmlError> {
        let start = *self.pc;
        let end = start.checked_add(n).ok_or(AmlError::RunOutOfStream)?;
        if end > self.end {
            return Err(AmlError::RunOutOfStream);
        }
        *self.pc = end;
        let bytes: &'a [u8] = self.bytes;
        Ok(&bytes[start..end])
    }

    pub fn next_u16(&mut self) -> Result<u16, AmlError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    pub fn next_u32(&mut self) -> Result<u32, AmlError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    pub fn next_u64(&mut self) -> Result<u64, AmlError> {
        Ok(LittleEndian::read_u64(self.take(8)?))
    }

    pub fn opcode(&mut self) -> Result<Opcode, AmlError> {
        let opcode: u16 = match self.next()? {
            EXT_OPCODE_PREFIX => {
                let ext = self.next()?;
                ((EXT_OPCODE_PREFIX as u16) << 8) | ext as u16
            }
            /*
             * `0x92` is a bit strange. It can be an opcode in its own right (`LNotOp`), but when followed by
             * `0x93..=0x95`, it instead serves as a negating prefix to encode `LNotEqualOp`, `LLessEqualOp`, and
             * `LGreaterEqualOp`.
             */
            LNOT_OP => match self.peek() {
                Ok(next @ 0x93..=0x95) => {
                    *self.pc += 1;
                    ((LNOT_OP as u16) << 8) | next as u16
                }
                _ => LNOT_OP as u16,
            },
            other => other as u16,
        };

        Opcode::decode(opcode)
    }

    /// Decode a `PkgLength`. The length includes the bytes of the encoding itself.
    pub fn pkglength(&mut self) -> Result<usize, AmlError> {
        let lead_byte = self.next()?;
        let byte_count = lead_byte.get_bits(6..8);

        if byte_count == 0 {
            Ok(lead_byte.get_bits(0..6) as usize)
        } else {
            let mut length = lead_byte.get_bits(0..4) as usize;
            for i in 0..byte_count {
                length |= (self.next()? as usize) << (4 + i * 8);
            }
            Ok(length)
        }
    }

    /// Decode a `PkgLength` and return the absolute offset of the end of the package it describes. Packages
    /// that would run past the end of the current block are rejected.
    pub fn pkg_end(&mut self) -> Result<usize, AmlError> {
        let start = *self.pc;
        let length = self.pkglength()?;
        let end = start.checked_add(length).ok_or(AmlError::InvalidPkgLength)?;
        if end < *self.pc || end > self.end {
            return Err(AmlError::InvalidPkgLength);
        }
        Ok(end)
    }

    fn name_seg(&mut self) -> Result<NameSeg, AmlError> {
        let bytes = self.take(4)?;
        NameSeg::from_raw([bytes[0], bytes[1], bytes[2], bytes[3]])
    }

    /// Decode a `NameString`: an optional root or parent prefixes, followed by a null name, a single segment,
    /// or a dual or multi-segment path.
    pub fn namestring(&mut self) -> Result<AmlName, AmlError> {
        let mut components = vec![];

        match self.peek()? {
            ROOT_CHAR => {
                self.next()?;
                components.push(NameComponent::Root);
            }
            PREFIX_CHAR => {
                while self.peek()? == PREFIX_CHAR {
                    self.next()?;
                    components.push(NameComponent::Prefix);
                }
            }
            _ => (),
        }

        match self.peek()? {
            NULL_NAME => {
                self.next()?;
            }
            DUAL_NAME_PREFIX => {
                self.next()?;
                for _ in 0..2 {
                    components.push(NameComponent::Segment(self.name_seg()?));
                }
            }
            MULTI_NAME_PREFIX => {
                self.next()?;
                let count = self.next()?;
                if count == 0 {
                    return Err(AmlError::InvalidNameSeg([MULTI_NAME_PREFIX, 0, 0, 0]));
                }
                for _ in 0..count {
                    components.push(NameComponent::Segment(self.name_seg()?));
                }
            }
            _ => components.push(NameComponent::Segment(self.name_seg()?)),
        }

        Ok(AmlName::from_components(components))
    }

    /// Decode a null-terminated ASCII string.
    pub fn string(&mut self) -> Result<String, AmlError> {
        let start = *self.pc;
        let mut bytes: Vec<u8> = Vec::new();
        loop {
            match self.next()? {
                0x00 => break,
                byte => bytes.push(byte),
            }
        }
        debug_assert_eq!(start + bytes.len() + 1, *self.pc);
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::str::FromStr;

    fn with_stream<T>(bytes: &[u8], f: impl FnOnce(&mut AmlStream) -> T) -> (T, usize) {
        let mut pc = 0;
        let result = f(&mut AmlStream::new(bytes, &mut pc, bytes.len()));
        (result, pc)
    }

    #[test]
    fn names() {
        assert_eq!(
            with_stream(b"\\\x2eABC_DEF_", |stream| stream.namestring()).0,
            Ok(AmlName::from_str("\\ABC.DEF").unwrap())
        );
        assert_eq!(
            with_stream(b"^^\x2f\x03ABC_DEF_GHI_", |stream| stream.namestring()).0,
            Ok(AmlName::from_str("^^ABC.DEF.GHI").unwrap())
        );
        assert_eq!(with_stream(b"\\\x00", |stream| stream.namestring()), (Ok(AmlName::root()), 2));
        assert_eq!(with_stream(b"\x00", |stream| stream.namestring()), (Ok(AmlName::null()), 1));

        // A name stops after its segments, leaving the following opcode alone
        assert_eq!(
            with_stream(b"_SB_\x0a\x05", |stream| stream.namestring()),
            (Ok(AmlName::from_str("_SB").unwrap()), 4)
        );
        assert_eq!(with_stream(b"ABC", |stream| stream.namestring()).0, Err(AmlError::RunOutOfStream));
        assert!(with_stream(b"1ABC", |stream| stream.namestring()).0.is_err());
    }

    #[test]
    fn pkglength() {
        assert_eq!(with_stream(&[0x06], |stream| stream.pkglength()), (Ok(6), 1));
        // 0x4a 0x02: two bytes, length = 0xa | (0x02 << 4)
        assert_eq!(with_stream(&[0x4a, 0x02], |stream| stream.pkglength()), (Ok(0x2a), 2));
        assert_eq!(with_stream(&[0xc1, 0x23, 0x45, 0x06], |stream| stream.pkglength()), (Ok(0x0645_231), 4));

        // The end of a package is relative to the start of its length
        assert_eq!(with_stream(&[0x03, 0xaa, 0xbb], |stream| stream.pkg_end()), (Ok(3), 1));
        assert_eq!(with_stream(&[0x05, 0xaa], |stream| stream.pkg_end()).0, Err(AmlError::InvalidPkgLength));
    }

    #[test]
    fn literals_and_opcodes() {
        let bytes = [0x34, 0x12, 0x78, 0x56, 0x34, 0x12, b'h', b'i', 0x00, 0x5b, 0x80, 0x92, 0x93, 0x92, 0x70];
        let mut pc = 0;
        let mut stream = AmlStream::new(&bytes, &mut pc, bytes.len());
        assert_eq!(stream.next_u16(), Ok(0x1234));
        assert_eq!(stream.next_u32(), Ok(0x1234_5678));
        assert_eq!(stream.string().as_deref(), Ok("hi"));
        assert_eq!(stream.opcode(), Ok(Opcode::OpRegion));
        assert_eq!(stream.opcode(), Ok(Opcode::LNotEqual));
        assert_eq!(stream.opcode(), Ok(Opcode::LNot));
        assert_eq!(stream.opcode(), Ok(Opcode::Store));
        assert_eq!(stream.next(), Err(AmlError::RunOutOfStream));
    }

    #[test]
    fn streams_stop_at_their_end() {
        let bytes = [0x01, 0x02, 0x03, 0x04];
        let mut pc = 1;
        let mut stream = AmlStream::new(&bytes, &mut pc, 3);
        assert_eq!(stream.next_u16(), Ok(0x0302));
        assert_eq!(stream.peek(), Err(AmlError::RunOutOfStream));
        assert_eq!(stream.take(1), Err(AmlError::RunOutOfStream));
    }
}
