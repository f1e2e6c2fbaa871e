use super::error::Truncated;

/// Bounds-checked reads over a captured frame.
///
/// Every accessor checks against the captured length; multi-byte integers
/// are read big-endian (network order) except where noted.
pub struct FrameReader<'a> {
    data: &'a [u8],
}

impl<'a> FrameReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn require_len(&self, needed: usize) -> Result<(), Truncated> {
        if self.data.len() < needed {
            return Err(Truncated {
                needed,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    pub fn read_u8(&self, offset: usize) -> Result<u8, Truncated> {
        self.data.get(offset).copied().ok_or(Truncated {
            needed: offset + 1,
            actual: self.data.len(),
        })
    }

    pub fn read_u16_be(&self, offset: usize) -> Result<u16, Truncated> {
        let bytes = self.read_slice(offset, 2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32_be(&self, offset: usize) -> Result<u32, Truncated> {
        let bytes = self.read_slice(offset, 4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Host-endian u32, used only for the DLT_NULL address-family word.
    pub fn read_u32_ne(&self, offset: usize) -> Result<u32, Truncated> {
        let bytes = self.read_slice(offset, 4)?;
        Ok(u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_slice(&self, offset: usize, len: usize) -> Result<&'a [u8], Truncated> {
        let end = offset.checked_add(len).ok_or(Truncated {
            needed: usize::MAX,
            actual: self.data.len(),
        })?;
        self.data.get(offset..end).ok_or(Truncated {
            needed: end,
            actual: self.data.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::FrameReader;

    #[test]
    fn read_u16_be_converts_network_order() {
        let data = [0x12, 0x34, 0xAB, 0xCD];
        let reader = FrameReader::new(&data);
        assert_eq!(reader.read_u16_be(0).unwrap(), 0x1234);
        assert_eq!(reader.read_u16_be(2).unwrap(), 0xABCD);
    }

    #[test]
    fn read_u32_be_converts_network_order() {
        let data = [0xC0, 0xA8, 0x00, 0x01];
        let reader = FrameReader::new(&data);
        assert_eq!(reader.read_u32_be(0).unwrap(), 0xC0A8_0001);
    }

    #[test]
    fn reads_past_end_are_truncations() {
        let data = [0u8; 3];
        let reader = FrameReader::new(&data);
        let err = reader.read_u32_be(0).unwrap_err();
        assert_eq!(err.needed, 4);
        assert_eq!(err.actual, 3);
        assert!(reader.read_u8(3).is_err());
        assert!(reader.require_len(4).is_err());
        assert!(reader.require_len(3).is_ok());
    }
}
