/// Default scratch capacity: 4 KiB.
const DEFAULT_CODE_BUF_SIZE: usize = 4096;

/// Private scratch buffer a block is emitted into.
///
/// Owned by one compilation; nothing else can observe it until the
/// commit step copies [`as_slice`](Self::as_slice) into the arena.
/// Grows on demand, so emission never fails.
#[derive(Debug, Default, Clone)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
}

impl CodeBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn with_default_size() -> Self {
        Self::new(DEFAULT_CODE_BUF_SIZE)
    }

    /// Current write offset.
    #[inline]
    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Drop the contents, keeping the allocation for the next block.
    pub fn clear(&mut self) {
        self.bytes.clear();
    }

    // -- Emit methods --

    #[inline]
    pub fn emit_u8(&mut self, val: u8) {
        self.bytes.push(val);
    }

    #[inline]
    pub fn emit_u16(&mut self, val: u16) {
        self.bytes.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_u32(&mut self, val: u32) {
        self.bytes.extend_from_slice(&val.to_le_bytes());
    }

    #[inline]
    pub fn emit_bytes(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Read a u16 at the given offset.
    pub fn read_u16(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.bytes[offset], self.bytes[offset + 1]])
    }

    /// Read a u32 at the given offset.
    pub fn read_u32(&self, offset: usize) -> u32 {
        let b = &self.bytes[offset..offset + 4];
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    /// The emitted code.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}
