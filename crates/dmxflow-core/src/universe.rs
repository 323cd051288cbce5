//! Universe channel buffer
//!
//! A DMX512 frame is a start code followed by up to 512 channel slots. The
//! buffer keeps the whole frame in one fixed array so the transmission loop can
//! copy it out in a single step. Channel addresses on the public API are
//! 0-based; channel `c` lives in slot `c + 1`.

/// Number of addressable channels in one universe
pub const CHANNELS_PER_UNIVERSE: usize = 512;

/// Size of a full frame: start code + channel data
pub const FRAME_SIZE: usize = CHANNELS_PER_UNIVERSE + 1;

/// Start code for standard dimmer data
pub const DEFAULT_START_CODE: u8 = 0x00;

/// Channel values for one universe.
///
/// The buffer itself is not synchronized; a device wraps it in its single
/// mutex and every access goes through that lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelBuffer {
    slots: [u8; FRAME_SIZE],
    dirty: bool,
}

impl Default for ChannelBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelBuffer {
    /// Create a zeroed buffer with the standard start code.
    ///
    /// A fresh buffer starts dirty so the first frame is always sent.
    pub fn new() -> Self {
        Self {
            slots: [0u8; FRAME_SIZE],
            dirty: true,
        }
    }

    #[inline]
    fn slot(channel: u16) -> usize {
        assert!(
            (channel as usize) < CHANNELS_PER_UNIVERSE,
            "DMX channel {} out of range (0-511)",
            channel
        );
        channel as usize + 1
    }

    #[inline]
    fn span(address: u16, len: usize) -> std::ops::Range<usize> {
        let start = address as usize;
        assert!(
            start + len <= CHANNELS_PER_UNIVERSE,
            "DMX range {}+{} exceeds 512 channels",
            start,
            len
        );
        start + 1..start + 1 + len
    }

    /// Set one channel (0-511).
    ///
    /// # Panics
    /// Panics if `channel` is outside the universe.
    pub fn write(&mut self, channel: u16, value: u8) {
        let index = Self::slot(channel);
        self.slots[index] = value;
        self.dirty = true;
    }

    /// Copy `values` into consecutive channels starting at `address`.
    ///
    /// # Panics
    /// Panics if `address + values.len()` exceeds 512.
    pub fn write_range(&mut self, address: u16, values: &[u8]) {
        let span = Self::span(address, values.len());
        self.slots[span].copy_from_slice(values);
        self.dirty = true;
    }

    /// Read one channel (0-511). Reads never touch the dirty flag.
    pub fn read(&self, channel: u16) -> u8 {
        self.slots[Self::slot(channel)]
    }

    /// Copy consecutive channels starting at `address` into `out`.
    pub fn read_range(&self, address: u16, out: &mut [u8]) {
        let span = Self::span(address, out.len());
        out.copy_from_slice(&self.slots[span]);
    }

    /// Channel data without the start code
    pub fn channels(&self) -> &[u8] {
        &self.slots[1..]
    }

    /// Full frame including the start code
    pub fn frame(&self) -> &[u8; FRAME_SIZE] {
        &self.slots
    }

    /// Copy of the full frame
    pub fn snapshot(&self) -> [u8; FRAME_SIZE] {
        self.slots
    }

    /// Current start code
    pub fn start_code(&self) -> u8 {
        self.slots[0]
    }

    /// Replace the start code (alternate start codes carry non-dimmer data)
    pub fn set_start_code(&mut self, start_code: u8) {
        self.slots[0] = start_code;
        self.dirty = true;
    }

    /// Whether contents changed since the last `take_dirty`
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Clear the dirty flag, returning its previous value
    pub fn take_dirty(&mut self) -> bool {
        std::mem::replace(&mut self.dirty, false)
    }
}
