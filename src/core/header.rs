//! # Packet Header
//!
//! The first byte of every frame is a set of bit flags describing how the rest of
//! the frame must be read.
//!
//! ## Bit Layout
//! ```text
//! bit 7    6        5     4          3            2         1         0
//!     [ r ][MSGPACK][ZERO][ENCRYPTION][COMPRESSION][BIG_SIZE][COUNTING][ r ]
//! ```
//! Reserved bits are ignored on decode and never set on encode.

use crate::core::data::DataType;

/// One flag of the header byte. Values are distinct powers of two.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketHeaderType {
    /// The frame carries a length field after the header byte
    Counting = 1 << 1,
    /// The length field is 4 bytes instead of 2
    BigSize = 1 << 2,
    /// The payload is compressed
    Compression = 1 << 3,
    /// The payload is encrypted
    Encryption = 1 << 4,
    /// The payload is serialized in the zero (binary) format
    Zero = 1 << 5,
    /// The payload is serialized as MessagePack
    MsgPack = 1 << 6,
}

impl PacketHeaderType {
    pub const ALL: [PacketHeaderType; 6] = [
        PacketHeaderType::Counting,
        PacketHeaderType::BigSize,
        PacketHeaderType::Compression,
        PacketHeaderType::Encryption,
        PacketHeaderType::Zero,
        PacketHeaderType::MsgPack,
    ];

    #[inline]
    pub const fn bit(self) -> u8 {
        self as u8
    }
}

/// Decoded form of the header byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub counting: bool,
    pub big_sized: bool,
    pub compressed: bool,
    pub encrypted: bool,
    pub zero: bool,
    pub msgpack: bool,
}

impl PacketHeader {
    /// Header for an outbound frame. Exactly one data-type flag is set.
    pub fn new(
        counting: bool,
        compressed: bool,
        big_sized: bool,
        encrypted: bool,
        data_type: DataType,
    ) -> Self {
        Self {
            counting,
            big_sized,
            compressed,
            encrypted,
            zero: data_type == DataType::Zero,
            msgpack: data_type == DataType::MsgPack,
        }
    }

    /// Serialization format announced by the header.
    ///
    /// MessagePack wins when its bit is set; every other combination falls back
    /// to the zero format.
    pub fn data_type(&self) -> DataType {
        if self.msgpack {
            DataType::MsgPack
        } else {
            DataType::Zero
        }
    }

    /// Number of bytes used by the length field, 0 when the frame is not counted.
    pub fn length_field_size(&self) -> usize {
        match (self.counting, self.big_sized) {
            (false, _) => 0,
            (true, false) => 2,
            (true, true) => 4,
        }
    }

    fn flag(&self, kind: PacketHeaderType) -> bool {
        match kind {
            PacketHeaderType::Counting => self.counting,
            PacketHeaderType::BigSize => self.big_sized,
            PacketHeaderType::Compression => self.compressed,
            PacketHeaderType::Encryption => self.encrypted,
            PacketHeaderType::Zero => self.zero,
            PacketHeaderType::MsgPack => self.msgpack,
        }
    }
}

/// Decode the first byte of a frame into its header flags.
#[inline]
pub fn decode_first_header_byte(byte: u8) -> PacketHeader {
    let has = |kind: PacketHeaderType| byte & kind.bit() != 0;
    PacketHeader {
        counting: has(PacketHeaderType::Counting),
        big_sized: has(PacketHeaderType::BigSize),
        compressed: has(PacketHeaderType::Compression),
        encrypted: has(PacketHeaderType::Encryption),
        zero: has(PacketHeaderType::Zero),
        msgpack: has(PacketHeaderType::MsgPack),
    }
}

/// Encode header flags into the first byte of a frame.
#[inline]
pub fn encode_first_header_byte(header: &PacketHeader) -> u8 {
    PacketHeaderType::ALL
        .iter()
        .filter(|kind| header.flag(**kind))
        .fold(0u8, |byte, kind| byte | kind.bit())
}
