//! Fixed-layout queue elements shared with firmware.
//!
//! Layouts are little-endian and `#[repr(C)]`; their sizes are part of the
//! firmware contract and are checked at compile time.

use std::mem::size_of;

/// Opcodes understood by the firmware on the KCI.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CommandCode {
    Ack = 0,
    UnmapBuffer = 1,
    MapLogBuffer = 2,
    JoinGroup = 3,
    LeaveGroup = 4,
    MapTraceBuffer = 5,
    Shutdown = 7,
}

impl CommandCode {
    pub fn from_u16(val: u16) -> Option<Self> {
        Some(match val {
            0 => CommandCode::Ack,
            1 => CommandCode::UnmapBuffer,
            2 => CommandCode::MapLogBuffer,
            3 => CommandCode::JoinGroup,
            4 => CommandCode::LeaveGroup,
            5 => CommandCode::MapTraceBuffer,
            7 => CommandCode::Shutdown,
            _ => return None,
        })
    }

    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

/// Delivery state of a response, as tracked by the host.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResponseStatus {
    Ok,
    /// Command pushed, no response harvested yet.
    Waiting,
    /// Firmware answered a later command first.
    NoResponse,
    Unknown(u16),
}

impl ResponseStatus {
    pub fn from_u16(val: u16) -> Self {
        match val {
            0 => ResponseStatus::Ok,
            1 => ResponseStatus::Waiting,
            2 => ResponseStatus::NoResponse,
            other => ResponseStatus::Unknown(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            ResponseStatus::Ok => 0,
            ResponseStatus::Waiting => 1,
            ResponseStatus::NoResponse => 2,
            ResponseStatus::Unknown(other) => other,
        }
    }
}

/// Buffer reference carried by DMA-related commands.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DmaDescriptor {
    pub address: u64,
    pub size: u32,
    pub flags: u32,
}

/// One command queue entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CommandElement {
    /// Filled in by the engine at submission.
    pub seq: u64,
    pub code: u16,
    pub reserved: [u16; 3],
    pub dma: DmaDescriptor,
}

/// One KCI response queue entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResponseElement {
    pub seq: u64,
    pub code: u16,
    pub status: u16,
    pub retval: u32,
}

/// One VII response queue entry.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ViiResponseElement {
    pub seq: u64,
    pub code: u16,
    pub reserved: [u8; 6],
    pub retval: u64,
}

/// Payload of a JOIN_GROUP command, passed by device address.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupDetail {
    pub n_dies: u8,
    pub vid: u8,
    pub reserved: [u8; 6],
}

const _: () = assert!(size_of::<DmaDescriptor>() == 16);
const _: () = assert!(size_of::<CommandElement>() == CommandElement::SIZE);
const _: () = assert!(size_of::<ResponseElement>() == ResponseElement::SIZE);
const _: () = assert!(size_of::<ViiResponseElement>() == ViiResponseElement::SIZE);
const _: () = assert!(size_of::<GroupDetail>() == GroupDetail::SIZE);

fn u16_at(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

fn u32_at(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

fn u64_at(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

impl CommandElement {
    pub const SIZE: usize = 32;

    pub fn new(code: CommandCode) -> Self {
        Self {
            code: code.as_u16(),
            ..Self::default()
        }
    }

    pub fn with_dma(code: CommandCode, address: u64, size: u32, flags: u32) -> Self {
        Self {
            code: code.as_u16(),
            dma: DmaDescriptor {
                address,
                size,
                flags,
            },
            ..Self::default()
        }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..10].copy_from_slice(&self.code.to_le_bytes());
        for (i, r) in self.reserved.iter().enumerate() {
            buf[10 + 2 * i..12 + 2 * i].copy_from_slice(&r.to_le_bytes());
        }
        buf[16..24].copy_from_slice(&self.dma.address.to_le_bytes());
        buf[24..28].copy_from_slice(&self.dma.size.to_le_bytes());
        buf[28..32].copy_from_slice(&self.dma.flags.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            seq: u64_at(buf, 0),
            code: u16_at(buf, 8),
            reserved: [u16_at(buf, 10), u16_at(buf, 12), u16_at(buf, 14)],
            dma: DmaDescriptor {
                address: u64_at(buf, 16),
                size: u32_at(buf, 24),
                flags: u32_at(buf, 28),
            },
        }
    }
}

impl ResponseElement {
    pub const SIZE: usize = 16;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..10].copy_from_slice(&self.code.to_le_bytes());
        buf[10..12].copy_from_slice(&self.status.to_le_bytes());
        buf[12..16].copy_from_slice(&self.retval.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            seq: u64_at(buf, 0),
            code: u16_at(buf, 8),
            status: u16_at(buf, 10),
            retval: u32_at(buf, 12),
        }
    }
}

impl ViiResponseElement {
    pub const SIZE: usize = 24;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.seq.to_le_bytes());
        buf[8..10].copy_from_slice(&self.code.to_le_bytes());
        buf[10..16].copy_from_slice(&self.reserved);
        buf[16..24].copy_from_slice(&self.retval.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8; Self::SIZE]) -> Self {
        let mut reserved = [0u8; 6];
        reserved.copy_from_slice(&buf[10..16]);
        Self {
            seq: u64_at(buf, 0),
            code: u16_at(buf, 8),
            reserved,
            retval: u64_at(buf, 16),
        }
    }
}

impl GroupDetail {
    pub const SIZE: usize = 8;

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = self.n_dies;
        buf[1] = self.vid;
        buf[2..].copy_from_slice(&self.reserved);
        buf
    }
}
