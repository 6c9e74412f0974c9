//! Typed wrappers for the individual KCI opcodes.

use std::fmt;

use super::{CommandCode, CommandElement, GroupDetail, KciEngine, ResponseElement};
use crate::error::KciError;
use crate::memory::PAGE_SIZE;
use crate::types::{ContextId, DmaDirection, QueueRole};

/// Device mapping of one KCI queue, for diagnostic dumps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueMapping {
    pub role: QueueRole,
    pub device_addr: u64,
    pub bytes: usize,
}

impl QueueMapping {
    pub fn pages(&self) -> usize {
        self.bytes.div_ceil(PAGE_SIZE)
    }
}

impl fmt::Display for QueueMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self.role {
            QueueRole::Command => "cmdq",
            QueueRole::Response => "rspq",
        };
        write!(f, "{:#x} {} {}", self.device_addr, self.pages(), name)
    }
}

impl KciEngine {
    fn send(&self, cmd: CommandElement) -> Result<u16, KciError> {
        self.push_command_and_wait(cmd, self.inner.config.timeout)
    }

    /// Round-trip a no-op command to check firmware is alive.
    pub fn ack(&self) -> Result<u16, KciError> {
        self.send(CommandElement::new(CommandCode::Ack))
    }

    /// Ask firmware to drop its mapping of a buffer.
    pub fn unmap_buffer(
        &self,
        device_addr: u64,
        size: u32,
        direction: DmaDirection,
    ) -> Result<u16, KciError> {
        self.send(CommandElement::with_dma(
            CommandCode::UnmapBuffer,
            device_addr,
            size,
            direction.as_u32(),
        ))
    }

    pub fn map_log_buffer(&self, device_addr: u64, size: u32) -> Result<u16, KciError> {
        self.send(CommandElement::with_dma(
            CommandCode::MapLogBuffer,
            device_addr,
            size,
            0,
        ))
    }

    pub fn map_trace_buffer(&self, device_addr: u64, size: u32) -> Result<u16, KciError> {
        self.send(CommandElement::with_dma(
            CommandCode::MapTraceBuffer,
            device_addr,
            size,
            0,
        ))
    }

    /// Tell firmware this die joined a group of `n_dies` dies under virtual
    /// id `vid`.
    ///
    /// The group detail travels in a temporary buffer mapped to-device in
    /// the KCI context; it is unmapped and freed whatever the outcome.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn join_group(&self, n_dies: u8, vid: u8) -> Result<u16, KciError> {
        let detail = GroupDetail {
            n_dies,
            vid,
            reserved: [0; 6],
        };
        let size = GroupDetail::SIZE;
        let buffer = self.memory.allocate(size)?;
        buffer.region().write_bytes(0, &detail.encode());

        let device_addr =
            match self
                .translation
                .map(&buffer, size, DmaDirection::ToDevice, ContextId::KCI)
            {
                Ok(addr) => addr,
                Err(source) => {
                    error!(error = %source, "failed to map group detail");
                    self.memory.free(buffer);
                    return Err(KciError::MapFailed { size, source });
                }
            };
        debug!(addr = device_addr, "group detail mapped");

        let result = self.send(CommandElement::with_dma(
            CommandCode::JoinGroup,
            device_addr,
            size as u32,
            0,
        ));

        self.translation.unmap(device_addr, size, ContextId::KCI);
        self.memory.free(buffer);
        result
    }

    pub fn leave_group(&self) -> Result<u16, KciError> {
        self.send(CommandElement::new(CommandCode::LeaveGroup))
    }

    pub fn shutdown(&self) -> Result<u16, KciError> {
        self.send(CommandElement::new(CommandCode::Shutdown))
    }

    /// Device addresses and sizes of both KCI queues.
    pub fn mappings(&self) -> Vec<QueueMapping> {
        let snapshot = self.inner.mailbox.snapshot();
        vec![
            QueueMapping {
                role: QueueRole::Command,
                device_addr: snapshot.cmd_queue.device_addr,
                bytes: snapshot.cmd_queue.capacity as usize * CommandElement::SIZE,
            },
            QueueMapping {
                role: QueueRole::Response,
                device_addr: snapshot.resp_queue.device_addr,
                bytes: snapshot.resp_queue.capacity as usize * ResponseElement::SIZE,
            },
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapping_line_format() {
        let mapping = QueueMapping {
            role: QueueRole::Command,
            device_addr: 0x4000_0000,
            bytes: 1023 * CommandElement::SIZE,
        };
        assert_eq!(mapping.pages(), 8);
        assert_eq!(mapping.to_string(), "0x40000000 8 cmdq");
    }
}
