//! Wire structs exchanged with the capture helper.
//!
//! Messages on the control pipe are raw fixed-layout structs, little
//! endian, and the kinds are disambiguated purely by size: the host's
//! config is 48 bytes, the helper's shared-handle reply is 16, the
//! secure-desktop notification is a single byte. The frame-ready pipe
//! carries only 12-byte [`FrameReady`] records.

use crate::error::{AppError, Result};

/// Single-byte control message: the helper hit the Secure Desktop and WGC
/// capture is about to fail; the host must fall back to desktop
/// duplication.
pub const SECURE_DESKTOP_MSG: u8 = 0x01;

/// Size of the encoded [`ConfigData`].
pub const CONFIG_DATA_LEN: usize = 48;
/// Size of the encoded [`SharedHandleData`].
pub const SHARED_HANDLE_LEN: usize = 16;
/// Size of the encoded [`FrameReady`].
pub const FRAME_READY_LEN: usize = 12;

/// First message from host to helper: what to capture and how to log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigData {
    /// 0 = SDR, 1 = HDR
    pub dynamic_range: u32,
    pub log_level: u32,
    /// UTF-8 display name, NUL padded to 32 bytes
    pub display_name: String,
    pub adapter_luid: u64,
}

impl ConfigData {
    pub fn encode(&self) -> [u8; CONFIG_DATA_LEN] {
        let mut buf = [0u8; CONFIG_DATA_LEN];
        buf[0..4].copy_from_slice(&self.dynamic_range.to_le_bytes());
        buf[4..8].copy_from_slice(&self.log_level.to_le_bytes());
        let name = self.display_name.as_bytes();
        let n = name.len().min(32);
        buf[8..8 + n].copy_from_slice(&name[..n]);
        buf[40..48].copy_from_slice(&self.adapter_luid.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != CONFIG_DATA_LEN {
            return Err(AppError::Ipc(format!(
                "config message has {} bytes, expected {}",
                buf.len(),
                CONFIG_DATA_LEN
            )));
        }
        let name_end = buf[8..40].iter().position(|b| *b == 0).unwrap_or(32);
        Ok(Self {
            dynamic_range: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            log_level: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            display_name: String::from_utf8_lossy(&buf[8..8 + name_end]).into_owned(),
            adapter_luid: u64::from_le_bytes(buf[40..48].try_into().unwrap()),
        })
    }
}

/// First message from helper to host: the cross-process texture handle and
/// its dimensions. The host duplicates the handle into its own address
/// space before use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SharedHandleData {
    pub handle: u64,
    pub width: u32,
    pub height: u32,
}

impl SharedHandleData {
    pub fn encode(&self) -> [u8; SHARED_HANDLE_LEN] {
        let mut buf = [0u8; SHARED_HANDLE_LEN];
        buf[0..8].copy_from_slice(&self.handle.to_le_bytes());
        buf[8..12].copy_from_slice(&self.width.to_le_bytes());
        buf[12..16].copy_from_slice(&self.height.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != SHARED_HANDLE_LEN {
            return Err(AppError::Ipc(format!(
                "shared-handle message has {} bytes, expected {}",
                buf.len(),
                SHARED_HANDLE_LEN
            )));
        }
        Ok(Self {
            handle: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            width: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            height: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }
}

/// One record on the frame-ready pipe: a new frame landed in the shared
/// texture at the given QPC timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReady {
    pub kind: u32,
    pub frame_qpc: u64,
}

impl FrameReady {
    pub fn encode(&self) -> [u8; FRAME_READY_LEN] {
        let mut buf = [0u8; FRAME_READY_LEN];
        buf[0..4].copy_from_slice(&self.kind.to_le_bytes());
        buf[4..12].copy_from_slice(&self.frame_qpc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != FRAME_READY_LEN {
            return Err(AppError::Ipc(format!(
                "frame-ready message has {} bytes, expected {}",
                buf.len(),
                FRAME_READY_LEN
            )));
        }
        Ok(Self {
            kind: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            frame_qpc: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
        })
    }
}
