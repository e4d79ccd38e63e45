//! Little-endian cursor over a state snapshot buffer

use crate::scheduler::EventHandle;
use crate::{DeviceError, Result};

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(DeviceError::SnapshotTooSmall)?;
        let slice = self.buf.get(self.pos..end).ok_or(DeviceError::SnapshotTooSmall)?;
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.array::<1>()?[0])
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    pub fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

/// Optional event handle: presence byte + raw handle
pub(crate) const HANDLE_SIZE: usize = 9;

pub(crate) fn put_handle(buf: &mut Vec<u8>, handle: Option<EventHandle>) {
    buf.push(handle.is_some() as u8);
    buf.extend_from_slice(&handle.map_or(0, EventHandle::to_raw).to_le_bytes());
}

impl Reader<'_> {
    pub fn handle(&mut self) -> Result<Option<EventHandle>> {
        let present = self.bool()?;
        let raw = self.u64()?;
        Ok(present.then(|| EventHandle::from_raw(raw)))
    }
}
