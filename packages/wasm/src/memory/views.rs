use super::{BufferId, LinearMemory};
use crate::error::{BoundaryError, BoundaryResult};
use std::fmt;
use std::ops::Range;

/// Typed view cache over a [`LinearMemory`].
///
/// Each accessor compares the cached buffer identity with the current one and
/// rebuilds on mismatch (or when the cached buffer is empty). Revalidation
/// happens on every access, so a grow performed by any code path is picked up
/// without explicit invalidation.
pub struct MemoryViews {
    memory: Box<dyn LinearMemory>,
    bytes: Option<BufferId>,
    floats: Option<BufferId>,
    data: Option<BufferId>,
    rebuilds: u64,
}

impl MemoryViews {
    pub fn new(memory: Box<dyn LinearMemory>) -> Self {
        Self {
            memory,
            bytes: None,
            floats: None,
            data: None,
            rebuilds: 0,
        }
    }

    /// Byte (`Uint8Array`) view
    pub fn bytes(&mut self) -> ByteView<'_> {
        let current = self.memory.buffer_id();
        if is_stale(self.bytes, current) {
            self.bytes = Some(current);
            self.rebuilds += 1;
            tracing::trace!(len = current.len(), "rebuilt byte view");
        }
        ByteView {
            bytes: self.memory.data_mut(),
        }
    }

    /// `f64` (`Float64Array`) view
    pub fn floats(&mut self) -> FloatView<'_> {
        let current = self.memory.buffer_id();
        if is_stale(self.floats, current) {
            self.floats = Some(current);
            self.rebuilds += 1;
            tracing::trace!(len = current.len(), "rebuilt f64 view");
        }
        FloatView {
            bytes: self.memory.data(),
        }
    }

    /// Little-endian `DataView`
    pub fn data_view(&mut self) -> DataView<'_> {
        let current = self.memory.buffer_id();
        if is_stale(self.data, current) {
            self.data = Some(current);
            self.rebuilds += 1;
            tracing::trace!(len = current.len(), "rebuilt data view");
        }
        DataView {
            bytes: self.memory.data_mut(),
        }
    }

    /// Drop all cached views
    pub fn invalidate(&mut self) {
        self.bytes = None;
        self.floats = None;
        self.data = None;
    }

    /// Number of view rebuilds so far
    pub fn rebuild_count(&self) -> u64 {
        self.rebuilds
    }

    /// Current memory size in bytes
    pub fn size(&self) -> usize {
        self.memory.data().len()
    }

    pub fn size_pages(&self) -> u64 {
        self.memory.size_pages()
    }

    /// Grow the underlying memory. Cached views go stale and are rebuilt on
    /// their next access.
    pub fn grow(&mut self, pages: u64) -> BoundaryResult<u64> {
        self.memory.grow(pages)
    }

    pub fn memory(&self) -> &dyn LinearMemory {
        self.memory.as_ref()
    }

    pub fn memory_mut(&mut self) -> &mut dyn LinearMemory {
        self.memory.as_mut()
    }
}

impl fmt::Debug for MemoryViews {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryViews")
            .field("size", &self.size())
            .field("rebuilds", &self.rebuilds)
            .finish()
    }
}

fn is_stale(cached: Option<BufferId>, current: BufferId) -> bool {
    cached != Some(current) || current.is_empty()
}

fn checked_range(ptr: u32, len: usize, size: usize) -> BoundaryResult<Range<usize>> {
    let start = ptr as usize;
    let end = start
        .checked_add(len)
        .filter(|end| *end <= size)
        .ok_or_else(|| {
            BoundaryError::memory_access(format!(
                "access of {} bytes at {:#x} is out of bounds for memory of {} bytes",
                len, ptr, size
            ))
        })?;
    Ok(start..end)
}

/// Byte view over linear memory
pub struct ByteView<'a> {
    bytes: &'a mut [u8],
}

impl ByteView<'_> {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn read(&self, ptr: u32, len: u32) -> BoundaryResult<&[u8]> {
        let range = checked_range(ptr, len as usize, self.bytes.len())?;
        Ok(&self.bytes[range])
    }

    pub fn write(&mut self, ptr: u32, data: &[u8]) -> BoundaryResult<()> {
        let range = checked_range(ptr, data.len(), self.bytes.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }

    /// Mutable window `[ptr, ptr + len)`
    pub fn subarray(&mut self, ptr: u32, len: u32) -> BoundaryResult<&mut [u8]> {
        let range = checked_range(ptr, len as usize, self.bytes.len())?;
        Ok(&mut self.bytes[range])
    }

    pub fn copy_within(&mut self, src: u32, dst: u32, len: u32) -> BoundaryResult<()> {
        let from = checked_range(src, len as usize, self.bytes.len())?;
        checked_range(dst, len as usize, self.bytes.len())?;
        self.bytes.copy_within(from, dst as usize);
        Ok(())
    }
}

/// `f64` view over linear memory. Addresses are byte offsets and must be
/// 8-byte aligned.
pub struct FloatView<'a> {
    bytes: &'a [u8],
}

impl FloatView<'_> {
    /// Number of whole `f64` elements
    pub fn len(&self) -> usize {
        self.bytes.len() / 8
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, ptr: u32) -> BoundaryResult<f64> {
        Ok(self.slice_from(ptr, 1)?[0])
    }

    /// Copy `count` elements starting at byte address `ptr`
    pub fn slice_from(&self, ptr: u32, count: u32) -> BoundaryResult<Vec<f64>> {
        if ptr % 8 != 0 {
            return Err(BoundaryError::memory_access(format!(
                "f64 access at {:#x} is not 8-byte aligned",
                ptr
            )));
        }
        let len = (count as usize).checked_mul(8).ok_or_else(|| {
            BoundaryError::memory_access(format!("f64 slice of {} elements overflows", count))
        })?;
        let range = checked_range(ptr, len, self.bytes.len())?;
        Ok(self.bytes[range]
            .chunks_exact(8)
            .map(|chunk| {
                let mut word = [0u8; 8];
                word.copy_from_slice(chunk);
                f64::from_le_bytes(word)
            })
            .collect())
    }
}

/// Little-endian scalar view over linear memory
pub struct DataView<'a> {
    bytes: &'a mut [u8],
}

impl DataView<'_> {
    fn word<const N: usize>(&self, ptr: u32) -> BoundaryResult<[u8; N]> {
        let range = checked_range(ptr, N, self.bytes.len())?;
        let mut word = [0u8; N];
        word.copy_from_slice(&self.bytes[range]);
        Ok(word)
    }

    fn set_word<const N: usize>(&mut self, ptr: u32, word: [u8; N]) -> BoundaryResult<()> {
        let range = checked_range(ptr, N, self.bytes.len())?;
        self.bytes[range].copy_from_slice(&word);
        Ok(())
    }

    pub fn get_u32(&self, ptr: u32) -> BoundaryResult<u32> {
        self.word(ptr).map(u32::from_le_bytes)
    }

    pub fn set_u32(&mut self, ptr: u32, value: u32) -> BoundaryResult<()> {
        self.set_word(ptr, value.to_le_bytes())
    }

    pub fn get_i32(&self, ptr: u32) -> BoundaryResult<i32> {
        self.word(ptr).map(i32::from_le_bytes)
    }

    pub fn set_i32(&mut self, ptr: u32, value: i32) -> BoundaryResult<()> {
        self.set_word(ptr, value.to_le_bytes())
    }

    pub fn get_f64(&self, ptr: u32) -> BoundaryResult<f64> {
        self.word(ptr).map(f64::from_le_bytes)
    }

    pub fn set_f64(&mut self, ptr: u32, value: f64) -> BoundaryResult<()> {
        self.set_word(ptr, value.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{VecMemory, PAGE_SIZE};

    fn views(pages: u32) -> MemoryViews {
        MemoryViews::new(Box::new(VecMemory::new(pages)))
    }

    #[test]
    fn test_view_reports_new_size_after_grow() {
        let mut views = views(1);
        assert_eq!(views.bytes().len(), PAGE_SIZE);

        views.grow(2).unwrap();
        assert_eq!(views.bytes().len(), 3 * PAGE_SIZE);
        assert_eq!(views.floats().len(), 3 * PAGE_SIZE / 8);
    }

    #[test]
    fn test_views_rebuild_only_on_identity_change() {
        let mut views = views(1);
        views.bytes();
        views.bytes();
        views.data_view();
        assert_eq!(views.rebuild_count(), 2);

        views.grow(1).unwrap();
        views.bytes();
        views.bytes();
        assert_eq!(views.rebuild_count(), 3);

        views.invalidate();
        views.bytes();
        assert_eq!(views.rebuild_count(), 4);
    }

    #[test]
    fn test_empty_memory_always_rebuilds() {
        let mut views = views(0);
        views.bytes();
        views.bytes();
        assert_eq!(views.rebuild_count(), 2);
        assert!(views.bytes().read(0, 1).is_err());
    }

    #[test]
    fn test_byte_view_bounds() {
        let mut views = views(1);
        let mut bytes = views.bytes();
        bytes.write(100, b"abc").unwrap();
        assert_eq!(bytes.read(100, 3).unwrap(), b"abc");
        assert!(bytes.read(PAGE_SIZE as u32 - 1, 2).is_err());
        assert!(bytes.write(u32::MAX, b"x").is_err());

        bytes.copy_within(100, 200, 3).unwrap();
        assert_eq!(bytes.read(200, 3).unwrap(), b"abc");
    }

    #[test]
    fn test_data_view_is_little_endian() {
        let mut views = views(1);
        views.data_view().set_u32(8, 0x0403_0201).unwrap();
        assert_eq!(views.bytes().read(8, 4).unwrap(), &[1u8, 2, 3, 4]);
        views.data_view().set_i32(12, -2).unwrap();
        assert_eq!(views.data_view().get_i32(12).unwrap(), -2);
        views.data_view().set_f64(16, 2.5).unwrap();
        assert_eq!(views.floats().get(16).unwrap(), 2.5);
    }

    #[test]
    fn test_float_view_requires_alignment() {
        let mut views = views(1);
        views.data_view().set_f64(24, 1.0).unwrap();
        views.data_view().set_f64(32, -1.0).unwrap();
        assert_eq!(views.floats().slice_from(24, 2).unwrap(), vec![1.0, -1.0]);
        assert!(matches!(
            views.floats().slice_from(20, 1),
            Err(BoundaryError::MemoryAccess { .. })
        ));
    }
}
