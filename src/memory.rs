use bytesize::ByteSize;
use std::ops::{Index, IndexMut};

/// Sparse memory that only materializes segments once they are written.
///
/// Unwritten locations read as `T::default()`, which for test data is the
/// initial-state write id.
#[derive(Debug, Clone)]
pub struct VirtualMemory<T> {
    memory_size: usize,
    segment_mask: usize,
    segment_shift: u32,
    default: T,
    data: Vec<Vec<T>>,
}

impl<T: Copy + Default> Index<usize> for VirtualMemory<T> {
    type Output = T;
    fn index(&self, index: usize) -> &Self::Output {
        let segment_index = index >> self.segment_shift;
        let segment_offset = index & self.segment_mask;
        if self.data[segment_index].is_empty() {
            return &self.default;
        }
        Index::index(&self.data[segment_index], segment_offset)
    }
}

impl<T: Copy + Default> IndexMut<usize> for VirtualMemory<T> {
    fn index_mut(&mut self, index: usize) -> &mut Self::Output {
        let segment_index = index >> self.segment_shift;
        let segment_offset = index & self.segment_mask;
        if self.data[segment_index].is_empty() {
            self.data[segment_index] = vec![T::default(); self.segment_mask + 1];
        }
        IndexMut::index_mut(&mut self.data[segment_index], segment_offset)
    }
}

impl<T: Copy + Default> VirtualMemory<T> {
    pub fn new(memory_size: usize, segment_size: usize) -> Self {
        assert!(
            memory_size % segment_size == 0,
            "memory size must be multiple of segment size"
        );
        assert!(
            segment_size.is_power_of_two(),
            "segment size must be a power of two"
        );
        let segment_mask = segment_size - 1;
        let segment_shift = segment_size.trailing_zeros();
        let segments = memory_size / segment_size;
        Self {
            memory_size,
            segment_mask,
            segment_shift,
            default: T::default(),
            data: vec![[].to_vec(); segments],
        }
    }

    pub fn size(&self) -> usize {
        self.memory_size
    }

    /// True if `len` locations starting at `index` lie inside the memory.
    pub fn contains(&self, index: usize, len: usize) -> bool {
        index
            .checked_add(len)
            .map_or(false, |end| end <= self.memory_size)
    }

    /// Drops all written segments, restoring default values everywhere.
    pub fn clear(&mut self) {
        self.data.iter_mut().for_each(Vec::clear);
    }

    pub fn allocated(&self) -> ByteSize {
        ByteSize::b(
            self.data
                .iter()
                .filter(|x| !x.is_empty())
                .fold(0, |acc, _| acc + (self.segment_mask as u64) + 1),
        )
    }
}
