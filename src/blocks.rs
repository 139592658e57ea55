//! Sparse address ranges over the programmer memory image.

use std::ops::Range;
use std::slice::Iter;

/// A contiguous run of addresses
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct AddressRange {
    pub start: u16,
    pub count: u16,
}

impl AddressRange {
    pub fn new(start: u16, count: u16) -> Self {
        Self { start, count }
    }

    /// One past the last address, widened so a range ending at 0xFFFF does not wrap
    pub fn end(&self) -> u32 {
        self.start as u32 + self.count as u32
    }

    /// Buffer indices covered by this range
    pub fn indices(&self) -> Range<usize> {
        self.start as usize..self.end() as usize
    }

    /// Addresses covered by this range, in ascending order
    pub fn addresses(&self) -> impl Iterator<Item = u16> {
        (self.start as u32..self.end()).map(|a| a as u16)
    }

    /// Whether `[start, start + count)` shares any address with this range
    pub fn intersects(&self, start: u16, count: u16) -> bool {
        let other_end = start as u32 + count as u32;
        count != 0 && self.count != 0 && (start as u32) < self.end() && (self.start as u32) < other_end
    }
}

/// Ordered list of address ranges, in the order they were discovered.
///
/// Consumers must not assume the ranges are sorted.
#[derive(Clone, PartialEq, Eq, Debug, Default)]
pub struct BlockList {
    ranges: Vec<AddressRange>,
}

impl BlockList {
    pub fn new() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Append a new range and return it for extension
    pub fn append(&mut self, start: u16, count: u16) -> &mut AddressRange {
        self.ranges.push(AddressRange::new(start, count));
        let last = self.ranges.len() - 1;
        &mut self.ranges[last]
    }

    /// Most recently appended range
    pub fn last_mut(&mut self) -> Option<&mut AddressRange> {
        self.ranges.last_mut()
    }

    /// Total number of bytes covered by all ranges
    pub fn total_bytes(&self) -> usize {
        self.ranges.iter().map(|r| r.count as usize).sum()
    }

    pub fn overlaps(&self, start: u16, count: u16) -> bool {
        self.ranges.iter().any(|r| r.intersects(start, count))
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> Iter<'_, AddressRange> {
        self.ranges.iter()
    }
}

impl From<AddressRange> for BlockList {
    fn from(range: AddressRange) -> Self {
        Self { ranges: vec![range] }
    }
}

impl<'a> IntoIterator for &'a BlockList {
    type Item = &'a AddressRange;
    type IntoIter = Iter<'a, AddressRange>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}
