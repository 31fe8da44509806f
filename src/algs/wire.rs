//! Fixed little-endian wire types for plan construction.

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;
use std::mem::{align_of, size_of};

pub fn cast_slice<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

pub fn cast_slice_mut<T: Pod>(v: &mut [T]) -> &mut [u8] {
    bytemuck::cast_slice_mut(v)
}

/// Decode a received byte buffer into owned records.
///
/// Unlike `bytemuck::cast_slice` this never fails on alignment; a length that
/// is not a multiple of `size_of::<T>()` is reported as an error.
pub fn decode_records<T: Pod>(bytes: &[u8]) -> Result<Vec<T>, String> {
    let sz = size_of::<T>();
    if sz == 0 || bytes.len() % sz != 0 {
        return Err(format!(
            "payload of {} bytes is not a whole number of {sz}-byte records",
            bytes.len()
        ));
    }
    Ok(bytemuck::pod_collect_to_vec(bytes))
}

// All multi-byte integers in these structs are **little-endian** on the wire.
// We store them pre-LE with `.to_le()` and decode with `.from_le()`.

#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireCount {
    pub n_le: u32, // count of following records
}
impl WireCount {
    pub fn new(n: usize) -> Self {
        Self {
            n_le: (n as u32).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u32::from_le(self.n_le) as usize
    }
}

/// One requested movement: element `x` of the source array goes to element
/// `y` of the destination array (both global, block-start offsets).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireEntry {
    pub x_le: u64,
    pub y_le: u64,
}
impl WireEntry {
    pub fn new(x: usize, y: usize) -> Self {
        Self {
            x_le: (x as u64).to_le(),
            y_le: (y as u64).to_le(),
        }
    }
    pub fn x(&self) -> usize {
        u64::from_le(self.x_le) as usize
    }
    pub fn y(&self) -> usize {
        u64::from_le(self.y_le) as usize
    }
}

/// A single slot index; used to tell a receiver where incoming values land.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct WireIndex {
    pub i_le: u64,
}
impl WireIndex {
    pub fn of(i: usize) -> Self {
        Self {
            i_le: (i as u64).to_le(),
        }
    }
    pub fn get(&self) -> usize {
        u64::from_le(self.i_le) as usize
    }
}

const_assert_eq!(size_of::<WireCount>(), 4);
const_assert_eq!(size_of::<WireEntry>(), 16);
const_assert_eq!(size_of::<WireIndex>(), 8);
const_assert_eq!(align_of::<WireEntry>(), 8);
