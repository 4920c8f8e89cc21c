// SPDX-License-Identifier: MIT OR Apache-2.0

//! Byte-slice helpers shared by the packet views.

/// Copies `T` bytes out of `bytes` starting at `start`, or `None` if the
/// slice is too short.
#[inline]
pub(crate) fn to_array<const T: usize>(bytes: &[u8], start: usize) -> Option<[u8; T]> {
    Some(*get_array(bytes, start)?)
}

#[inline]
pub(crate) fn get_array<const T: usize>(bytes: &[u8], start: usize) -> Option<&[u8; T]> {
    bytes.get(start..start + T)?.try_into().ok()
}

/// Rounds `unpadded_len` up to the next multiple of `T`.
#[inline]
pub(crate) fn padded_length<const T: usize>(unpadded_len: usize) -> usize {
    unpadded_len + ((T - (unpadded_len % T)) % T)
}
