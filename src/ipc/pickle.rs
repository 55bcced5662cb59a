//! Primitive field serialization for IPC payloads.
//!
//! Every field starts on a 4-byte boundary and is stored little-endian.
//! Variable-length fields carry an `i32` length prefix: strings in bytes,
//! wide strings in UTF-16 code units, data in bytes. Readers are
//! bounds-checked against the payload and never read past its end.

use crate::error::PickleError;

const ALIGNMENT: usize = 4;

/// Size of the header every pickle starts with: the payload size.
pub const PICKLE_HEADER_SIZE: usize = 4;

fn align(len: usize) -> usize {
    len.next_multiple_of(ALIGNMENT)
}

/// A growable, field-aligned payload behind a fixed-size header.
///
/// The first four header bytes always hold the payload size; types built on
/// a pickle may reserve a larger header for their own fields.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Pickle {
    data: Vec<u8>,
    header_size: usize,
}

impl Default for Pickle {
    fn default() -> Self {
        Self::with_header_size(PICKLE_HEADER_SIZE)
    }
}

impl Pickle {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_header_size(header_size: usize) -> Self {
        debug_assert!(header_size >= PICKLE_HEADER_SIZE && header_size % ALIGNMENT == 0);

        Self {
            data: vec![0; header_size],
            header_size,
        }
    }

    /// Adopts a complete serialized pickle (header and payload).
    ///
    /// Returns `None` unless `data` is exactly one pickle with a
    /// `header_size` header.
    pub(crate) fn from_bytes(data: Vec<u8>, header_size: usize) -> Option<Self> {
        if Self::find_next(header_size, &data)? != data.len() {
            return None;
        }

        Some(Self { data, header_size })
    }

    /// End offset of the first complete pickle in `bytes`, if one is there.
    pub fn find_next(header_size: usize, bytes: &[u8]) -> Option<usize> {
        let payload_size = Self::declared_payload_size(bytes)?;
        if bytes.len() < header_size {
            return None;
        }

        let end = header_size.checked_add(payload_size)?;
        (end <= bytes.len()).then_some(end)
    }

    /// Payload size recorded in the header at the start of `bytes`.
    pub fn declared_payload_size(bytes: &[u8]) -> Option<usize> {
        let size: [u8; 4] = bytes.get(..PICKLE_HEADER_SIZE)?.try_into().ok()?;
        Some(u32::from_le_bytes(size) as usize)
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[self.header_size..]
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len() - self.header_size
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Header followed by payload, as sent on the wire.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn header(&self) -> &[u8] {
        &self.data[..self.header_size]
    }

    pub(crate) fn header_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.header_size]
    }

    pub fn reader(&self) -> PickleIterator<'_> {
        PickleIterator::new(self.payload())
    }

    pub fn write_bool(&mut self, value: bool) {
        self.write_i32(value as i32);
    }

    pub fn write_i32(&mut self, value: i32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u16(&mut self, value: u16) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_i64(&mut self, value: i64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_u64(&mut self, value: u64) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.write_bytes(&value.to_le_bytes());
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_data(value.as_bytes());
    }

    /// Writes `value` as UTF-16 code units.
    pub fn write_wide_string(&mut self, value: &str) {
        let units: Vec<u16> = value.encode_utf16().collect();
        self.write_i32(units.len() as i32);

        let bytes: Vec<u8> = units.iter().flat_map(|unit| unit.to_le_bytes()).collect();
        self.write_bytes(&bytes);
    }

    /// Writes a length-prefixed byte run.
    pub fn write_data(&mut self, data: &[u8]) {
        self.write_i32(data.len() as i32);
        self.write_bytes(data);
    }

    /// Appends `data` as-is, padded to the field alignment.
    pub fn write_bytes(&mut self, data: &[u8]) {
        self.data.extend_from_slice(data);
        self.data.resize(align(self.data.len()), 0);

        let payload_size = self.len() as u32;
        self.data[..PICKLE_HEADER_SIZE].copy_from_slice(&payload_size.to_le_bytes());
    }
}

/// Bounds-checked reader over a pickle payload.
#[derive(Clone, Debug)]
pub struct PickleIterator<'a> {
    payload: &'a [u8],
    position: usize,
}

impl<'a> PickleIterator<'a> {
    pub fn new(payload: &'a [u8]) -> Self {
        Self {
            payload,
            position: 0,
        }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.position
    }

    pub fn read_bool(&mut self) -> Result<bool, PickleError> {
        Ok(self.read_i32()? != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32, PickleError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u16(&mut self) -> Result<u16, PickleError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, PickleError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_i64(&mut self) -> Result<i64, PickleError> {
        Ok(i64::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, PickleError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32, PickleError> {
        Ok(f32::from_le_bytes(self.read_array()?))
    }

    pub fn read_string(&mut self) -> Result<String, PickleError> {
        let bytes = self.read_data()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PickleError::InvalidUtf8)
    }

    pub fn read_wide_string(&mut self) -> Result<String, PickleError> {
        let units = self.read_length()?;
        let wanted = units
            .checked_mul(2)
            .ok_or(PickleError::OutOfBounds {
                wanted: usize::MAX,
                remaining: self.remaining(),
            })?;

        let bytes = self.read_bytes(wanted)?;
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();

        String::from_utf16(&units).map_err(|_| PickleError::InvalidUtf16)
    }

    /// Reads a length-prefixed byte run.
    pub fn read_data(&mut self) -> Result<&'a [u8], PickleError> {
        let len = self.read_length()?;
        self.read_bytes(len)
    }

    /// Reads `len` raw bytes and skips their padding.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], PickleError> {
        let remaining = self.remaining();
        if len > remaining {
            return Err(PickleError::OutOfBounds {
                wanted: len,
                remaining,
            });
        }

        let start = self.position;
        self.position = (start + align(len)).min(self.payload.len());

        Ok(&self.payload[start..start + len])
    }

    fn read_length(&mut self) -> Result<usize, PickleError> {
        let len = self.read_i32()?;
        usize::try_from(len).map_err(|_| PickleError::NegativeLength)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], PickleError> {
        let bytes = self.read_bytes(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(bytes);
        Ok(array)
    }
}
