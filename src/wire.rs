//! State Wire Framing
//!
//! Little-endian datagram encoding for render states: a table of canonical
//! attributes (each a kind name plus the kind's own payload), then per
//! state a `u16` attribute count followed by `(attribute id, i32
//! override)` pairs.
//!
//! The reader rebuilds each attribute through its registered read factory
//! and then substitutes every provisional state with the interner's
//! canonical representative, so a decoded state is address-equal to the
//! equivalent state built directly.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::attrib::{registry, AttribRef};
use crate::errors::{Result, SagaError};
use crate::state::{RenderState, StateRef};

// ─── Datagram ────────────────────────────────────────────────────────────────

/// Append-only little-endian byte buffer.
#[derive(Debug, Default, Clone)]
pub struct Datagram {
    data: Vec<u8>,
}

impl Datagram {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn add_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_i32(&mut self, value: i32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn add_f32(&mut self, value: f32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Length-prefixed (`u16`) UTF-8 string.
    pub fn add_string(&mut self, value: &str) {
        debug_assert!(value.len() <= usize::from(u16::MAX));
        self.add_u16(value.len() as u16);
        self.data.extend_from_slice(value.as_bytes());
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Cursor over a datagram's bytes.
pub struct DatagramIterator<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DatagramIterator<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8]> {
        if self.pos + count > self.data.len() {
            return Err(SagaError::DatagramUnderflow(self.pos));
        }
        let data = self.data;
        let bytes = &data[self.pos..self.pos + count];
        self.pos += count;
        Ok(bytes)
    }

    pub fn get_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    pub fn get_string(&mut self) -> Result<String> {
        let len = usize::from(self.get_u16()?);
        Ok(String::from_utf8(self.take(len)?.to_vec())?)
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

// ─── State Encoding ──────────────────────────────────────────────────────────

/// Encodes a batch of states. Attributes shared between states are written
/// once and referenced by id.
#[must_use]
pub fn write_states(states: &[StateRef]) -> Datagram {
    let mut attrib_ids: FxHashMap<usize, u16> = FxHashMap::default();
    let mut attribs: Vec<AttribRef> = Vec::new();

    for state in states {
        for slot in state.filled_slots().iter() {
            if let Some(attrib) = state.get_attrib(slot) {
                let addr = Arc::as_ptr(attrib).cast::<()>() as usize;
                attrib_ids.entry(addr).or_insert_with(|| {
                    let id = attribs.len() as u16;
                    attribs.push(attrib.clone());
                    id
                });
            }
        }
    }

    let mut dg = Datagram::new();

    dg.add_u16(attribs.len() as u16);
    for attrib in &attribs {
        dg.add_string(attrib.kind_name());
        attrib.write_datagram(&mut dg);
    }

    dg.add_u16(states.len() as u16);
    for state in states {
        dg.add_u16(state.num_attribs() as u16);
        for slot in state.filled_slots().iter() {
            if let Some(entry) = state.get_entry(slot) {
                let addr = Arc::as_ptr(&entry.attrib).cast::<()>() as usize;
                dg.add_u16(attrib_ids[&addr]);
                dg.add_i32(entry.priority);
            }
        }
    }

    dg
}

/// Decodes a batch of states, canonicalizing each through the interner.
pub fn read_states(di: &mut DatagramIterator<'_>) -> Result<Vec<StateRef>> {
    let num_attribs = usize::from(di.get_u16()?);
    let mut attribs: Vec<AttribRef> = Vec::with_capacity(num_attribs);
    for _ in 0..num_attribs {
        let kind_name = di.get_string()?;
        let factory = registry::factory_for(&kind_name)
            .ok_or(SagaError::UnknownAttribKind(kind_name))?;
        attribs.push(factory(di)?);
    }

    let num_states = usize::from(di.get_u16()?);
    let mut states = Vec::with_capacity(num_states);
    for _ in 0..num_states {
        let count = usize::from(di.get_u16()?);
        let mut entries: Vec<(AttribRef, i32)> = Vec::with_capacity(count);
        for _ in 0..count {
            let id = usize::from(di.get_u16()?);
            let attrib = attribs
                .get(id)
                .ok_or_else(|| {
                    SagaError::MalformedDatagram(format!("attribute id {id} out of range"))
                })?
                .clone();
            let priority = di.get_i32()?;
            entries.push((attrib, priority));
        }
        // The provisional state is swapped for the interner's canonical
        // representative inside make_entries.
        states.push(RenderState::make_entries(&entries));
    }

    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_round_trip() {
        let mut dg = Datagram::new();
        dg.add_u8(7);
        dg.add_u16(513);
        dg.add_i32(-42);
        dg.add_f32(1.5);
        dg.add_string("opaque");

        let mut di = DatagramIterator::new(dg.as_bytes());
        assert_eq!(di.get_u8().unwrap(), 7);
        assert_eq!(di.get_u16().unwrap(), 513);
        assert_eq!(di.get_i32().unwrap(), -42);
        assert!((di.get_f32().unwrap() - 1.5).abs() < f32::EPSILON);
        assert_eq!(di.get_string().unwrap(), "opaque");
        assert_eq!(di.remaining(), 0);
    }

    #[test]
    fn underflow_is_reported() {
        let mut di = DatagramIterator::new(&[1]);
        assert!(di.get_u32().is_err());
    }
}
