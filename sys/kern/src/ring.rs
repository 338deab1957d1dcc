// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bounded circular byte queue of fixed-size elements.
//!
//! Backing storage is a static-size byte array; a ring configured for
//! `depth` elements of `element_size` bytes uses the first
//! `depth * element_size` of it. Elements are copied in and out whole —
//! exact byte copies of the configured element size, no terminators, no
//! lengths.
//!
//! `head` is the next slot to write on a normal (FIFO) append; `tail` is the
//! next slot to read. An urgent append retreats `tail` instead, so the
//! element jumps the line.

use abi::QUEUE_STORAGE_BYTES;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RingError {
    /// `depth * element_size` does not fit the backing storage, or one of
    /// them is zero.
    Oversize,
    /// The ring is full; the write was refused rather than clobbering
    /// unread data.
    PreventedOverwrite,
    /// The ring is empty.
    NoElement,
}

impl RingError {
    pub const fn reason(self) -> u32 {
        match self {
            RingError::Oversize => 1,
            RingError::PreventedOverwrite => 2,
            RingError::NoElement => 3,
        }
    }
}

pub struct Ring {
    storage: [u8; QUEUE_STORAGE_BYTES],
    depth: usize,
    element_size: usize,
    /// Producer slot index: next normal append goes here.
    head: usize,
    /// Consumer slot index: next read comes from here.
    tail: usize,
    len: usize,
}

impl Ring {
    pub fn new(depth: usize, element_size: usize) -> Result<Self, RingError> {
        if depth == 0 || element_size == 0 {
            return Err(RingError::Oversize);
        }
        if depth.checked_mul(element_size).is_none()
            || depth * element_size > QUEUE_STORAGE_BYTES
        {
            return Err(RingError::Oversize);
        }
        Ok(Self {
            storage: [0; QUEUE_STORAGE_BYTES],
            depth,
            element_size,
            head: 0,
            tail: 0,
            len: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.depth
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    fn slot_mut(&mut self, index: usize) -> &mut [u8] {
        let offset = index * self.element_size;
        &mut self.storage[offset..offset + self.element_size]
    }

    fn slot(&self, index: usize) -> &[u8] {
        let offset = index * self.element_size;
        &self.storage[offset..offset + self.element_size]
    }

    /// FIFO append: the element is delivered after everything already
    /// queued.
    pub fn push_back(&mut self, element: &[u8]) -> Result<(), RingError> {
        uassert_eq!(element.len(), self.element_size);
        if self.is_full() {
            return Err(RingError::PreventedOverwrite);
        }
        let slot = self.head;
        self.slot_mut(slot).copy_from_slice(element);
        self.head = (self.head + 1) % self.depth;
        self.len += 1;
        Ok(())
    }

    /// Urgent append: the element is delivered before everything already
    /// queued, by retreating the consumer index.
    pub fn push_front(&mut self, element: &[u8]) -> Result<(), RingError> {
        uassert_eq!(element.len(), self.element_size);
        if self.is_full() {
            return Err(RingError::PreventedOverwrite);
        }
        self.tail = (self.tail + self.depth - 1) % self.depth;
        let slot = self.tail;
        self.slot_mut(slot).copy_from_slice(element);
        self.len += 1;
        Ok(())
    }

    /// Copies the oldest element out and advances past it.
    pub fn read(&mut self, out: &mut [u8]) -> Result<(), RingError> {
        uassert_eq!(out.len(), self.element_size);
        if self.is_empty() {
            return Err(RingError::NoElement);
        }
        out.copy_from_slice(self.slot(self.tail));
        self.tail = (self.tail + 1) % self.depth;
        self.len -= 1;
        Ok(())
    }

    /// Copies the oldest element out without consuming it.
    pub fn peek(&self, out: &mut [u8]) -> Result<(), RingError> {
        uassert_eq!(out.len(), self.element_size);
        if self.is_empty() {
            return Err(RingError::NoElement);
        }
        out.copy_from_slice(self.slot(self.tail));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversize_configurations_are_refused() {
        assert!(Ring::new(0, 4).is_err());
        assert!(Ring::new(4, 0).is_err());
        assert!(Ring::new(QUEUE_STORAGE_BYTES + 1, 1).is_err());
        assert!(Ring::new(8, 4).is_ok());
    }

    #[test]
    fn fifo_round_trip_returns_identical_bytes() {
        // Push/read pairs across several element sizes and enough volume to
        // wrap the ring repeatedly.
        for element_size in [1usize, 4, 8] {
            let mut ring = Ring::new(4, element_size).unwrap();
            for i in 0..32u8 {
                let pattern: std::vec::Vec<u8> =
                    (0..element_size).map(|b| i.wrapping_add(b as u8)).collect();
                ring.push_back(&pattern).unwrap();
                let mut out = std::vec![0u8; element_size];
                ring.read(&mut out).unwrap();
                assert_eq!(out, pattern);
            }
        }
    }

    #[test]
    fn fifo_order_is_preserved() {
        let mut ring = Ring::new(4, 4).unwrap();
        for i in 1..=4u32 {
            ring.push_back(&i.to_le_bytes()).unwrap();
        }
        for i in 1..=4u32 {
            let mut out = [0u8; 4];
            ring.read(&mut out).unwrap();
            assert_eq!(u32::from_le_bytes(out), i);
        }
    }

    #[test]
    fn full_ring_refuses_overwrite() {
        let mut ring = Ring::new(2, 4).unwrap();
        ring.push_back(&10u32.to_le_bytes()).unwrap();
        ring.push_back(&11u32.to_le_bytes()).unwrap();
        assert_eq!(
            ring.push_back(&12u32.to_le_bytes()),
            Err(RingError::PreventedOverwrite)
        );
        assert_eq!(
            ring.push_front(&12u32.to_le_bytes()),
            Err(RingError::PreventedOverwrite)
        );
        // Draining one slot makes room again.
        let mut out = [0u8; 4];
        ring.read(&mut out).unwrap();
        assert_eq!(ring.push_back(&12u32.to_le_bytes()), Ok(()));
    }

    #[test]
    fn urgent_push_jumps_the_line() {
        let mut ring = Ring::new(4, 4).unwrap();
        ring.push_back(&1u32.to_le_bytes()).unwrap();
        ring.push_back(&2u32.to_le_bytes()).unwrap();
        ring.push_front(&9u32.to_le_bytes()).unwrap();

        let mut out = [0u8; 4];
        ring.read(&mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 9);
        ring.read(&mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 1);
        ring.read(&mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 2);
    }

    #[test]
    fn peek_does_not_consume() {
        let mut ring = Ring::new(2, 4).unwrap();
        ring.push_back(&7u32.to_le_bytes()).unwrap();
        let mut out = [0u8; 4];
        ring.peek(&mut out).unwrap();
        assert_eq!(u32::from_le_bytes(out), 7);
        assert_eq!(ring.len(), 1);
        ring.read(&mut out).unwrap();
        assert_eq!(ring.len(), 0);
        assert_eq!(ring.peek(&mut out), Err(RingError::NoElement));
    }

    #[test]
    fn empty_read_reports_no_element() {
        let mut ring = Ring::new(2, 2).unwrap();
        let mut out = [0u8; 2];
        assert_eq!(ring.read(&mut out), Err(RingError::NoElement));
    }
}
