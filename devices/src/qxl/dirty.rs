// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Dirty Region Queue
//!
//! Holds the rectangles of the primary surface that changed since the last
//! composite. The queue is filled by the command layer and drained by the
//! renderer; both sides go through the renderer lock.

use log::debug;

/// Default dirty queue capacity (matches the QXL device dirty array)
pub const DEFAULT_DIRTY_CAPACITY: usize = 64;

/// Rectangle in surface coordinates, right/bottom exclusive
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    /// Queue terminator
    pub const EMPTY: Rect = Rect {
        left: 0,
        top: 0,
        right: 0,
        bottom: 0,
    };

    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Rectangle covering a whole `width` x `height` surface
    pub fn covering(width: u32, height: u32) -> Self {
        Self {
            left: 0,
            top: 0,
            right: i32::try_from(width).unwrap_or(i32::MAX),
            bottom: i32::try_from(height).unwrap_or(i32::MAX),
        }
    }

    /// A rectangle without area terminates the dirty queue.
    pub fn is_empty(&self) -> bool {
        self.left == self.right || self.top == self.bottom
    }

    pub fn width(&self) -> u32 {
        (i64::from(self.right) - i64::from(self.left)).clamp(0, i64::from(u32::MAX)) as u32
    }

    pub fn height(&self) -> u32 {
        (i64::from(self.bottom) - i64::from(self.top)).clamp(0, i64::from(u32::MAX)) as u32
    }

    /// Checks `0 <= left <= right <= width` and `0 <= top <= bottom <= height`.
    pub fn fits(&self, width: u32, height: u32) -> bool {
        self.left >= 0
            && self.top >= 0
            && self.left <= self.right
            && self.top <= self.bottom
            && i64::from(self.right) <= i64::from(width)
            && i64::from(self.bottom) <= i64::from(height)
    }
}

/// Fixed-capacity queue of dirty rectangles
#[derive(Debug, Clone)]
pub struct DirtyQueue {
    rects: Vec<Rect>,
    capacity: usize,
}

impl Default for DirtyQueue {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DIRTY_CAPACITY)
    }
}

impl DirtyQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            rects: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of queued entries (terminators included)
    pub fn len(&self) -> usize {
        self.rects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rects.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.rects.len() >= self.capacity
    }

    /// Appends a rectangle. Returns false when the queue is full.
    pub fn push(&mut self, rect: Rect) -> bool {
        if self.is_full() {
            return false;
        }
        self.rects.push(rect);
        true
    }

    /// Replaces the queue content, keeping at most `capacity` entries.
    /// Returns the number of entries that did not fit.
    pub fn replace(&mut self, rects: &[Rect]) -> usize {
        self.rects.clear();
        let kept = rects.len().min(self.capacity);
        self.rects.extend_from_slice(&rects[..kept]);
        rects.len() - kept
    }

    /// Resets the queue to one rectangle covering the whole surface.
    pub fn reset_to_full(&mut self, width: u32, height: u32) {
        self.rects.clear();
        self.rects.push(Rect::covering(width, height));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Rect> {
        self.rects.iter()
    }

    /// Drains the queue in insertion order, stopping at the first empty
    /// rectangle and skipping rectangles that do not fit a `width` x `height`
    /// surface. The queue is empty afterwards even if the iterator is not
    /// fully consumed.
    pub fn drain_valid(&mut self, width: u32, height: u32) -> impl Iterator<Item = Rect> + '_ {
        self.rects
            .drain(..)
            .take_while(|rect| !rect.is_empty())
            .filter(move |rect| {
                let fits = rect.fits(width, height);
                if !fits {
                    debug!("Dropping dirty rect {rect:?} outside {width}x{height} surface");
                }
                fits
            })
    }
}
