// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Asynchronous update bookkeeping
//!
//! A render trigger that runs while the guest is active does not drain the
//! dirty queue itself. It hands an [`UpdateCookie`] to the protocol engine,
//! and the engine returns the cookie when the update has been applied. The
//! completion then schedules a [`DeferredWork::UpdateArea`] on the owning
//! context, which performs the actual drain.

use std::sync::atomic::{AtomicU64, Ordering};

use super::dirty::Rect;

static NEXT_COOKIE_ID: AtomicU64 = AtomicU64::new(1);

/// Kind of asynchronous request a cookie belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CookieKind {
    /// Whole-surface render update
    RenderUpdateArea,
}

/// Completion token for one asynchronous update request.
///
/// Cookies cannot be cloned: handing one back to the renderer consumes it,
/// so every request completes at most once.
#[derive(Debug, PartialEq, Eq)]
pub struct UpdateCookie {
    id: u64,
    kind: CookieKind,
    area: Rect,
}

impl UpdateCookie {
    pub(crate) fn render_update_area(area: Rect) -> Self {
        Self {
            id: NEXT_COOKIE_ID.fetch_add(1, Ordering::Relaxed),
            kind: CookieKind::RenderUpdateArea,
            area,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> CookieKind {
        self.kind
    }

    /// Area requested when the cookie was issued
    pub fn area(&self) -> Rect {
        self.area
    }
}

/// Work scheduled on the owning context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferredWork {
    /// Drain the dirty queue into the host surface
    UpdateArea,
    /// Publish the active cursor image and position
    Cursor,
}

/// Number of update requests issued but not completed yet
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingUpdates(u32);

impl PendingUpdates {
    pub fn count(&self) -> u32 {
        self.0
    }

    pub fn issue(&mut self) {
        self.0 = self.0.saturating_add(1);
    }

    /// Returns false when nothing was outstanding.
    pub fn complete(&mut self) -> bool {
        match self.0.checked_sub(1) {
            Some(count) => {
                self.0 = count;
                true
            }
            None => false,
        }
    }
}
