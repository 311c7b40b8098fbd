// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Renderer collaborators
//!
//! The renderer does not own guest memory, the VM run state, the display
//! frontend or the protocol engine that executes asynchronous update
//! requests. Each of those is reached through one of the traits below.
//!
//! | Trait                 | Called from        |
//! |-----------------------|--------------------|
//! | `GuestMemoryResolver` | any context        |
//! | `VmRunState`          | producer context   |
//! | `UpdateAreaBackend`   | producer context   |
//! | `DisplaySink`         | owning context     |

use std::sync::atomic::{AtomicBool, Ordering};

use vm_memory::{GuestAddress, GuestMemory, GuestMemoryMmap, VolatileSlice};

use super::cursor::CursorImage;
use super::dirty::Rect;
use super::surface::{HostSurface, MemSlotGroup};
use super::update::UpdateCookie;

bitflags::bitflags! {
    /// Display sink capabilities
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SinkFeatures: u32 {
        /// The sink can present a surface that aliases guest memory
        const SHARED_SURFACE = 1 << 0;
        /// The sink accepts custom cursor images
        const CURSOR_DEFINE = 1 << 1;
    }
}

impl Default for SinkFeatures {
    fn default() -> Self {
        SinkFeatures::SHARED_SURFACE | SinkFeatures::CURSOR_DEFINE
    }
}

/// Guest address translation.
///
/// Returns `None` while the address is not backed by a registered memory
/// slot; callers treat that as "not available yet".
pub trait GuestMemoryResolver: Send + Sync {
    fn resolve(&self, addr: GuestAddress, group: MemSlotGroup, len: usize)
        -> Option<VolatileSlice<'_>>;
}

impl GuestMemoryResolver for GuestMemoryMmap {
    fn resolve(
        &self,
        addr: GuestAddress,
        _group: MemSlotGroup,
        len: usize,
    ) -> Option<VolatileSlice<'_>> {
        self.get_slice(addr, len).ok()
    }
}

/// VM run state
pub trait VmRunState: Send + Sync {
    fn is_running(&self) -> bool;
}

impl VmRunState for AtomicBool {
    fn is_running(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

/// Protocol engine executing asynchronous update-area requests.
///
/// Fire and forget: the engine later hands the cookie back through
/// [`QxlRenderer::update_area_done`](super::QxlRenderer::update_area_done),
/// usually from its own thread.
pub trait UpdateAreaBackend: Send + Sync {
    fn update_area_async(&self, area: Rect, cookie: UpdateCookie);
}

/// Host display frontend. Only used from the owning context.
///
/// The renderer calls these methods with its state lock held. An
/// implementation must not call back into the `QxlRenderer` (for example
/// `cursor()` or `host_surface()`), that would deadlock; it gets the data it
/// needs through the arguments.
pub trait DisplaySink {
    fn features(&self) -> SinkFeatures {
        SinkFeatures::default()
    }

    /// The host surface was destroyed and recreated.
    fn replace_surface(&mut self, surface: &HostSurface);

    /// `rect` of `surface` holds new pixels.
    fn update_region(&mut self, surface: &HostSurface, rect: Rect);

    /// Shows `cursor` with its hotspot at `(x, y)`.
    fn publish_cursor(&mut self, cursor: &CursorImage, x: i32, y: i32);
}
