// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! QXL framebuffer compositor
//!
//! Mirrors the guest primary surface of a paravirtual QXL display into a
//! host-visible surface and converts guest cursor shapes into a canonical
//! 32-bit image.
//!
//! # Architecture
//!
//! ```text
//!  producer context              completion context
//!  (guest activity)              (protocol engine)
//!        │                              │
//!        │ resize / push_dirty          │ update_area_done(cookie)
//!        │ render_update                │
//!        │ render_cursor                │
//!        ▼                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      QxlRenderer                            │
//! │  Mutex<RenderState>                                         │
//! │   - guest primary surface + host surface                    │
//! │   - dirty queue                                             │
//! │   - pending update counter                                  │
//! │   - active cursor + position                                │
//! └─────────────────────────────────────────────────────────────┘
//!        │ update_area_async(area, cookie)     │ DeferredWork
//!        ▼                                     ▼ (flume channel)
//! ┌──────────────────┐              ┌──────────────────────────┐
//! │ UpdateAreaBackend│              │ owning context           │
//! └──────────────────┘              │ process_deferred(sink)   │
//!                                   │  - drain + blit          │
//!                                   │  - publish cursor        │
//!                                   └──────────────────────────┘
//!                                              │
//!                                              ▼
//!                                        DisplaySink
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let renderer = QxlRenderer::new(config, sink.features(), memory, vm, backend)?;
//! renderer.resize(create);
//! renderer.push_dirty(Rect::new(0, 0, 64, 64))?;
//! renderer.render_update(&mut sink);
//! renderer.process_deferred(&mut sink);
//! ```

mod backend;
mod blit;
mod cursor;
mod dirty;
mod renderer;
mod surface;
mod update;

pub use backend::{DisplaySink, GuestMemoryResolver, SinkFeatures, UpdateAreaBackend, VmRunState};
pub use blit::blit;
pub use cursor::{
    ALPHA_OPAQUE_THRESHOLD, CURSOR_HEADER_SIZE, CursorConverter, CursorError, CursorHeader,
    CursorImage, CursorSource, CursorType, DEFAULT_MAX_CURSOR_DIMENSION, mono_bytes_per_line,
};
pub use dirty::{DEFAULT_DIRTY_CAPACITY, DirtyQueue, Rect};
pub use renderer::{CursorCommand, Position, QxlRenderer, RenderConfig};
pub use surface::{
    GuestPrimary, HostPixelFormat, HostSurface, MemSlotGroup, SurfaceBacking, SurfaceCreate,
    SurfaceFormat,
};
pub use update::{CookieKind, DeferredWork, PendingUpdates, UpdateCookie};

/// Result type for renderer operations.
pub type Result<T> = std::result::Result<T, QxlRenderError>;

/// Renderer errors.
///
/// None of these are fatal: the operation that hit one is skipped and the
/// renderer state stays consistent.
#[derive(Debug, thiserror::Error)]
pub enum QxlRenderError {
    /// The renderer configuration is invalid.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A guest address is not backed by a memory slot (yet).
    #[error("Guest address {0:#x} is not mapped")]
    UnresolvedAddress(u64),

    /// The cursor shape payload spans more than one chunk.
    #[error("Cursor shape split in chunks: first chunk {chunk} of {total} bytes")]
    MultipleChunks { chunk: u32, total: u32 },

    /// The cursor shape could not be decoded.
    #[error("Invalid cursor: {0}")]
    InvalidCursor(#[from] CursorError),

    #[error("Dirty queue full ({0} entries)")]
    DirtyQueueFull(usize),

    /// A guest row lies outside the mapped surface.
    #[error("Source row at {offset} ({len} bytes) out of bounds")]
    SourceOutOfBounds { offset: i64, len: usize },

    /// A host row lies outside the host surface.
    #[error("Destination row at {offset} ({len} bytes) out of bounds")]
    DestinationOutOfBounds { offset: i64, len: usize },
}
