// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! QXL renderer
//!
//! Ties the surface state, the dirty queue, the blitter, the asynchronous
//! update bookkeeping and the cursor converter together behind one lock.
//!
//! The whole drain, including the pixel copy, runs with the state lock
//! held. This serializes drains on the surface at the cost of blocking
//! producers for the duration of the copy.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, error, trace, warn};
use serde::{Deserialize, Serialize};
use vm_memory::{GuestAddress, VolatileSlice};

use super::backend::{
    DisplaySink, GuestMemoryResolver, SinkFeatures, UpdateAreaBackend, VmRunState,
};
use super::blit::blit;
use super::cursor::{
    CURSOR_HEADER_SIZE, CursorConverter, CursorHeader, CursorImage,
    DEFAULT_MAX_CURSOR_DIMENSION, mono_bytes_per_line,
};
use super::dirty::{DEFAULT_DIRTY_CAPACITY, DirtyQueue, Rect};
use super::surface::{GuestPrimary, HostSurface, MemSlotGroup, SurfaceCreate};
use super::update::{DeferredWork, PendingUpdates, UpdateCookie};
use super::{QxlRenderError, Result};

/// Renderer configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    /// Maximum number of queued dirty rectangles
    pub dirty_queue_capacity: usize,
    /// Let the host surface alias guest memory for top-down surfaces
    pub zero_copy: bool,
    /// Largest accepted cursor width or height
    pub max_cursor_dimension: u32,
    /// Device debug level. Above 1 cursor commands are logged, above 2
    /// decoded cursors are dumped.
    pub debug_level: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            dirty_queue_capacity: DEFAULT_DIRTY_CAPACITY,
            zero_copy: true,
            max_cursor_dimension: DEFAULT_MAX_CURSOR_DIMENSION,
            debug_level: 0,
        }
    }
}

impl RenderConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.dirty_queue_capacity == 0 {
            return Err("dirty_queue_capacity must be at least 1".to_string());
        }
        if self.max_cursor_dimension == 0 || self.max_cursor_dimension > u32::from(u16::MAX) {
            return Err(format!(
                "max_cursor_dimension must be between 1 and {}",
                u16::MAX
            ));
        }
        Ok(())
    }

    /// Largest cursor payload accepted from the guest
    fn max_cursor_payload(&self) -> usize {
        let dim = self.max_cursor_dimension as usize;
        let mask = mono_bytes_per_line(self.max_cursor_dimension) * dim;
        dim * dim * 4 + mask
    }
}

/// Cursor position in guest display coordinates
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// Guest cursor command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorCommand {
    /// New cursor shape at `shape`, shown at `position`
    Set {
        position: Position,
        visible: bool,
        shape: GuestAddress,
    },
    Move {
        position: Position,
    },
    Hide,
    Trail {
        length: u16,
        frequency: u16,
    },
}

/// State guarded by the renderer lock
#[derive(Debug)]
struct RenderState {
    primary: GuestPrimary,
    dirty: DirtyQueue,
    host_surface: Option<HostSurface>,
    /// Guest issued draw commands since the last asynchronous request
    guest_commands: bool,
    pending: PendingUpdates,
    cursor: Option<CursorImage>,
    mouse: Position,
}

/// Guest framebuffer compositor and cursor converter
pub struct QxlRenderer {
    config: RenderConfig,
    features: SinkFeatures,
    converter: CursorConverter,
    state: Mutex<RenderState>,
    memory: Arc<dyn GuestMemoryResolver>,
    vm: Arc<dyn VmRunState>,
    backend: Arc<dyn UpdateAreaBackend>,
    deferred_tx: flume::Sender<DeferredWork>,
    deferred_rx: flume::Receiver<DeferredWork>,
    /// A `DeferredWork::Cursor` is queued and not run yet
    cursor_scheduled: AtomicBool,
}

impl QxlRenderer {
    pub fn new(
        config: RenderConfig,
        features: SinkFeatures,
        memory: Arc<dyn GuestMemoryResolver>,
        vm: Arc<dyn VmRunState>,
        backend: Arc<dyn UpdateAreaBackend>,
    ) -> Result<Self> {
        config.validate().map_err(QxlRenderError::InvalidConfig)?;

        let (deferred_tx, deferred_rx) = flume::unbounded();
        let state = RenderState {
            primary: GuestPrimary::default(),
            dirty: DirtyQueue::with_capacity(config.dirty_queue_capacity),
            host_surface: None,
            guest_commands: false,
            pending: PendingUpdates::default(),
            cursor: None,
            mouse: Position::default(),
        };

        Ok(Self {
            converter: CursorConverter::new(config.max_cursor_dimension),
            config,
            features,
            state: Mutex::new(state),
            memory,
            vm,
            backend,
            deferred_tx,
            deferred_rx,
            cursor_scheduled: AtomicBool::new(false),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, RenderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule(&self, work: DeferredWork) -> bool {
        if let Err(e) = self.deferred_tx.send(work) {
            error!("Failed to schedule {work:?}: {e}");
            return false;
        }
        true
    }

    /// Queues a cursor publish unless one is already queued. The publish
    /// reads the latest image and position when it runs.
    fn schedule_cursor(&self) {
        if !self.cursor_scheduled.swap(true, Ordering::AcqRel)
            && !self.schedule(DeferredWork::Cursor)
        {
            self.cursor_scheduled.store(false, Ordering::Release);
        }
    }

    fn resolve(&self, addr: GuestAddress, group: MemSlotGroup, len: usize) -> Option<VolatileSlice<'_>> {
        self.memory.resolve(addr, group, len)
    }

    fn read_guest(&self, addr: GuestAddress, group: MemSlotGroup, len: usize) -> Result<Vec<u8>> {
        let slice = self
            .resolve(addr, group, len)
            .filter(|slice| slice.len() >= len)
            .ok_or(QxlRenderError::UnresolvedAddress(addr.0))?;
        let mut buf = vec![0u8; len];
        slice.copy_to(&mut buf[..]);
        Ok(buf)
    }

    // ========================================================================
    // Surface and dirty queue
    // ========================================================================

    /// Records a new guest primary surface. The host surface is recreated by
    /// the next drain.
    pub fn resize(&self, surface: SurfaceCreate) {
        debug!(
            "Resize {}x{} stride {} format {:#x}",
            surface.width, surface.height, surface.stride, surface.format
        );
        self.lock_state().primary.resize(surface);
    }

    /// Queues one dirty rectangle.
    pub fn push_dirty(&self, rect: Rect) -> Result<()> {
        let mut state = self.lock_state();
        if !state.dirty.push(rect) {
            return Err(QxlRenderError::DirtyQueueFull(state.dirty.capacity()));
        }
        Ok(())
    }

    /// Replaces the dirty queue content.
    pub fn set_dirty(&self, rects: &[Rect]) {
        let dropped = self.lock_state().dirty.replace(rects);
        if dropped > 0 {
            warn!("Dirty queue full, dropped {dropped} rectangles");
        }
    }

    /// The guest issued draw commands since the last render trigger.
    pub fn note_guest_commands(&self) {
        self.lock_state().guest_commands = true;
    }

    pub fn dirty_len(&self) -> usize {
        self.lock_state().dirty.len()
    }

    /// Snapshot of the current host surface
    pub fn host_surface(&self) -> Option<HostSurface> {
        self.lock_state().host_surface.clone()
    }

    /// Whether a resize is waiting for its host surface
    pub fn resize_pending(&self) -> bool {
        self.lock_state().primary.needs_recreate()
    }

    // ========================================================================
    // Render triggers
    // ========================================================================

    /// Render trigger.
    ///
    /// Drains synchronously while the VM is paused or the guest has no
    /// outstanding draw commands. Otherwise issues one asynchronous update
    /// request covering the whole surface and returns; the drain happens
    /// once the request completes.
    pub fn render_update(&self, sink: &mut dyn DisplaySink) {
        let mut state = self.lock_state();

        if !self.vm.is_running() || !state.guest_commands {
            self.update_area_locked(&mut state, sink);
            return;
        }

        state.guest_commands = false;
        state.pending.issue();
        let area = state.primary.full_rect();
        let outstanding = state.pending.count();
        drop(state);

        let cookie = UpdateCookie::render_update_area(area);
        debug!(
            "Issuing update request {} for {area:?}, {outstanding} outstanding",
            cookie.id()
        );
        self.backend.update_area_async(area, cookie);
    }

    /// Completion of an asynchronous update request. Called from the
    /// protocol engine's context; the drain itself is deferred.
    pub fn update_area_done(&self, cookie: UpdateCookie) {
        let mut state = self.lock_state();
        if !state.pending.complete() {
            warn!("Update request {} completed with none outstanding", cookie.id());
        }
        let current = state.primary.full_rect();
        if cookie.area() != current {
            debug!(
                "Update request {} covered {:?}, surface is now {current:?}",
                cookie.id(),
                cookie.area()
            );
        }
        self.schedule(DeferredWork::UpdateArea);
        drop(state);
        trace!("Update request {} released", cookie.id());
        drop(cookie);
    }

    /// Number of asynchronous update requests not completed yet
    pub fn pending_updates(&self) -> u32 {
        self.lock_state().pending.count()
    }

    // ========================================================================
    // Deferred work
    // ========================================================================

    /// Receiver for work that must run on the owning context
    pub fn deferred_receiver(&self) -> flume::Receiver<DeferredWork> {
        self.deferred_rx.clone()
    }

    /// Runs one deferred work item. Owning context only.
    pub fn run_deferred(&self, work: DeferredWork, sink: &mut dyn DisplaySink) {
        if work == DeferredWork::Cursor {
            self.cursor_scheduled.store(false, Ordering::Release);
        }
        let mut state = self.lock_state();
        match work {
            DeferredWork::UpdateArea => self.update_area_locked(&mut state, sink),
            DeferredWork::Cursor => match &state.cursor {
                Some(cursor) => sink.publish_cursor(cursor, state.mouse.x, state.mouse.y),
                None => trace!("No cursor defined, skipping publish"),
            },
        }
    }

    /// Runs every queued deferred work item and returns how many ran.
    pub fn process_deferred(&self, sink: &mut dyn DisplaySink) -> usize {
        let mut count = 0;
        for work in self.deferred_rx.try_iter() {
            self.run_deferred(work, sink);
            count += 1;
        }
        count
    }

    /// Drains the dirty queue into the host surface, recreating it first
    /// after a resize.
    fn update_area_locked(&self, state: &mut RenderState, sink: &mut dyn DisplaySink) {
        if state.primary.needs_recreate() && !self.recreate_surface(state, sink) {
            return;
        }

        let Some(surface) = state.host_surface.as_mut() else {
            return;
        };
        let primary = &state.primary;
        let Some(size) = primary.data_size() else {
            return;
        };
        let Some(src) = self.resolve(primary.surface.mem, MemSlotGroup::Guest, size) else {
            debug!("Primary surface at {:#x} not mapped", primary.surface.mem.0);
            return;
        };

        for rect in state.dirty.drain_valid(primary.width(), primary.height()) {
            if let Some(dst) = surface.data_mut() {
                if let Err(e) = blit(primary, &src, dst, &rect) {
                    warn!("Failed to copy {rect:?}: {e}");
                    continue;
                }
            }
            sink.update_region(surface, rect);
        }
    }

    /// Returns false when the surface can't be created yet; the resize
    /// then stays pending.
    fn recreate_surface(&self, state: &mut RenderState, sink: &mut dyn DisplaySink) -> bool {
        let primary = &state.primary;
        if let Err(e) = primary.validate_geometry() {
            warn!("Invalid primary surface: {e}");
            return false;
        }
        let Some(size) = primary.data_size() else {
            return false;
        };
        if self.resolve(primary.surface.mem, MemSlotGroup::Guest, size).is_none() {
            debug!(
                "Primary surface at {:#x} not mapped yet, keeping resize pending",
                primary.surface.mem.0
            );
            return false;
        }

        let shared = self.config.zero_copy && self.features.contains(SinkFeatures::SHARED_SURFACE);
        let Some(surface) = HostSurface::for_primary(primary, shared) else {
            return false;
        };
        debug!(
            "Host surface {}x{} stride {} {:?} shared {}",
            surface.width,
            surface.height,
            surface.stride,
            surface.format,
            surface.is_shared()
        );

        state.dirty.reset_to_full(primary.width(), primary.height());
        sink.replace_surface(&surface);
        state.host_surface = Some(surface);
        state.primary.mark_recreated();
        true
    }

    // ========================================================================
    // Cursor
    // ========================================================================

    /// Handles a guest cursor command. Shapes live in guest memory slot
    /// `group`.
    ///
    /// Shapes that can't be decoded are replaced by the built-in pointer.
    /// Unmapped or multi-chunk shapes fail the command and leave the current
    /// cursor untouched.
    pub fn render_cursor(&self, cmd: &CursorCommand, group: MemSlotGroup) -> Result<()> {
        if !self.features.contains(SinkFeatures::CURSOR_DEFINE) {
            return Ok(());
        }
        if self.config.debug_level > 1 && !matches!(cmd, CursorCommand::Move { .. }) {
            debug!("Cursor command {cmd:?}");
        }

        match *cmd {
            CursorCommand::Set {
                position, shape, ..
            } => {
                let image = self.load_cursor(shape, group)?;
                if self.config.debug_level > 2 {
                    trace!(
                        "Cursor {}x{} hot {},{}\n{}",
                        image.width,
                        image.height,
                        image.hot_x,
                        image.hot_y,
                        image.ascii_art()
                    );
                }
                let mut state = self.lock_state();
                state.cursor = Some(image);
                state.mouse = position;
                drop(state);
                self.schedule_cursor();
            }
            CursorCommand::Move { position } => {
                self.lock_state().mouse = position;
                self.schedule_cursor();
            }
            CursorCommand::Hide | CursorCommand::Trail { .. } => {
                debug!("Ignoring cursor command {cmd:?}");
            }
        }
        Ok(())
    }

    fn load_cursor(&self, shape: GuestAddress, group: MemSlotGroup) -> Result<CursorImage> {
        let header = CursorHeader::parse(&self.read_guest(shape, group, CURSOR_HEADER_SIZE)?)?;
        if header.is_chunked() {
            warn!(
                "Cursor shape uses multiple chunks: {} of {} bytes",
                header.chunk_size, header.data_size
            );
            return Err(QxlRenderError::MultipleChunks {
                chunk: header.chunk_size,
                total: header.data_size,
            });
        }

        let data_size = header.data_size as usize;
        if data_size > self.config.max_cursor_payload() {
            warn!("Cursor payload of {data_size} bytes too large, using default pointer");
            return Ok(CursorImage::left_ptr());
        }
        let payload = self
            .read_guest(shape, group, CURSOR_HEADER_SIZE + data_size)?
            .split_off(CURSOR_HEADER_SIZE);

        Ok(self
            .converter
            .convert_payload(&header, &payload)
            .unwrap_or_else(|e| {
                warn!("Failed to convert cursor: {e}, using default pointer");
                CursorImage::left_ptr()
            }))
    }

    /// Active cursor image
    pub fn cursor(&self) -> Option<CursorImage> {
        self.lock_state().cursor.clone()
    }

    /// Last cursor position
    pub fn mouse_position(&self) -> Position {
        self.lock_state().mouse
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use vm_memory::{Bytes, GuestMemoryMmap};

    use super::*;
    use crate::qxl::cursor::{CursorType, ALPHA_OPAQUE_THRESHOLD};
    use crate::qxl::surface::SurfaceFormat;

    const FB_ADDR: u64 = 0x1000;
    const SHAPE_ADDR: u64 = 0x8000;

    #[derive(Default)]
    struct RecordingBackend {
        cookies: Mutex<Vec<UpdateCookie>>,
    }

    impl RecordingBackend {
        fn take(&self) -> Vec<UpdateCookie> {
            std::mem::take(&mut *self.cookies.lock().unwrap())
        }
    }

    impl UpdateAreaBackend for RecordingBackend {
        fn update_area_async(&self, _area: Rect, cookie: UpdateCookie) {
            self.cookies.lock().unwrap().push(cookie);
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        surfaces: Vec<HostSurface>,
        regions: Vec<Rect>,
        cursors: Vec<(CursorImage, i32, i32)>,
    }

    impl DisplaySink for RecordingSink {
        fn replace_surface(&mut self, surface: &HostSurface) {
            self.surfaces.push(surface.clone());
        }

        fn update_region(&mut self, _surface: &HostSurface, rect: Rect) {
            self.regions.push(rect);
        }

        fn publish_cursor(&mut self, cursor: &CursorImage, x: i32, y: i32) {
            self.cursors.push((cursor.clone(), x, y));
        }
    }

    struct Harness {
        renderer: QxlRenderer,
        memory: Arc<GuestMemoryMmap>,
        running: Arc<AtomicBool>,
        backend: Arc<RecordingBackend>,
    }

    fn harness(config: RenderConfig, features: SinkFeatures) -> Harness {
        let memory = Arc::new(GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x10000)]).unwrap());
        let running = Arc::new(AtomicBool::new(false));
        let backend = Arc::new(RecordingBackend::default());
        let renderer = QxlRenderer::new(
            config,
            features,
            memory.clone(),
            running.clone(),
            backend.clone(),
        )
        .unwrap();
        Harness {
            renderer,
            memory,
            running,
            backend,
        }
    }

    fn surface_4x4(stride: i32) -> SurfaceCreate {
        SurfaceCreate {
            width: 4,
            height: 4,
            stride,
            format: SurfaceFormat::RAW_XRGB8888,
            mem: GuestAddress(FB_ADDR),
        }
    }

    fn owned_config() -> RenderConfig {
        RenderConfig {
            zero_copy: false,
            ..Default::default()
        }
    }

    fn alpha_shape(pixel: u32) -> Vec<u8> {
        let header = CursorHeader {
            kind: CursorType::Alpha as u16,
            width: 1,
            height: 1,
            data_size: 4,
            chunk_size: 4,
            ..Default::default()
        };
        let mut shape = header.to_bytes().to_vec();
        shape.extend_from_slice(&pixel.to_le_bytes());
        shape
    }

    #[test]
    fn test_config_validate() {
        assert!(RenderConfig::default().validate().is_ok());
        let bad = RenderConfig {
            dirty_queue_capacity: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = RenderConfig {
            max_cursor_dimension: 70000,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_config_from_json() {
        let config: RenderConfig =
            serde_json::from_str(r#"{"zero_copy": false, "debug_level": 3}"#).unwrap();
        assert!(!config.zero_copy);
        assert_eq!(config.debug_level, 3);
        assert_eq!(config.dirty_queue_capacity, DEFAULT_DIRTY_CAPACITY);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let memory = Arc::new(GuestMemoryMmap::from_ranges(&[(GuestAddress(0), 0x1000)]).unwrap());
        let config = RenderConfig {
            dirty_queue_capacity: 0,
            ..Default::default()
        };
        let result = QxlRenderer::new(
            config,
            SinkFeatures::default(),
            memory,
            Arc::new(AtomicBool::new(false)),
            Arc::new(RecordingBackend::default()),
        );
        assert!(matches!(result, Err(QxlRenderError::InvalidConfig(_))));
    }

    #[test]
    fn test_resize_recreates_and_paints_everything() {
        let h = harness(owned_config(), SinkFeatures::default());
        let mut sink = RecordingSink::default();
        h.renderer.resize(surface_4x4(16));
        assert!(h.renderer.resize_pending());

        h.renderer.render_update(&mut sink);
        assert!(!h.renderer.resize_pending());
        assert_eq!(sink.surfaces.len(), 1);
        assert!(!sink.surfaces[0].is_shared());
        assert_eq!(sink.regions, vec![Rect::new(0, 0, 4, 4)]);
        assert_eq!(h.renderer.dirty_len(), 0);

        // Nothing dirty, nothing to notify.
        h.renderer.render_update(&mut sink);
        assert_eq!(sink.regions.len(), 1);
        assert_eq!(sink.surfaces.len(), 1);
    }

    #[test]
    fn test_zero_copy_skips_blit_but_notifies() {
        let h = harness(RenderConfig::default(), SinkFeatures::default());
        let mut sink = RecordingSink::default();
        h.renderer.resize(surface_4x4(16));
        h.renderer.render_update(&mut sink);

        assert!(sink.surfaces[0].is_shared());
        assert_eq!(sink.regions, vec![Rect::new(0, 0, 4, 4)]);
    }

    #[test]
    fn test_bottom_up_never_shared() {
        let h = harness(RenderConfig::default(), SinkFeatures::default());
        let mut sink = RecordingSink::default();
        h.renderer.resize(surface_4x4(-16));
        h.renderer.render_update(&mut sink);
        assert!(!sink.surfaces[0].is_shared());
    }

    #[test]
    fn test_sink_without_shared_surface() {
        let h = harness(RenderConfig::default(), SinkFeatures::CURSOR_DEFINE);
        let mut sink = RecordingSink::default();
        h.renderer.resize(surface_4x4(16));
        h.renderer.render_update(&mut sink);
        assert!(!sink.surfaces[0].is_shared());
    }

    #[test]
    fn test_unmapped_surface_keeps_resize_pending() {
        let h = harness(owned_config(), SinkFeatures::default());
        let mut sink = RecordingSink::default();
        h.renderer.resize(SurfaceCreate {
            mem: GuestAddress(0x10_0000),
            ..surface_4x4(16)
        });

        h.renderer.render_update(&mut sink);
        assert!(h.renderer.resize_pending());
        assert!(sink.surfaces.is_empty());

        h.renderer.resize(surface_4x4(16));
        h.renderer.render_update(&mut sink);
        assert!(!h.renderer.resize_pending());
        assert_eq!(sink.surfaces.len(), 1);
    }

    #[test]
    fn test_bad_geometry_keeps_resize_pending() {
        let h = harness(owned_config(), SinkFeatures::default());
        let mut sink = RecordingSink::default();
        h.renderer.resize(surface_4x4(8));
        h.renderer.render_update(&mut sink);
        assert!(h.renderer.resize_pending());
        assert!(sink.surfaces.is_empty());
    }

    #[test]
    fn test_invalid_rects_dropped() {
        let h = harness(owned_config(), SinkFeatures::default());
        let mut sink = RecordingSink::default();
        h.renderer.resize(surface_4x4(16));
        h.renderer.render_update(&mut sink);
        sink.regions.clear();

        h.renderer.set_dirty(&[
            Rect::new(0, 0, 2, 2),
            Rect::new(3, 0, 1, 2),
            Rect::new(0, 0, 5, 4),
            Rect::new(2, 2, 4, 4),
            Rect::EMPTY,
            Rect::new(0, 0, 1, 1),
        ]);
        h.renderer.render_update(&mut sink);
        assert_eq!(sink.regions, vec![Rect::new(0, 0, 2, 2), Rect::new(2, 2, 4, 4)]);
        assert_eq!(h.renderer.dirty_len(), 0);
    }

    #[test]
    fn test_push_dirty_full() {
        let config = RenderConfig {
            dirty_queue_capacity: 2,
            ..Default::default()
        };
        let h = harness(config, SinkFeatures::default());
        h.renderer.push_dirty(Rect::new(0, 0, 1, 1)).unwrap();
        h.renderer.push_dirty(Rect::new(0, 0, 1, 1)).unwrap();
        assert!(matches!(
            h.renderer.push_dirty(Rect::new(0, 0, 1, 1)),
            Err(QxlRenderError::DirtyQueueFull(2))
        ));

        h.renderer.set_dirty(&[Rect::new(0, 0, 1, 1); 5]);
        assert_eq!(h.renderer.dirty_len(), 2);
    }

    #[test]
    fn test_async_update_round_trip() {
        let h = harness(owned_config(), SinkFeatures::default());
        let mut sink = RecordingSink::default();
        h.renderer.resize(surface_4x4(16));
        h.running.store(true, Ordering::Release);

        // Running without guest commands drains synchronously.
        h.renderer.render_update(&mut sink);
        assert_eq!(sink.regions.len(), 1);
        assert!(h.backend.take().is_empty());

        h.renderer.push_dirty(Rect::new(0, 0, 2, 2)).unwrap();
        h.renderer.note_guest_commands();
        h.renderer.render_update(&mut sink);
        assert_eq!(h.renderer.pending_updates(), 1);
        assert_eq!(h.renderer.dirty_len(), 1);
        assert_eq!(sink.regions.len(), 1);

        let cookies = h.backend.take();
        assert_eq!(cookies.len(), 1);
        assert_eq!(cookies[0].area(), Rect::new(0, 0, 4, 4));

        for cookie in cookies {
            h.renderer.update_area_done(cookie);
        }
        assert_eq!(h.renderer.pending_updates(), 0);
        // Completion never drains inline.
        assert_eq!(sink.regions.len(), 1);

        assert_eq!(h.renderer.process_deferred(&mut sink), 1);
        assert_eq!(sink.regions, vec![Rect::new(0, 0, 4, 4), Rect::new(0, 0, 2, 2)]);
    }

    #[test]
    fn test_completion_without_request_keeps_counter_at_zero() {
        let h = harness(owned_config(), SinkFeatures::default());
        h.renderer
            .update_area_done(UpdateCookie::render_update_area(Rect::covering(4, 4)));
        assert_eq!(h.renderer.pending_updates(), 0);
        assert_eq!(h.renderer.deferred_receiver().len(), 1);
    }

    #[test]
    fn test_paused_vm_drains_synchronously() {
        let h = harness(owned_config(), SinkFeatures::default());
        let mut sink = RecordingSink::default();
        h.renderer.resize(surface_4x4(16));
        h.renderer.note_guest_commands();
        h.renderer.render_update(&mut sink);

        assert_eq!(h.renderer.pending_updates(), 0);
        assert!(h.backend.take().is_empty());
        assert_eq!(sink.regions.len(), 1);
    }

    #[test]
    fn test_cursor_set_and_move() {
        let h = harness(RenderConfig::default(), SinkFeatures::default());
        let mut sink = RecordingSink::default();
        h.memory
            .write_slice(&alpha_shape(0x9112_3456), GuestAddress(SHAPE_ADDR))
            .unwrap();

        h.renderer
            .render_cursor(
                &CursorCommand::Set {
                    position: Position::new(10, 20),
                    visible: true,
                    shape: GuestAddress(SHAPE_ADDR),
                },
                MemSlotGroup::Guest,
            )
            .unwrap();
        let cursor = h.renderer.cursor().unwrap();
        assert_eq!(cursor.pixel(0, 0), Some(0xff12_3456));

        h.renderer
            .render_cursor(
                &CursorCommand::Move {
                    position: Position::new(30, 40),
                },
                MemSlotGroup::Guest,
            )
            .unwrap();
        assert_eq!(h.renderer.mouse_position(), Position::new(30, 40));
        assert_eq!(h.renderer.cursor(), Some(cursor.clone()));

        // Set and move share one queued publish carrying the latest state.
        assert_eq!(h.renderer.process_deferred(&mut sink), 1);
        assert_eq!(sink.cursors, vec![(cursor, 30, 40)]);
    }

    #[test]
    fn test_cursor_publishes_coalesce() {
        let h = harness(RenderConfig::default(), SinkFeatures::default());
        let mut sink = RecordingSink::default();
        h.memory
            .write_slice(&alpha_shape(0xff00_0000), GuestAddress(SHAPE_ADDR))
            .unwrap();
        h.renderer
            .render_cursor(
                &CursorCommand::Set {
                    position: Position::default(),
                    visible: true,
                    shape: GuestAddress(SHAPE_ADDR),
                },
                MemSlotGroup::Guest,
            )
            .unwrap();

        for i in 0..10_000 {
            h.renderer
                .render_cursor(
                    &CursorCommand::Move {
                        position: Position::new(i, i),
                    },
                    MemSlotGroup::Guest,
                )
                .unwrap();
        }
        assert_eq!(h.renderer.deferred_receiver().len(), 1);
        assert_eq!(h.renderer.process_deferred(&mut sink), 1);
        assert_eq!(sink.cursors.len(), 1);
        assert_eq!((sink.cursors[0].1, sink.cursors[0].2), (9_999, 9_999));

        // Once the publish ran, the next move queues a new one.
        h.renderer
            .render_cursor(
                &CursorCommand::Move {
                    position: Position::new(1, 2),
                },
                MemSlotGroup::Guest,
            )
            .unwrap();
        assert_eq!(h.renderer.process_deferred(&mut sink), 1);
        assert_eq!(sink.cursors.len(), 2);
        assert_eq!((sink.cursors[1].1, sink.cursors[1].2), (1, 2));
    }

    #[test]
    fn test_update_completions_do_not_coalesce() {
        let h = harness(owned_config(), SinkFeatures::default());
        for _ in 0..3 {
            h.renderer
                .update_area_done(UpdateCookie::render_update_area(Rect::covering(4, 4)));
        }
        h.renderer
            .render_cursor(
                &CursorCommand::Move {
                    position: Position::new(1, 1),
                },
                MemSlotGroup::Guest,
            )
            .unwrap();
        let queued: Vec<_> = h.renderer.deferred_receiver().try_iter().collect();
        assert_eq!(
            queued,
            vec![
                DeferredWork::UpdateArea,
                DeferredWork::UpdateArea,
                DeferredWork::UpdateArea,
                DeferredWork::Cursor,
            ]
        );
    }

    #[test]
    fn test_cursor_below_threshold_is_transparent() {
        let h = harness(RenderConfig::default(), SinkFeatures::default());
        let pixel = (ALPHA_OPAQUE_THRESHOLD << 24) | 0x00ff_ffff;
        h.memory
            .write_slice(&alpha_shape(pixel), GuestAddress(SHAPE_ADDR))
            .unwrap();
        h.renderer
            .render_cursor(
                &CursorCommand::Set {
                    position: Position::default(),
                    visible: true,
                    shape: GuestAddress(SHAPE_ADDR),
                },
                MemSlotGroup::Guest,
            )
            .unwrap();
        assert_eq!(h.renderer.cursor().unwrap().pixel(0, 0), Some(0));
    }

    #[test]
    fn test_move_without_cursor_publishes_nothing() {
        let h = harness(RenderConfig::default(), SinkFeatures::default());
        let mut sink = RecordingSink::default();
        h.renderer
            .render_cursor(
                &CursorCommand::Move {
                    position: Position::new(1, 2),
                },
                MemSlotGroup::Guest,
            )
            .unwrap();
        assert_eq!(h.renderer.process_deferred(&mut sink), 1);
        assert!(sink.cursors.is_empty());
        assert_eq!(h.renderer.mouse_position(), Position::new(1, 2));
    }

    #[test]
    fn test_hide_and_trail_ignored() {
        let h = harness(RenderConfig::default(), SinkFeatures::default());
        for cmd in [
            CursorCommand::Hide,
            CursorCommand::Trail {
                length: 4,
                frequency: 2,
            },
        ] {
            h.renderer.render_cursor(&cmd, MemSlotGroup::Guest).unwrap();
        }
        assert!(h.renderer.deferred_receiver().is_empty());
        assert!(h.renderer.cursor().is_none());
    }

    #[test]
    fn test_oversized_payload_uses_default_pointer() {
        let h = harness(RenderConfig::default(), SinkFeatures::default());
        let header = CursorHeader {
            kind: CursorType::Alpha as u16,
            width: 1,
            height: 1,
            data_size: u32::MAX,
            chunk_size: u32::MAX,
            ..Default::default()
        };
        h.memory
            .write_slice(&header.to_bytes(), GuestAddress(SHAPE_ADDR))
            .unwrap();
        h.renderer
            .render_cursor(
                &CursorCommand::Set {
                    position: Position::default(),
                    visible: true,
                    shape: GuestAddress(SHAPE_ADDR),
                },
                MemSlotGroup::Guest,
            )
            .unwrap();
        assert_eq!(h.renderer.cursor(), Some(CursorImage::left_ptr()));
    }

    #[test]
    fn test_unmapped_shape_fails() {
        let h = harness(RenderConfig::default(), SinkFeatures::default());
        let result = h.renderer.render_cursor(
            &CursorCommand::Set {
                position: Position::default(),
                visible: true,
                shape: GuestAddress(0x20_0000),
            },
            MemSlotGroup::Guest,
        );
        assert!(matches!(result, Err(QxlRenderError::UnresolvedAddress(0x20_0000))));
        assert!(h.renderer.cursor().is_none());
        assert!(h.renderer.deferred_receiver().is_empty());
    }
}
