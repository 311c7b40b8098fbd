// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Primary surface state
//!
//! Tracks the guest-declared primary surface (geometry, pitch and pixel
//! format) and describes the host surface that mirrors it.

use log::warn;
use vm_memory::GuestAddress;

use super::dirty::Rect;

/// Guest surface pixel format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SurfaceFormat {
    /// 16-bit x1r5g5b5
    Rgb555,
    /// 16-bit r5g6b5
    Rgb565,
    /// 32-bit x8r8g8b8
    #[default]
    Xrgb8888,
    /// 32-bit a8r8g8b8
    Argb8888,
    /// Anything the renderer does not know, raw value kept for diagnostics
    Unknown(u32),
}

impl SurfaceFormat {
    pub const RAW_RGB555: u32 = 16;
    pub const RAW_XRGB8888: u32 = 32;
    pub const RAW_RGB565: u32 = 80;
    pub const RAW_ARGB8888: u32 = 96;

    /// Returns `(bytes_per_pixel, bits_per_pixel)`
    pub fn depth(&self) -> (u32, u32) {
        match self {
            SurfaceFormat::Rgb555 => (2, 15),
            SurfaceFormat::Rgb565 => (2, 16),
            SurfaceFormat::Xrgb8888 | SurfaceFormat::Argb8888 => (4, 32),
            SurfaceFormat::Unknown(_) => (4, 32),
        }
    }
}

impl From<u32> for SurfaceFormat {
    fn from(value: u32) -> Self {
        match value {
            Self::RAW_RGB555 => SurfaceFormat::Rgb555,
            Self::RAW_RGB565 => SurfaceFormat::Rgb565,
            Self::RAW_XRGB8888 => SurfaceFormat::Xrgb8888,
            Self::RAW_ARGB8888 => SurfaceFormat::Argb8888,
            other => SurfaceFormat::Unknown(other),
        }
    }
}

/// Memory slot group used to translate a guest address
#[repr(u32)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MemSlotGroup {
    Host = 0,
    #[default]
    Guest = 1,
}

/// Primary surface creation request as issued by the guest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SurfaceCreate {
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes, negative for bottom-up surfaces
    pub stride: i32,
    /// Raw guest format value
    pub format: u32,
    /// Guest address of the pixel data
    pub mem: GuestAddress,
}

impl Default for SurfaceCreate {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            stride: 0,
            format: SurfaceFormat::RAW_XRGB8888,
            mem: GuestAddress(0),
        }
    }
}

/// Host pixel format used for the presented surface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostPixelFormat {
    X1r5g5b5,
    R5g6b5,
    X8r8g8b8,
}

impl HostPixelFormat {
    /// Default host format for a depth
    pub fn for_depth(bits_pp: u32) -> Self {
        match bits_pp {
            15 => HostPixelFormat::X1r5g5b5,
            16 => HostPixelFormat::R5g6b5,
            _ => HostPixelFormat::X8r8g8b8,
        }
    }
}

/// Guest primary surface descriptor
#[derive(Debug, Clone, Default)]
pub struct GuestPrimary {
    pub surface: SurfaceCreate,
    pub format: SurfaceFormat,
    pub bytes_pp: u32,
    pub bits_pp: u32,
    /// Signed row pitch as declared by the guest
    pub stride: i32,
    pub abs_stride: u32,
    generation: u64,
    applied_generation: u64,
}

impl GuestPrimary {
    /// Applies a new guest surface declaration and marks the host surface
    /// for recreation.
    pub fn resize(&mut self, surface: SurfaceCreate) {
        let format = SurfaceFormat::from(surface.format);
        if let SurfaceFormat::Unknown(raw) = format {
            warn!("Unhandled surface format {raw:#x}, assuming 32 bpp");
        }
        let (bytes_pp, bits_pp) = format.depth();

        self.surface = surface;
        self.format = format;
        self.bytes_pp = bytes_pp;
        self.bits_pp = bits_pp;
        self.stride = surface.stride;
        self.abs_stride = surface.stride.unsigned_abs();
        self.generation += 1;
    }

    pub fn width(&self) -> u32 {
        self.surface.width
    }

    pub fn height(&self) -> u32 {
        self.surface.height
    }

    /// Resize counter, incremented on every guest resize
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether a resize has not been turned into a host surface yet
    pub fn needs_recreate(&self) -> bool {
        self.generation != self.applied_generation
    }

    pub(crate) fn mark_recreated(&mut self) {
        self.applied_generation = self.generation;
    }

    pub fn is_bottom_up(&self) -> bool {
        self.stride < 0
    }

    pub fn full_rect(&self) -> Rect {
        Rect::covering(self.surface.width, self.surface.height)
    }

    /// Size of the guest pixel region in bytes, `None` on overflow
    pub fn data_size(&self) -> Option<usize> {
        (self.abs_stride as usize).checked_mul(self.surface.height as usize)
    }

    /// Checks that each row fits in the declared pitch.
    pub fn validate_geometry(&self) -> Result<(), String> {
        let row_bytes = u64::from(self.surface.width) * u64::from(self.bytes_pp);
        if u64::from(self.abs_stride) < row_bytes {
            return Err(format!(
                "Row pitch {} is smaller than {} bytes per row",
                self.abs_stride, row_bytes
            ));
        }
        if self.data_size().is_none() {
            return Err(format!(
                "Surface {}x{} with pitch {} overflows",
                self.surface.width, self.surface.height, self.abs_stride
            ));
        }
        Ok(())
    }
}

/// Storage behind a host surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SurfaceBacking {
    /// The sink reads guest memory directly
    Shared { addr: GuestAddress, group: MemSlotGroup },
    /// Independent top-down copy filled by the blitter
    Owned(Vec<u8>),
}

/// Host-visible surface mirroring the guest primary surface
#[derive(Debug, Clone)]
pub struct HostSurface {
    pub width: u32,
    pub height: u32,
    /// Row pitch of the host copy, always positive
    pub stride: u32,
    pub format: HostPixelFormat,
    pub backing: SurfaceBacking,
}

impl HostSurface {
    /// Builds the host surface for `primary`. Top-down surfaces alias guest
    /// memory when `shared` is allowed.
    pub fn for_primary(primary: &GuestPrimary, shared: bool) -> Option<Self> {
        let backing = if shared && primary.stride > 0 {
            SurfaceBacking::Shared {
                addr: primary.surface.mem,
                group: MemSlotGroup::Guest,
            }
        } else {
            SurfaceBacking::Owned(vec![0u8; primary.data_size()?])
        };

        Some(Self {
            width: primary.width(),
            height: primary.height(),
            stride: primary.abs_stride,
            format: HostPixelFormat::for_depth(primary.bits_pp),
            backing,
        })
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backing, SurfaceBacking::Shared { .. })
    }

    /// Pixel data of an owned surface
    pub fn data(&self) -> Option<&[u8]> {
        match &self.backing {
            SurfaceBacking::Owned(data) => Some(data),
            SurfaceBacking::Shared { .. } => None,
        }
    }

    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        match &mut self.backing {
            SurfaceBacking::Owned(data) => Some(data),
            SurfaceBacking::Shared { .. } => None,
        }
    }

    /// One row of an owned surface
    pub fn row(&self, y: u32) -> Option<&[u8]> {
        let stride = self.stride as usize;
        let start = (y as usize).checked_mul(stride)?;
        self.data()?.get(start..start.checked_add(stride)?)
    }
}
