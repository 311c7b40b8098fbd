// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Guest to host pixel copy
//!
//! Copies one dirty rectangle from the guest primary surface into the host
//! surface. The host copy is always stored top-down; a guest surface with a
//! negative pitch is stored bottom-up and gets flipped on the way.

use log::trace;
use vm_memory::VolatileSlice;

use super::dirty::Rect;
use super::surface::GuestPrimary;
use super::{QxlRenderError, Result};

/// Copies `rect` from `src` (the whole guest surface, `abs_stride * height`
/// bytes) into `dst` (the host surface, same layout but top-down).
///
/// `rect` must already fit the surface.
pub fn blit(primary: &GuestPrimary, src: &VolatileSlice, dst: &mut [u8], rect: &Rect) -> Result<()> {
    trace!(
        "blit stride {} rect ({},{})-({},{})",
        primary.stride, rect.left, rect.top, rect.right, rect.bottom
    );

    let abs_stride = i64::from(primary.abs_stride);
    let bytes_pp = i64::from(primary.bytes_pp);
    let height = i64::from(primary.height());
    let (left, top, right, bottom) = (
        i64::from(rect.left),
        i64::from(rect.top),
        i64::from(rect.right),
        i64::from(rect.bottom),
    );

    let len = (right - left) * bytes_pp;
    if len <= 0 {
        return Ok(());
    }

    let mut src_offset = if primary.is_bottom_up() {
        // Walk guest scanlines in reverse order to flip the image.
        (height - top - 1) * abs_stride
    } else {
        top * abs_stride
    } + left * bytes_pp;
    let mut dst_offset = top * abs_stride + left * bytes_pp;
    let len = len as usize;

    for _ in top..bottom {
        let row = usize::try_from(src_offset)
            .ok()
            .and_then(|offset| src.subslice(offset, len).ok())
            .ok_or(QxlRenderError::SourceOutOfBounds {
                offset: src_offset,
                len,
            })?;
        let out = usize::try_from(dst_offset)
            .ok()
            .and_then(|offset| dst.get_mut(offset..offset.checked_add(len)?))
            .ok_or(QxlRenderError::DestinationOutOfBounds {
                offset: dst_offset,
                len,
            })?;
        row.copy_to(out);

        dst_offset += abs_stride;
        src_offset += i64::from(primary.stride);
    }

    Ok(())
}
