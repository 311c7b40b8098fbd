// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Cursor shape conversion
//!
//! Decodes guest cursor shapes into a canonical 32-bit image. Pixels are
//! stored as `0xAARRGGBB` words (alpha in the top byte), the same layout the
//! guest uses for alpha and color32 cursors.
//!
//! Guest cursor shape layout (little endian, packed):
//!
//! ```text
//! +-------------------------------+
//! | unique      u64               |
//! | type        u16               |
//! | width       u16               |  header (18 bytes)
//! | height      u16               |
//! | hot_spot_x  u16               |
//! | hot_spot_y  u16               |
//! +-------------------------------+
//! | data_size   u32               |  total payload size
//! +-------------------------------+
//! | chunk.data_size   u32         |
//! | chunk.prev_chunk  u64         |  first data chunk (20 bytes)
//! | chunk.next_chunk  u64         |
//! +-------------------------------+
//! | payload ...                   |
//! +-------------------------------+
//! ```

use std::io::Cursor as ByteCursor;

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt};
use serde::Serialize;

/// Size of the cursor shape prefix before the payload
pub const CURSOR_HEADER_SIZE: usize = 42;

/// Largest accepted cursor width or height
pub const DEFAULT_MAX_CURSOR_DIMENSION: u32 = 512;

/// Alpha values above this are rendered opaque, others transparent
pub const ALPHA_OPAQUE_THRESHOLD: u32 = 0x90;

const OPAQUE_BLACK: u32 = 0xff00_0000;
const OPAQUE_WHITE: u32 = 0xffff_ffff;
const TRANSPARENT: u32 = 0x0000_0000;
const RGB_MASK: u32 = 0x00ff_ffff;
const ALPHA_MASK: u32 = 0xff00_0000;

/// Checkerboard colors replacing masked white color32 pixels
const WHITE_HACK_ODD: u32 = 0xc030_3030;
const WHITE_HACK_EVEN: u32 = 0x3050_5050;

/// Cursor decoding errors
#[derive(Debug, thiserror::Error)]
pub enum CursorError {
    #[error("Cursor shape header truncated: {0} bytes")]
    HeaderTruncated(usize),

    #[error("Unsupported cursor type: {0}")]
    UnsupportedType(u16),

    #[error("Cursor data truncated: need {expected} bytes, have {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Cursor {width}x{height} exceeds the {max} pixel limit")]
    TooLarge { width: u32, height: u32, max: u32 },
}

/// Guest cursor encodings
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorType {
    Alpha = 0,
    Mono = 1,
    Color4 = 2,
    Color8 = 3,
    Color16 = 4,
    Color24 = 5,
    Color32 = 6,
}

impl TryFrom<u16> for CursorType {
    type Error = CursorError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(CursorType::Alpha),
            1 => Ok(CursorType::Mono),
            2 => Ok(CursorType::Color4),
            3 => Ok(CursorType::Color8),
            4 => Ok(CursorType::Color16),
            5 => Ok(CursorType::Color24),
            6 => Ok(CursorType::Color32),
            other => Err(CursorError::UnsupportedType(other)),
        }
    }
}

/// Fixed part of a guest cursor shape
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CursorHeader {
    pub unique: u64,
    /// Raw cursor type
    pub kind: u16,
    pub width: u16,
    pub height: u16,
    pub hot_x: u16,
    pub hot_y: u16,
    /// Total payload size declared by the shape
    pub data_size: u32,
    /// Payload size of the first chunk
    pub chunk_size: u32,
    pub prev_chunk: u64,
    pub next_chunk: u64,
}

impl CursorHeader {
    /// Parses the 42-byte shape prefix.
    pub fn parse(bytes: &[u8]) -> Result<Self, CursorError> {
        if bytes.len() < CURSOR_HEADER_SIZE {
            return Err(CursorError::HeaderTruncated(bytes.len()));
        }
        let mut rdr = ByteCursor::new(bytes);
        let read = |rdr: &mut ByteCursor<&[u8]>| -> std::io::Result<Self> {
            Ok(Self {
                unique: rdr.read_u64::<LittleEndian>()?,
                kind: rdr.read_u16::<LittleEndian>()?,
                width: rdr.read_u16::<LittleEndian>()?,
                height: rdr.read_u16::<LittleEndian>()?,
                hot_x: rdr.read_u16::<LittleEndian>()?,
                hot_y: rdr.read_u16::<LittleEndian>()?,
                data_size: rdr.read_u32::<LittleEndian>()?,
                chunk_size: rdr.read_u32::<LittleEndian>()?,
                prev_chunk: rdr.read_u64::<LittleEndian>()?,
                next_chunk: rdr.read_u64::<LittleEndian>()?,
            })
        };
        read(&mut rdr).map_err(|_| CursorError::HeaderTruncated(bytes.len()))
    }

    /// A shape whose payload does not fit in the first chunk.
    pub fn is_chunked(&self) -> bool {
        self.chunk_size != self.data_size
    }

    pub fn cursor_type(&self) -> Result<CursorType, CursorError> {
        CursorType::try_from(self.kind)
    }

    /// Serializes the prefix, used to build shapes for tests and tools.
    pub fn to_bytes(&self) -> [u8; CURSOR_HEADER_SIZE] {
        let mut buf = [0u8; CURSOR_HEADER_SIZE];
        LittleEndian::write_u64(&mut buf[0..8], self.unique);
        LittleEndian::write_u16(&mut buf[8..10], self.kind);
        LittleEndian::write_u16(&mut buf[10..12], self.width);
        LittleEndian::write_u16(&mut buf[12..14], self.height);
        LittleEndian::write_u16(&mut buf[14..16], self.hot_x);
        LittleEndian::write_u16(&mut buf[16..18], self.hot_y);
        LittleEndian::write_u32(&mut buf[18..22], self.data_size);
        LittleEndian::write_u32(&mut buf[22..26], self.chunk_size);
        LittleEndian::write_u64(&mut buf[26..34], self.prev_chunk);
        LittleEndian::write_u64(&mut buf[34..42], self.next_chunk);
        buf
    }
}

/// Bytes per row of a 1-bit plane
pub fn mono_bytes_per_line(width: u32) -> usize {
    (width as usize).div_ceil(8)
}

fn bit_is_set(plane: &[u8], index: usize) -> bool {
    plane
        .get(index >> 3)
        .is_some_and(|byte| byte & (0x80 >> (index & 7)) != 0)
}

/// Cursor payload in one of the supported guest encodings
#[derive(Debug, Clone, Copy)]
pub enum CursorSource<'a> {
    /// `width * height` 32-bit pixels
    Alpha { pixels: &'a [u8] },
    /// AND plane followed by XOR plane, rows padded to whole bytes
    Mono { and_mask: &'a [u8], xor_mask: &'a [u8] },
    /// `width * height` 32-bit pixels followed by a packed 1-bit mask
    Color32 { pixels: &'a [u8], mask: &'a [u8] },
}

impl<'a> CursorSource<'a> {
    /// Splits a payload according to the cursor type and geometry.
    pub fn from_payload(
        kind: CursorType,
        width: u32,
        height: u32,
        data: &'a [u8],
    ) -> Result<Self, CursorError> {
        let pixel_count = width as usize * height as usize;
        let split = move |needed: usize, at: usize| -> Result<(&'a [u8], &'a [u8]), CursorError> {
            if data.len() < needed {
                return Err(CursorError::Truncated {
                    expected: needed,
                    actual: data.len(),
                });
            }
            let (head, tail) = data.split_at(at);
            Ok((head, &tail[..needed - at]))
        };

        match kind {
            CursorType::Alpha => {
                let (pixels, _) = split(pixel_count * 4, pixel_count * 4)?;
                Ok(CursorSource::Alpha { pixels })
            }
            CursorType::Mono => {
                let plane = mono_bytes_per_line(width) * height as usize;
                let (and_mask, xor_mask) = split(plane * 2, plane)?;
                Ok(CursorSource::Mono { and_mask, xor_mask })
            }
            CursorType::Color32 => {
                let color = pixel_count * 4;
                let (pixels, mask) = split(color + pixel_count.div_ceil(8), color)?;
                Ok(CursorSource::Color32 { pixels, mask })
            }
            CursorType::Color4 | CursorType::Color8 | CursorType::Color16 | CursorType::Color24 => {
                Err(CursorError::UnsupportedType(kind as u16))
            }
        }
    }
}

/// Canonical cursor image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorImage {
    pub width: u32,
    pub height: u32,
    pub hot_x: u32,
    pub hot_y: u32,
    /// `width * height` pixels, `0xAARRGGBB`
    pub data: Vec<u32>,
}

impl CursorImage {
    pub fn new(width: u32, height: u32, hot_x: u32, hot_y: u32) -> Self {
        Self {
            width,
            height,
            hot_x,
            hot_y,
            data: vec![TRANSPARENT; width as usize * height as usize],
        }
    }

    /// Pixel at `(x, y)`, `None` outside the image
    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.data
            .get(y as usize * self.width as usize + x as usize)
            .copied()
    }

    pub fn alpha(&self, x: u32, y: u32) -> Option<u8> {
        self.pixel(x, y).map(|p| (p >> 24) as u8)
    }

    /// Built-in left pointer arrow used when a guest cursor can't be shown
    pub fn left_ptr() -> Self {
        const LEFT_PTR: [&str; 16] = [
            "X               ",
            "XX              ",
            "X.X             ",
            "X..X            ",
            "X...X           ",
            "X....X          ",
            "X.....X         ",
            "X......X        ",
            "X.......X       ",
            "X........X      ",
            "X.....XXXXX     ",
            "X..X..X         ",
            "X.X X..X        ",
            "XX  X..X        ",
            "X    X..X       ",
            "     XXXX       ",
        ];

        let mut image = Self::new(16, 16, 1, 1);
        for (y, line) in LEFT_PTR.iter().enumerate() {
            for (x, c) in line.bytes().enumerate() {
                image.data[y * 16 + x] = match c {
                    b'X' => OPAQUE_BLACK,
                    b'.' => OPAQUE_WHITE,
                    _ => TRANSPARENT,
                };
            }
        }
        image
    }

    /// Text rendering: ' ' transparent, '.' white, 'X' black, 'o' other.
    pub fn ascii_art(&self) -> String {
        let mut out = String::with_capacity((self.width as usize + 1) * self.height as usize);
        for row in self.data.chunks(self.width.max(1) as usize) {
            for &pixel in row {
                out.push(if pixel & ALPHA_MASK == 0 {
                    ' '
                } else if pixel & RGB_MASK == RGB_MASK {
                    '.'
                } else if pixel & RGB_MASK == 0 {
                    'X'
                } else {
                    'o'
                });
            }
            out.push('\n');
        }
        out
    }

    /// Pixels as little-endian bytes
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.data.iter().flat_map(|p| p.to_le_bytes()).collect()
    }
}

/// Decodes guest cursor shapes
#[derive(Debug, Clone, Copy)]
pub struct CursorConverter {
    max_dimension: u32,
}

impl Default for CursorConverter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CURSOR_DIMENSION)
    }
}

impl CursorConverter {
    pub fn new(max_dimension: u32) -> Self {
        Self { max_dimension }
    }

    /// Decodes a complete shape (42-byte prefix followed by the payload).
    pub fn convert_shape(&self, shape: &[u8]) -> Result<CursorImage, CursorError> {
        let header = CursorHeader::parse(shape)?;
        self.convert_payload(&header, &shape[CURSOR_HEADER_SIZE..])
    }

    /// Decodes a payload described by `header`.
    pub fn convert_payload(
        &self,
        header: &CursorHeader,
        payload: &[u8],
    ) -> Result<CursorImage, CursorError> {
        let (width, height) = (u32::from(header.width), u32::from(header.height));
        if width > self.max_dimension || height > self.max_dimension {
            return Err(CursorError::TooLarge {
                width,
                height,
                max: self.max_dimension,
            });
        }
        let source = CursorSource::from_payload(header.cursor_type()?, width, height, payload)?;
        let mut image = CursorImage::new(
            width,
            height,
            u32::from(header.hot_x),
            u32::from(header.hot_y),
        );
        Self::convert(&source, &mut image);
        Ok(image)
    }

    /// Fills `image` from `source`. Geometry comes from `image`.
    pub fn convert(source: &CursorSource, image: &mut CursorImage) {
        match *source {
            CursorSource::Alpha { pixels } => convert_alpha(pixels, image),
            CursorSource::Mono { and_mask, xor_mask } => {
                mono_edge_highlight(and_mask, xor_mask, image);
            }
            CursorSource::Color32 { pixels, mask } => convert_color32(pixels, mask, image),
        }
    }
}

fn read_pixel(pixels: &[u8], index: usize) -> u32 {
    pixels
        .get(index * 4..index * 4 + 4)
        .map_or(TRANSPARENT, LittleEndian::read_u32)
}

/// Thresholds alpha instead of blending: above 0x90 becomes opaque, the rest
/// fully transparent.
fn convert_alpha(pixels: &[u8], image: &mut CursorImage) {
    for (i, out) in image.data.iter_mut().enumerate() {
        let pixel = read_pixel(pixels, i);
        *out = if pixel >> 24 > ALPHA_OPAQUE_THRESHOLD {
            pixel | ALPHA_MASK
        } else {
            TRANSPARENT
        };
    }
}

/// Masked pure white pixels would vanish, so they become a checkerboard.
fn convert_color32(pixels: &[u8], mask: &[u8], image: &mut CursorImage) {
    let width = image.width.max(1) as usize;
    for (i, out) in image.data.iter_mut().enumerate() {
        let pixel = read_pixel(pixels, i);
        *out = if !bit_is_set(mask, i) {
            pixel | ALPHA_MASK
        } else if pixel & RGB_MASK == RGB_MASK {
            let (x, y) = (i % width, i / width);
            if (x ^ y) & 1 != 0 {
                WHITE_HACK_ODD
            } else {
                WHITE_HACK_EVEN
            }
        } else {
            pixel & RGB_MASK
        };
    }
}

/// A background pixel of the XOR plane next to at least one set pixel.
/// Border pixels are never edges.
fn is_edge(xor_mask: &[u8], bpl: usize, width: u32, height: u32, x: u32, y: u32) -> bool {
    if x == 0 || y == 0 || x + 1 >= width || y + 1 >= height {
        return false;
    }
    let set = |x: u32, y: u32| bit_is_set(xor_mask, y as usize * bpl * 8 + x as usize);
    if set(x, y) {
        return false;
    }
    [
        (x - 1, y - 1),
        (x, y - 1),
        (x + 1, y - 1),
        (x - 1, y),
        (x + 1, y),
        (x - 1, y + 1),
        (x, y + 1),
        (x + 1, y + 1),
    ]
    .into_iter()
    .any(|(nx, ny)| set(nx, ny))
}

/// Renders a mono cursor. When the AND plane is all ones, XOR edge pixels
/// become transparent so solid XOR areas get a halo against similar
/// backgrounds. Otherwise:
///
/// | AND | XOR | result      |
/// |-----|-----|-------------|
/// | 1   | 1   | black       |
/// | 1   | 0   | transparent |
/// | 0   | 1   | white       |
/// | 0   | 0   | black       |
fn mono_edge_highlight(and_mask: &[u8], xor_mask: &[u8], image: &mut CursorImage) {
    let (width, height) = (image.width, image.height);
    let bpl = mono_bytes_per_line(width);
    let plane = bpl * height as usize;
    let fully_masked = and_mask.len() >= plane && and_mask[..plane].iter().all(|&b| b == 0xff);

    for y in 0..height {
        for x in 0..width {
            // Row-padded bit index
            let bit = y as usize * bpl * 8 + x as usize;
            let pixel = if fully_masked && is_edge(xor_mask, bpl, width, height, x, y) {
                TRANSPARENT
            } else {
                match (bit_is_set(and_mask, bit), bit_is_set(xor_mask, bit)) {
                    (true, true) => OPAQUE_BLACK,
                    (true, false) => TRANSPARENT,
                    (false, true) => OPAQUE_WHITE,
                    (false, false) => OPAQUE_BLACK,
                }
            };
            image.data[y as usize * width as usize + x as usize] = pixel;
        }
    }
}
