// Copyright 2024 Cloud Hypervisor Authors. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Offline QXL cursor decoder
//!
//! Decodes a guest cursor shape dump (42-byte shape prefix followed by the
//! payload) the same way the renderer does and prints it as ASCII art.

use std::fs;
use std::path::Path;

use anyhow::{Context, bail};
use clap::{Arg, ArgAction, Command};
use devices::qxl::{CURSOR_HEADER_SIZE, CursorConverter, CursorHeader, CursorImage, RenderConfig};
use log::{LevelFilter, debug, info, warn};
use serde::Serialize;
use simple_logger::SimpleLogger;

/// Machine readable description of a decoded cursor
#[derive(Debug, Serialize)]
struct CursorSummary {
    header: Option<CursorHeader>,
    width: u32,
    height: u32,
    hot_x: u32,
    hot_y: u32,
    opaque_pixels: usize,
    default_pointer: bool,
}

impl CursorSummary {
    fn new(header: Option<CursorHeader>, image: &CursorImage, default_pointer: bool) -> Self {
        Self {
            header,
            width: image.width,
            height: image.height,
            hot_x: image.hot_x,
            hot_y: image.hot_y,
            opaque_pixels: image.data.iter().filter(|&&p| p >> 24 != 0).count(),
            default_pointer,
        }
    }
}

fn load_config(path: Option<&String>) -> anyhow::Result<RenderConfig> {
    let Some(path) = path else {
        return Ok(RenderConfig::default());
    };
    let text = fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
    let config: RenderConfig =
        serde_json::from_str(&text).with_context(|| format!("Failed to parse {path}"))?;
    if let Err(e) = config.validate() {
        bail!("Invalid configuration {path}: {e}");
    }
    Ok(config)
}

/// Returns the decoded image and whether the default pointer was used.
fn decode(
    shape: &[u8],
    converter: &CursorConverter,
    fallback: bool,
) -> anyhow::Result<(CursorHeader, CursorImage, bool)> {
    let header = CursorHeader::parse(shape).context("Invalid cursor shape")?;
    debug!("Cursor header {header:?}");
    if header.is_chunked() {
        bail!(
            "Cursor shape uses multiple chunks: {} of {} bytes",
            header.chunk_size,
            header.data_size
        );
    }

    match converter.convert_payload(&header, &shape[CURSOR_HEADER_SIZE..]) {
        Ok(image) => Ok((header, image, false)),
        Err(e) if fallback => {
            warn!("Failed to convert cursor: {e}, using default pointer");
            Ok((header, CursorImage::left_ptr(), true))
        }
        Err(e) => Err(e).context("Failed to convert cursor"),
    }
}

fn main() -> anyhow::Result<()> {
    let matches = Command::new("qxl-tool")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Decodes QXL guest cursor shapes")
        .arg(
            Arg::new("input")
                .value_name("SHAPE")
                .help("Cursor shape dump, prints the built-in pointer when omitted"),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("PATH")
                .help("Renderer configuration (JSON)"),
        )
        .arg(
            Arg::new("output")
                .short('o')
                .long("output")
                .value_name("PATH")
                .help("Write decoded pixels as little endian 0xAARRGGBB words"),
        )
        .arg(
            Arg::new("fallback")
                .long("fallback")
                .action(ArgAction::SetTrue)
                .help("Use the built-in pointer when the shape can't be converted"),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .action(ArgAction::SetTrue)
                .help("Print a JSON summary instead of ASCII art"),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .action(ArgAction::SetTrue)
                .help("Enable verbose logging"),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    SimpleLogger::new()
        .with_level(log_level)
        .init()
        .context("Failed to initialize logging")?;

    let config = load_config(matches.get_one::<String>("config"))?;
    let converter = CursorConverter::new(config.max_cursor_dimension);

    let (header, image, default_pointer) = match matches.get_one::<String>("input") {
        Some(path) => {
            let shape = fs::read(path).with_context(|| format!("Failed to read {path}"))?;
            info!("Decoding {} byte shape from {path}", shape.len());
            let (header, image, default_pointer) =
                decode(&shape, &converter, matches.get_flag("fallback"))?;
            (Some(header), image, default_pointer)
        }
        None => (None, CursorImage::left_ptr(), true),
    };

    if let Some(path) = matches.get_one::<String>("output") {
        fs::write(Path::new(path), image.to_le_bytes())
            .with_context(|| format!("Failed to write {path}"))?;
        info!("Wrote {}x{} pixels to {path}", image.width, image.height);
    }

    if matches.get_flag("json") {
        let summary = CursorSummary::new(header, &image, default_pointer);
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "{}x{} hot {},{}",
            image.width, image.height, image.hot_x, image.hot_y
        );
        print!("{}", image.ascii_art());
    }

    Ok(())
}
