//! Parsing of frames and filters given on the command line
//!
//! Frames use the cansend notation:
//! - `123#DEADBEEF` classic frame, 3 hex digits for a standard identifier
//! - `12345678#00` extended identifier (8 hex digits)
//! - `123#R` remote request
//! - `123##1AABB` FD frame; the digit after `##` holds the FD flags

use anyhow::{bail, Context, Result};
use cansock::types::{CAN_EFF_FLAG, CAN_EFF_MASK, CAN_RTR_FLAG, CAN_SFF_MASK};
use cansock::{CanFilter, CanFrame};

/// A parsed frame and whether it needs FD mode
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSpec {
    pub frame: CanFrame,
    pub fd: bool,
}

fn parse_id(text: &str) -> Result<u32> {
    let id = u32::from_str_radix(text, 16)
        .with_context(|| format!("Invalid CAN identifier: {:?}", text))?;
    match text.len() {
        3 if id <= CAN_SFF_MASK => Ok(id),
        8 if id <= CAN_EFF_MASK => Ok(id | CAN_EFF_FLAG),
        _ => bail!("CAN identifier must be 3 or 8 hex digits: {:?}", text),
    }
}

fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let text: String = text.chars().filter(|&c| c != '.').collect();
    if !text.is_ascii() {
        bail!("Non-hex characters in payload: {:?}", text);
    }
    if text.len() % 2 != 0 {
        bail!("Odd number of hex digits in payload: {:?}", text);
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .with_context(|| format!("Invalid payload byte: {:?}", &text[i..i + 2]))
        })
        .collect()
}

/// Parse a frame in cansend notation
pub fn parse_frame(text: &str) -> Result<FrameSpec> {
    let (id, rest) = text
        .split_once('#')
        .with_context(|| format!("Missing '#' in frame: {:?}", text))?;
    let id = parse_id(id)?;

    if let Some(fd_part) = rest.strip_prefix('#') {
        let mut chars = fd_part.chars();
        let flags = chars
            .next()
            .and_then(|c| c.to_digit(16))
            .with_context(|| format!("Missing FD flags in frame: {:?}", text))?;
        let data = parse_hex(chars.as_str())?;
        let frame = CanFrame::new(id, &data)
            .with_context(|| format!("FD payload longer than 64 bytes: {}", data.len()))?
            .with_flags(flags as u8);
        return Ok(FrameSpec { frame, fd: true });
    }

    if rest.eq_ignore_ascii_case("r") {
        let frame = CanFrame::new(id | CAN_RTR_FLAG, &[]).context("Invalid remote frame")?;
        return Ok(FrameSpec { frame, fd: false });
    }

    let data = parse_hex(rest)?;
    if data.len() > 8 {
        bail!("Classic payload longer than 8 bytes: {} (use ## for FD)", data.len());
    }
    let frame = CanFrame::new(id, &data).context("Invalid frame")?;
    Ok(FrameSpec { frame, fd: false })
}

/// Parse a filter in `ID:MASK` form
///
/// Identifiers above the standard range match extended frames only.
pub fn parse_filter(text: &str) -> Result<CanFilter> {
    let (id, mask) = text
        .split_once(':')
        .with_context(|| format!("Filter must be ID:MASK: {:?}", text))?;
    let id = u32::from_str_radix(id, 16)
        .with_context(|| format!("Invalid filter identifier: {:?}", id))?;
    let mask = u32::from_str_radix(mask, 16)
        .with_context(|| format!("Invalid filter mask: {:?}", mask))?;

    if id > CAN_SFF_MASK {
        Ok(CanFilter::new(id | CAN_EFF_FLAG, mask | CAN_EFF_FLAG))
    } else {
        Ok(CanFilter::new(id, mask))
    }
}
