//! Index atom location
//!
//! ISO-BMFF files may put their `moov` index before or after the media
//! data. The head probe is walked box by box; the tail probe is scanned for
//! the `moov` fourcc since it may start mid-box.

use super::format::ContainerFormat;
use serde::{Deserialize, Serialize};

/// Where the container's index lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IndexLocation {
    #[serde(rename = "index-at-start")]
    Start,
    #[serde(rename = "index-at-end")]
    End,
    #[serde(rename = "index-not-found")]
    NotFound,
}

/// Box header read from the head probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    pub kind: [u8; 4],
    pub offset: u64,
    /// Total box size; `None` when the box runs to end of file
    pub size: Option<u64>,
}

/// Walk top-level boxes in `head`
///
/// Stops at the end of the probe, at a box that extends to end of file,
/// or at a malformed header.
pub fn walk_boxes(head: &[u8]) -> Vec<BoxHeader> {
    let mut boxes = Vec::new();
    let mut offset: u64 = 0;

    loop {
        let Some(header) = box_bytes(head, offset, 0, 8) else {
            break;
        };
        let size32 = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as u64;
        let kind = [header[4], header[5], header[6], header[7]];

        let size = match size32 {
            0 => None,
            1 => {
                let Some(large) = box_bytes(head, offset, 8, 8) else {
                    break;
                };
                let mut raw = [0u8; 8];
                raw.copy_from_slice(large);
                Some(u64::from_be_bytes(raw))
            }
            n => Some(n),
        };

        boxes.push(BoxHeader { kind, offset, size });

        // Sizes come from the file; one that runs past u64 ends the walk
        match size.filter(|s| *s >= 8).and_then(|s| offset.checked_add(s)) {
            Some(next) => offset = next,
            None => break,
        }
    }
    boxes
}

/// `len` bytes at `offset + skip` within `head`, if all of them are present
fn box_bytes(head: &[u8], offset: u64, skip: usize, len: usize) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?.checked_add(skip)?;
    head.get(start..start.checked_add(len)?)
}

/// Whether `tail` contains a `moov` fourcc
pub fn tail_has_moov(tail: &[u8]) -> bool {
    tail.windows(4).any(|w| w == b"moov")
}

/// Classify index location from the head and tail probes
pub fn locate_index(format: ContainerFormat, head: &[u8], tail: &[u8]) -> IndexLocation {
    if format.is_streamable() {
        return IndexLocation::Start;
    }

    if format == ContainerFormat::Avi {
        // The legacy AVI index trails the movie list
        return if tail.windows(4).any(|w| w == b"idx1") {
            IndexLocation::End
        } else {
            IndexLocation::NotFound
        };
    }

    for header in walk_boxes(head) {
        match &header.kind {
            b"moov" => return IndexLocation::Start,
            b"mdat" => break,
            _ => {}
        }
    }

    if tail_has_moov(tail) {
        IndexLocation::End
    } else {
        IndexLocation::NotFound
    }
}
