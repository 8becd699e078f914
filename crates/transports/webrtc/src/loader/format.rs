//! Container format detection
//!
//! Magic bytes win; the declared MIME type or file extension is only used
//! when the probe is inconclusive.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Recognized container formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Mp4,
    QuickTime,
    WebM,
    Matroska,
    Avi,
    Ogg,
    MpegTs,
    Flv,
}

impl ContainerFormat {
    /// ISO base media file (box-structured, may carry `moov` anywhere)
    pub fn is_iso_bmff(&self) -> bool {
        matches!(self, ContainerFormat::Mp4 | ContainerFormat::QuickTime)
    }

    /// Playable from the first byte without a separate index
    pub fn is_streamable(&self) -> bool {
        matches!(
            self,
            ContainerFormat::WebM
                | ContainerFormat::Matroska
                | ContainerFormat::Ogg
                | ContainerFormat::MpegTs
                | ContainerFormat::Flv
        )
    }

    /// Canonical MIME type
    pub fn mime_type(&self) -> &'static str {
        match self {
            ContainerFormat::Mp4 => "video/mp4",
            ContainerFormat::QuickTime => "video/quicktime",
            ContainerFormat::WebM => "video/webm",
            ContainerFormat::Matroska => "video/x-matroska",
            ContainerFormat::Avi => "video/x-msvideo",
            ContainerFormat::Ogg => "video/ogg",
            ContainerFormat::MpegTs => "video/mp2t",
            ContainerFormat::Flv => "video/x-flv",
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mime_type())
    }
}

const EBML_MAGIC: [u8; 4] = [0x1A, 0x45, 0xDF, 0xA3];
const TS_SYNC: u8 = 0x47;
const TS_PACKET: usize = 188;

/// Identify a container from its first bytes
pub fn sniff(head: &[u8]) -> Option<ContainerFormat> {
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return Some(if &head[8..12] == b"qt  " {
            ContainerFormat::QuickTime
        } else {
            ContainerFormat::Mp4
        });
    }
    if head.len() >= 8 && matches!(&head[4..8], b"moov" | b"mdat" | b"wide" | b"free" | b"skip") {
        // Pre-ftyp QuickTime
        return Some(ContainerFormat::QuickTime);
    }
    if head.starts_with(&EBML_MAGIC) {
        let doc = &head[..head.len().min(64)];
        return Some(if doc.windows(4).any(|w| w == b"webm") {
            ContainerFormat::WebM
        } else {
            ContainerFormat::Matroska
        });
    }
    if head.len() >= 12 && head.starts_with(b"RIFF") && &head[8..12] == b"AVI " {
        return Some(ContainerFormat::Avi);
    }
    if head.starts_with(b"OggS") {
        return Some(ContainerFormat::Ogg);
    }
    if head.starts_with(b"FLV") {
        return Some(ContainerFormat::Flv);
    }
    if head.first() == Some(&TS_SYNC) && head.get(TS_PACKET) == Some(&TS_SYNC) {
        return Some(ContainerFormat::MpegTs);
    }
    None
}

/// Interpret a declared MIME type or file extension
pub fn from_hint(hint: &str) -> Option<ContainerFormat> {
    let hint = hint.trim().to_ascii_lowercase();
    let key = hint
        .split(';')
        .next()
        .unwrap_or_default()
        .rsplit(&['/', '.'][..])
        .next()
        .unwrap_or_default();

    match key {
        "mp4" | "m4v" => Some(ContainerFormat::Mp4),
        "mov" | "quicktime" => Some(ContainerFormat::QuickTime),
        "webm" => Some(ContainerFormat::WebM),
        "mkv" | "x-matroska" => Some(ContainerFormat::Matroska),
        "avi" | "x-msvideo" => Some(ContainerFormat::Avi),
        "ogg" | "ogv" => Some(ContainerFormat::Ogg),
        "ts" | "m2ts" | "mp2t" => Some(ContainerFormat::MpegTs),
        "flv" | "x-flv" => Some(ContainerFormat::Flv),
        _ => None,
    }
}

/// Detect the container, falling back to the hint
///
/// # Errors
///
/// `UnsupportedFormat` naming what was probed when neither source helps.
pub fn detect(head: &[u8], hint: Option<&str>) -> Result<ContainerFormat> {
    if let Some(format) = sniff(head) {
        return Ok(format);
    }
    if let Some(format) = hint.and_then(from_hint) {
        tracing::debug!("Format probe inconclusive, trusting hint {:?}", hint);
        return Ok(format);
    }
    Err(Error::UnsupportedFormat(format!(
        "unrecognized container (hint: {})",
        hint.unwrap_or("none")
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ftyp(brand: &[u8; 4]) -> Vec<u8> {
        let mut head = vec![0, 0, 0, 0x18];
        head.extend_from_slice(b"ftyp");
        head.extend_from_slice(brand);
        head.extend_from_slice(&[0; 12]);
        head
    }

    #[test]
    fn test_sniff_iso_bmff() {
        assert_eq!(sniff(&ftyp(b"isom")), Some(ContainerFormat::Mp4));
        assert_eq!(sniff(&ftyp(b"qt  ")), Some(ContainerFormat::QuickTime));
    }

    #[test]
    fn test_sniff_ebml_doctype() {
        let mut webm = EBML_MAGIC.to_vec();
        webm.extend_from_slice(&[0x42, 0x82, 0x84]);
        webm.extend_from_slice(b"webm");
        assert_eq!(sniff(&webm), Some(ContainerFormat::WebM));

        let mut mkv = EBML_MAGIC.to_vec();
        mkv.extend_from_slice(&[0x42, 0x82, 0x88]);
        mkv.extend_from_slice(b"matroska");
        assert_eq!(sniff(&mkv), Some(ContainerFormat::Matroska));
    }

    #[test]
    fn test_sniff_others() {
        let mut avi = b"RIFF".to_vec();
        avi.extend_from_slice(&[0; 4]);
        avi.extend_from_slice(b"AVI LIST");
        assert_eq!(sniff(&avi), Some(ContainerFormat::Avi));
        assert_eq!(sniff(b"OggS\0\x02"), Some(ContainerFormat::Ogg));
        assert_eq!(sniff(b"FLV\x01\x05"), Some(ContainerFormat::Flv));

        let mut ts = vec![0u8; 400];
        ts[0] = TS_SYNC;
        ts[188] = TS_SYNC;
        assert_eq!(sniff(&ts), Some(ContainerFormat::MpegTs));
    }

    #[test]
    fn test_hint_fallback() {
        assert_eq!(from_hint("video/webm; codecs=vp9"), Some(ContainerFormat::WebM));
        assert_eq!(from_hint("Movie.MKV"), Some(ContainerFormat::Matroska));
        assert_eq!(from_hint("video/mp2t"), Some(ContainerFormat::MpegTs));
        assert_eq!(from_hint("mov"), Some(ContainerFormat::QuickTime));
        assert_eq!(from_hint("text/plain"), None);

        assert_eq!(
            detect(&[0u8; 32], Some("clip.mp4")).unwrap(),
            ContainerFormat::Mp4
        );
    }

    #[test]
    fn test_magic_beats_hint() {
        assert_eq!(
            detect(&ftyp(b"isom"), Some("video/webm")).unwrap(),
            ContainerFormat::Mp4
        );
    }

    #[test]
    fn test_unknown_is_unsupported() {
        let err = detect(b"hello world", Some("notes.txt")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedFormat(_)));
    }
}
