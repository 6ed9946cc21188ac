//! Content-sniff dispatch over the codec collaborators named in §9: the
//! worker never trusts a file extension (it only ever receives a bare fd,
//! never a path — §4.5) and instead looks at the first few KB of magic
//! bytes to pick a variant before handing the stream to Symphonia.
//!
//! Actually decoding each format is an external collaborator's job per
//! §1; this module only owns the sniff step and the small amount of
//! per-format metadata (container hint, display label) Symphonia's probe
//! wants to make that collaborator's job easier.

use std::io::Read;

/// The closed set of codec variants the worker recognizes (§9,
/// "Codec polymorphism"). Decoding itself is delegated to Symphonia;
/// `Opus` is sniffed and reported like the others, but Symphonia has no
/// built-in Opus decoder in this workspace's feature set, so a sniffed
/// Opus stream surfaces as a `Codec` error at decode time rather than
/// silently failing the sniff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Vorbis,
    Flac,
    Opus,
    Mp3,
}

impl Codec {
    /// Container/codec extension hint fed to Symphonia's probe so it
    /// doesn't have to guess blind (§4.5, "Dispatches on content-sniff").
    pub fn extension_hint(self) -> Option<&'static str> {
        match self {
            Codec::Vorbis | Codec::Opus => Some("ogg"),
            Codec::Flac => Some("flac"),
            Codec::Mp3 => Some("mp3"),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Codec::Vorbis => "vorbis",
            Codec::Flac => "flac",
            Codec::Opus => "opus",
            Codec::Mp3 => "mp3",
        }
    }
}

/// How many leading bytes of the source are inspected for magic markers.
/// Generous enough to find an Ogg stream's second page header, where the
/// `OpusHead`/`vorbis` identification packet actually lives.
const SNIFF_WINDOW: usize = 4096;

/// Sniff a codec variant from the first bytes of `reader` without
/// consuming more than [`SNIFF_WINDOW`] bytes from it logically — callers
/// pass a cheaply re-seekable source (a just-opened file) since this
/// reads ahead and the caller must seek back to the start afterward.
pub fn sniff(reader: &mut impl Read) -> Option<Codec> {
    let mut buf = [0u8; SNIFF_WINDOW];
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => break,
        }
    }
    sniff_bytes(&buf[..filled])
}

/// Pure magic-byte classifier, split out from [`sniff`] so it's testable
/// without a real fd.
pub fn sniff_bytes(bytes: &[u8]) -> Option<Codec> {
    if bytes.len() >= 4 && &bytes[0..4] == b"fLaC" {
        return Some(Codec::Flac);
    }

    if bytes.len() >= 4 && &bytes[0..4] == b"OggS" {
        if contains(bytes, b"OpusHead") {
            return Some(Codec::Opus);
        }
        if contains(bytes, b"vorbis") {
            return Some(Codec::Vorbis);
        }
        // Ogg container, unidentified payload: still a recognized
        // container shape but not one of our known codecs inside it.
        return None;
    }

    if bytes.len() >= 3 && &bytes[0..3] == b"ID3" {
        return Some(Codec::Mp3);
    }

    // Bare MPEG frame sync (11 set high bits) with no ID3 header, the
    // common case for a raw .mp3 with no leading tag.
    if bytes.len() >= 2 && bytes[0] == 0xFF && (bytes[1] & 0xE0) == 0xE0 {
        return Some(Codec::Mp3);
    }

    None
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_flac_magic() {
        let mut bytes = b"fLaC".to_vec();
        bytes.extend([0u8; 16]);
        assert_eq!(sniff_bytes(&bytes), Some(Codec::Flac));
    }

    #[test]
    fn sniffs_ogg_vorbis_identification_packet() {
        let mut bytes = b"OggS".to_vec();
        bytes.extend([0u8; 20]);
        bytes.extend(b"\x01vorbis");
        assert_eq!(sniff_bytes(&bytes), Some(Codec::Vorbis));
    }

    #[test]
    fn sniffs_ogg_opus_identification_packet() {
        let mut bytes = b"OggS".to_vec();
        bytes.extend([0u8; 20]);
        bytes.extend(b"OpusHead");
        assert_eq!(sniff_bytes(&bytes), Some(Codec::Opus));
    }

    #[test]
    fn sniffs_id3_tagged_mp3() {
        let bytes = b"ID3\x03\x00\x00\x00\x00\x00\x00".to_vec();
        assert_eq!(sniff_bytes(&bytes), Some(Codec::Mp3));
    }

    #[test]
    fn sniffs_bare_mpeg_frame_sync() {
        let bytes = [0xFF, 0xFB, 0x90, 0x00];
        assert_eq!(sniff_bytes(&bytes), Some(Codec::Mp3));
    }

    #[test]
    fn unknown_format_returns_none() {
        let bytes = b"RIFF....WAVEfmt ".to_vec();
        assert_eq!(sniff_bytes(&bytes), None);
    }

    #[test]
    fn ogg_container_with_unknown_payload_returns_none() {
        let mut bytes = b"OggS".to_vec();
        bytes.extend([0u8; 40]);
        assert_eq!(sniff_bytes(&bytes), None);
    }
}
