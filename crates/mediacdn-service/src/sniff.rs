//! Media type detection for stored and served files.
//!
//! Detection looks at the leading bytes first, falls back to the file extension and finally to a
//! plain-text heuristic. Anything else is [`OCTET_STREAM`].

use std::io::{self, SeekFrom};

use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// How many leading bytes are inspected.
pub const SNIFF_LEN: usize = 512;

/// The media type used whenever nothing better is known.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Signatures at offset 0.
const PREFIX_SIGNATURES: &[(&[u8], &str)] = &[
    (b"%PDF-", "application/pdf"),
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"II*\0", "image/tiff"),
    (b"MM\0*", "image/tiff"),
    (b"\x1a\x45\xdf\xa3", "video/x-matroska"),
    (b"OggS", "application/ogg"),
    (b"fLaC", "audio/flac"),
    (b"ID3", "audio/mpeg"),
    (b"\xff\xfb", "audio/mpeg"),
    (b"\xff\xf3", "audio/mpeg"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x1f\x8b", "application/gzip"),
];

fn sniff_magic(head: &[u8]) -> Option<&'static str> {
    if let Some((_, mime)) = PREFIX_SIGNATURES
        .iter()
        .find(|(magic, _)| head.starts_with(magic))
    {
        return Some(*mime);
    }

    // RIFF containers carry their format at offset 8.
    if head.len() >= 12 && head.starts_with(b"RIFF") {
        return match &head[8..12] {
            b"WEBP" => Some("image/webp"),
            b"WAVE" => Some("audio/wav"),
            b"AVI " => Some("video/x-msvideo"),
            _ => None,
        };
    }

    // ISO base media files start with a size-prefixed `ftyp` box.
    if head.len() >= 12 && &head[4..8] == b"ftyp" {
        return match &head[8..12] {
            b"qt  " => Some("video/quicktime"),
            b"M4A " | b"M4B " => Some("audio/mp4"),
            _ => Some("video/mp4"),
        };
    }

    None
}

fn looks_like_text(head: &[u8]) -> bool {
    if head.is_empty() {
        return false;
    }
    let text = match std::str::from_utf8(head) {
        Ok(text) => text,
        // a multi-byte sequence may be cut off at the end of the sniffed window
        Err(e) if e.error_len().is_none() => {
            match std::str::from_utf8(&head[..e.valid_up_to()]) {
                Ok(text) => text,
                Err(_) => return false,
            }
        }
        Err(_) => return false,
    };
    !text
        .chars()
        .any(|c| c.is_control() && !matches!(c, '\t' | '\n' | '\r' | '\x0c'))
}

/// Detects the media type from the leading bytes `head` of a file called `filename`.
pub fn sniff(head: &[u8], filename: &str) -> String {
    if let Some(mime) = sniff_magic(head) {
        return mime.to_owned();
    }
    if let Some(mime) = mime_guess::from_path(filename).first_raw() {
        return mime.to_owned();
    }
    let mime = if looks_like_text(head) {
        "text/plain"
    } else {
        OCTET_STREAM
    };
    mime.to_owned()
}

/// Detects the media type of an open file from its head.
///
/// The file is rewound to its start afterwards, ready to be streamed.
pub async fn sniff_file(file: &mut tokio::fs::File, filename: &str) -> io::Result<String> {
    let mut head = Vec::with_capacity(SNIFF_LEN);
    (&mut *file)
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut head)
        .await?;
    file.seek(SeekFrom::Start(0)).await?;
    Ok(sniff(&head, filename))
}
