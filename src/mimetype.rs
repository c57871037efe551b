//! Mimetype guessing for stored files.
//!
//! The path's extension wins when it maps to a known type. Otherwise the
//! first bytes of content are inspected for a handful of common signatures,
//! and anything else is classified as text or binary.

/// Number of leading content bytes consulted when the extension is unknown
pub const SNIFF_LEN: usize = 512;

const TEXT_PLAIN: &str = "text/plain";
const OCTET_STREAM: &str = "application/octet-stream";

const SIGNATURES: &[(&[u8], &str)] = &[
    (b"\x89PNG\r\n\x1a\n", "image/png"),
    (b"\xff\xd8\xff", "image/jpeg"),
    (b"GIF87a", "image/gif"),
    (b"GIF89a", "image/gif"),
    (b"%PDF-", "application/pdf"),
    (b"\x1f\x8b", "application/gzip"),
    (b"PK\x03\x04", "application/zip"),
    (b"\x28\xb5\x2f\xfd", "application/zstd"),
];

/// Guess the mimetype of `path` whose content starts with `head`
pub fn guess(path: &str, head: &[u8]) -> String {
    if let Some(mime) = mime_guess::from_path(path).first_raw() {
        return mime.to_string();
    }
    sniff(head).to_string()
}

fn sniff(head: &[u8]) -> &'static str {
    let head = &head[..head.len().min(SNIFF_LEN)];

    for (magic, mime) in SIGNATURES {
        if head.starts_with(magic) {
            return mime;
        }
    }

    if head.contains(&0) {
        return OCTET_STREAM;
    }
    match std::str::from_utf8(head) {
        Ok(_) => TEXT_PLAIN,
        // A multi-byte character cut off by the sniff window is still text
        Err(e) if e.error_len().is_none() => TEXT_PLAIN,
        Err(_) => OCTET_STREAM,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_wins() {
        assert_eq!(guess("/docs/readme.txt", b"\x89PNG\r\n\x1a\n"), "text/plain");
        assert_eq!(guess("/img/logo.png", b""), "image/png");
        assert_eq!(guess("/data/report.json", b"{}"), "application/json");
    }

    #[test]
    fn test_sniff_signatures() {
        assert_eq!(guess("/blob", b"\x89PNG\r\n\x1a\n...."), "image/png");
        assert_eq!(guess("/blob", b"%PDF-1.7\n"), "application/pdf");
        assert_eq!(guess("/blob", b"\x1f\x8b\x08\x00"), "application/gzip");
    }

    #[test]
    fn test_text_or_binary() {
        assert_eq!(guess("/notes", b"plain words here"), "text/plain");
        assert_eq!(guess("/empty", b""), "text/plain");
        assert_eq!(guess("/bin", &[0x01, 0x00, 0x02]), "application/octet-stream");
        assert_eq!(guess("/bad", &[0xff, 0xfe, 0x41, 0x80]), "application/octet-stream");

        // "é" is 0xc3 0xa9; cutting it in half at the window edge is fine
        let mut head = vec![b'a'; SNIFF_LEN - 1];
        head.extend_from_slice("é".as_bytes());
        assert_eq!(guess("/long", &head), "text/plain");
    }
}
