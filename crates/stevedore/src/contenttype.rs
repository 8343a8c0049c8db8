//! Content-type detection for uploads: a 512-byte magic sniff with a
//! plain-text fallback.

use std::path::Path;

use tokio::io::AsyncReadExt;

const SNIFF_LEN: usize = 512;

/// Read the first bytes of `path` and infer a content type. Returns `None`
/// when the file cannot be read or is empty; uploads then carry no
/// content-type header.
pub(crate) async fn detect(path: &Path) -> Option<String> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    let mut buf = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < SNIFF_LEN {
        match file.read(&mut buf[filled..]).await {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(_) => return None,
        }
    }
    sniff(&buf[..filled]).map(|mime| mime.to_string())
}

fn sniff(buf: &[u8]) -> Option<mime::Mime> {
    if buf.is_empty() {
        return None;
    }

    let magic: &[(&[u8], mime::Mime)] = &[
        (b"\x89PNG\r\n\x1a\n", mime::IMAGE_PNG),
        (b"\xFF\xD8\xFF", mime::IMAGE_JPEG),
        (b"GIF87a", mime::IMAGE_GIF),
        (b"GIF89a", mime::IMAGE_GIF),
        (b"%PDF-", mime::APPLICATION_PDF),
    ];
    for (prefix, mime) in magic {
        if buf.starts_with(prefix) {
            return Some(mime.clone());
        }
    }
    if buf.starts_with(b"PK\x03\x04") {
        return "application/zip".parse().ok();
    }
    if buf.starts_with(b"\x1f\x8b") {
        return "application/gzip".parse().ok();
    }

    if let Ok(text) = std::str::from_utf8(buf) {
        let head = text.trim_start();
        if starts_with_ignore_case(head, "<!DOCTYPE html") || starts_with_ignore_case(head, "<html")
        {
            return Some(mime::TEXT_HTML);
        }
        return Some(mime::TEXT_PLAIN_UTF_8);
    }
    Some(mime::APPLICATION_OCTET_STREAM)
}

fn starts_with_ignore_case(haystack: &str, prefix: &str) -> bool {
    haystack
        .get(..prefix.len())
        .is_some_and(|head| head.eq_ignore_ascii_case(prefix))
}
