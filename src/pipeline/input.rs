//! Upload validation: size cap, magic bytes, and an optional page-count hint.
//!
//! Checks run in a fixed order before anything touches the file system:
//! size first, so an oversized upload is rejected without even looking at
//! its contents, then the magic-byte signature, so the converter never sees
//! a file that cannot possibly be a PDF.

use crate::config::SessionConfig;
use crate::error::SessionError;
use once_cell::sync::Lazy;
use regex::bytes::Regex;
use tracing::debug;

/// Reject uploads that are too large or do not start with the expected magic.
pub fn validate_payload(bytes: &[u8], config: &SessionConfig) -> Result<(), SessionError> {
    if bytes.len() > config.max_upload_bytes {
        return Err(SessionError::PayloadTooLarge {
            size: bytes.len(),
            max: config.max_upload_bytes,
        });
    }

    let magic = config.input_magic.as_slice();
    if !bytes.starts_with(magic) {
        let head = &bytes[..bytes.len().min(magic.len().max(4))];
        return Err(SessionError::InvalidFormat {
            detail: format!(
                "expected upload to start with {:?}, first bytes: {:?}",
                String::from_utf8_lossy(magic),
                head
            ),
        });
    }

    debug!("Payload accepted: {} bytes", bytes.len());
    Ok(())
}

// `/Type /Page` but not `/Type /Pages`.
static RE_PAGE_OBJECT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"/Type\s*/Page(?-u:\b)").unwrap());

/// Best-effort page count from the raw PDF bytes.
///
/// Counts uncompressed page objects. PDFs that keep their page tree inside
/// compressed object streams yield `None`, in which case progress falls
/// back to the line-based heuristic.
pub fn estimate_page_count(bytes: &[u8]) -> Option<usize> {
    let count = RE_PAGE_OBJECT.find_iter(bytes).count();
    (count > 0).then_some(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max: usize) -> SessionConfig {
        SessionConfig::builder().max_upload_bytes(max).build().unwrap()
    }

    #[test]
    fn accepts_pdf_within_limit() {
        assert!(validate_payload(b"%PDF-1.7\n...", &config(1024)).is_ok());
    }

    #[test]
    fn rejects_oversized_before_magic_check() {
        let payload = vec![b'x'; 2048];
        let err = validate_payload(&payload, &config(1024)).unwrap_err();
        assert!(matches!(
            err,
            SessionError::PayloadTooLarge {
                size: 2048,
                max: 1024
            }
        ));
    }

    #[test]
    fn rejects_wrong_magic() {
        let payload = [b'A'; 40];
        let err = validate_payload(&payload, &config(1024)).unwrap_err();
        assert!(matches!(err, SessionError::InvalidFormat { .. }));
    }

    #[test]
    fn rejects_empty_and_truncated_payloads() {
        let cfg = config(1024);
        assert!(matches!(
            validate_payload(b"", &cfg),
            Err(SessionError::InvalidFormat { .. })
        ));
        assert!(matches!(
            validate_payload(b"%PD", &cfg),
            Err(SessionError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn limit_is_inclusive() {
        let mut payload = b"%PDF".to_vec();
        payload.resize(64, b' ');
        assert!(validate_payload(&payload, &config(64)).is_ok());
        payload.push(b' ');
        assert!(validate_payload(&payload, &config(64)).is_err());
    }

    #[test]
    fn page_count_ignores_page_tree_root() {
        let pdf = b"%PDF-1.4\n1 0 obj << /Type /Pages /Count 2 >>\n\
                    2 0 obj << /Type /Page >>\n3 0 obj << /Type/Page /Parent 1 0 R >>";
        assert_eq!(estimate_page_count(pdf), Some(2));
    }

    #[test]
    fn page_count_unknown_without_page_objects() {
        assert_eq!(estimate_page_count(b"%PDF-1.7 compressed"), None);
    }
}
