//! Lazy file content for scripts
//!
//! Every declared [`FileReference`](scriptbox_common::FileReference) becomes a
//! proxy object in the script's globals with two accessors:
//!
//! - `readContentsAsync(mode)` returns a promise and never blocks the isolate.
//! - `readContents(mode)` blocks the script until the bytes arrive. Scripts may
//!   be fully synchronous, so this is a sync-over-async bridge: the fetch runs
//!   on the I/O runtime while the interpreter thread waits on a channel (see
//!   [`proxy`]).
//!
//! Bytes come from a [`FileFetcher`]: the remote content server by default, or
//! the worker's local disk when the execution context sets `local_files`.

mod http;
mod local;
pub mod proxy;

use crate::error::FetchError;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use std::sync::Arc;

pub use http::HttpFileFetcher;
pub use local::LocalFileFetcher;
pub use proxy::{FileProxies, FileProxyEntry};

/// Number of leading bytes inspected when auto-detecting binary content
pub const SNIFF_LEN: usize = 1024;

/// Source of file bytes for proxies
#[async_trait]
pub trait FileFetcher: Send + Sync {
    /// Retrieve the full contents stored at `location`
    async fn fetch(&self, location: &str) -> Result<Bytes, FetchError>;

    /// Get fetcher name
    fn name(&self) -> &str;
}

/// How the script wants file bytes serialized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentMode {
    /// Base64 text
    Binary,
    /// UTF-8 text; invalid sequences become U+FFFD
    Text,
    /// Pick `Binary` or `Text` from the leading bytes
    Auto,
}

impl ContentMode {
    /// Parse the mode argument passed by the script. Anything other than
    /// `binary` or `text` (including no argument) auto-detects.
    pub fn parse(mode: &str) -> Self {
        match mode {
            "binary" => ContentMode::Binary,
            "text" => ContentMode::Text,
            _ => ContentMode::Auto,
        }
    }
}

/// Serialize fetched bytes for the script according to `mode`
pub fn serialize_contents(bytes: &[u8], mode: ContentMode) -> String {
    let binary = match mode {
        ContentMode::Binary => true,
        ContentMode::Text => false,
        ContentMode::Auto => looks_binary(bytes),
    };

    if binary {
        base64::engine::general_purpose::STANDARD.encode(bytes)
    } else {
        String::from_utf8_lossy(bytes).into_owned()
    }
}

/// Decode the first [`SNIFF_LEN`] bytes as UTF-8 and report whether the
/// decoding produced a replacement character.
///
/// A multi-byte sequence cut by the sniff window is not a decode failure.
pub fn looks_binary(bytes: &[u8]) -> bool {
    let window = &bytes[..bytes.len().min(SNIFF_LEN)];
    let window = match std::str::from_utf8(window) {
        Err(e) if e.error_len().is_none() && bytes.len() > SNIFF_LEN => &window[..e.valid_up_to()],
        _ => window,
    };
    String::from_utf8_lossy(window).contains(char::REPLACEMENT_CHARACTER)
}

/// Remote and local fetchers, selected per execution
#[derive(Clone)]
pub struct FileSource {
    remote: Arc<dyn FileFetcher>,
    local: Arc<dyn FileFetcher>,
}

impl FileSource {
    pub fn new(remote: Arc<dyn FileFetcher>, local: Arc<dyn FileFetcher>) -> Self {
        Self { remote, local }
    }

    /// Pick the fetcher for an execution; `local_files` is the context flag
    pub fn select(&self, local_files: bool) -> Arc<dyn FileFetcher> {
        if local_files {
            Arc::clone(&self.local)
        } else {
            Arc::clone(&self.remote)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    #[async_trait]
    impl FileFetcher for Named {
        async fn fetch(&self, _location: &str) -> Result<Bytes, FetchError> {
            Ok(Bytes::from_static(b""))
        }

        fn name(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!(ContentMode::parse("binary"), ContentMode::Binary);
        assert_eq!(ContentMode::parse("text"), ContentMode::Text);
        assert_eq!(ContentMode::parse(""), ContentMode::Auto);
        assert_eq!(ContentMode::parse("hex"), ContentMode::Auto);
    }

    #[test]
    fn test_auto_detects_ascii_as_text() {
        let text = b"id,name\n1,alice\n";
        assert!(!looks_binary(text));
        assert_eq!(serialize_contents(text, ContentMode::Auto), "id,name\n1,alice\n");
    }

    #[test]
    fn test_auto_detects_invalid_utf8_as_binary() {
        let png = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a, 0xff, 0xfe];
        assert!(looks_binary(&png));
        let encoded = serialize_contents(&png, ContentMode::Auto);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(decoded, png);
    }

    #[test]
    fn test_binary_mode_round_trips() {
        let bytes: Vec<u8> = (0..=255).collect();
        let encoded = serialize_contents(&bytes, ContentMode::Binary);
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(decoded, bytes);
    }

    #[test]
    fn test_text_mode_is_lossy() {
        assert_eq!(serialize_contents(b"a\xffb", ContentMode::Text), "a\u{FFFD}b");
    }

    #[test]
    fn test_only_sniff_window_is_inspected() {
        let mut bytes = vec![b'a'; SNIFF_LEN];
        bytes.extend_from_slice(&[0xff, 0xfe]);
        assert!(!looks_binary(&bytes));
    }

    #[test]
    fn test_split_multibyte_char_at_window_edge_is_text() {
        let mut bytes = vec![b'a'; SNIFF_LEN - 1];
        bytes.extend_from_slice("é".as_bytes());
        assert!(!looks_binary(&bytes));
    }

    #[test]
    fn test_source_defaults_to_remote() {
        let source = FileSource::new(Arc::new(Named("remote")), Arc::new(Named("local")));
        assert_eq!(source.select(false).name(), "remote");
        assert_eq!(source.select(true).name(), "local");
    }
}
