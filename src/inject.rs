//! Compression-aware HTML script injection with ETag coherence.
//!
//! HTML responses of tunnels that declare injects are rewritten on the
//! fly: the configured `<script>` tags are inserted immediately before the
//! closing body marker (or appended when the document never closes its
//! body), transparently decoding and re-encoding gzip/deflate/brotli.
//! Because the bytes change, the origin's ETag gets a deterministic suffix
//! derived from the injected markup; the same suffix is stripped from
//! conditional request headers on the way in, keeping conditional GETs
//! correct end to end.
//!
//! The transform is push-based and incremental: the proxy feeds it one
//! body chunk at a time and streams whatever is ready, so a response is
//! never buffered in full.

use std::io::Write;
use std::sync::{Arc, Mutex};

use flate2::write::{GzDecoder, GzEncoder, ZlibDecoder, ZlibEncoder};
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::error::GatewayError;
use crate::tunnel::ScriptInjection;

/// Content codings the injector can transcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCoder {
    Identity,
    Gzip,
    Deflate,
    Brotli,
}

impl ContentCoder {
    /// Parse a `Content-Encoding` header value.
    ///
    /// Anything else is a configuration error for an injecting tunnel:
    /// passing bytes through unmodified would silently skip the injection.
    pub fn parse(header: Option<&str>) -> Result<Self, GatewayError> {
        match header.map(|h| h.trim().to_ascii_lowercase()).as_deref() {
            None | Some("") | Some("identity") => Ok(ContentCoder::Identity),
            Some("gzip") | Some("x-gzip") => Ok(ContentCoder::Gzip),
            Some("deflate") => Ok(ContentCoder::Deflate),
            Some("br") => Ok(ContentCoder::Brotli),
            Some(other) => Err(GatewayError::UnsupportedEncoding(other.to_string())),
        }
    }
}

/// Render the combined markup for a tunnel's injections.
pub fn render_tags(injects: &[ScriptInjection]) -> String {
    injects.iter().map(|i| i.to_tag()).collect()
}

/// Deterministic ETag suffix for a set of injected tags.
pub fn etag_suffix(tags_html: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(tags_html.as_bytes());
    let hash = hasher.finalize();
    format!("-inj{}", hex::encode(&hash[..6]))
}

/// Append the suffix to an origin ETag, preserving quoting and weakness.
pub fn decorate_etag(etag: &str, suffix: &str) -> String {
    if let Some(stripped) = etag.strip_suffix('"') {
        format!("{}{}\"", stripped, suffix)
    } else {
        format!("{}{}", etag, suffix)
    }
}

/// Strip the suffix from a conditional header value (`If-Match` /
/// `If-None-Match`), restoring the origin-issued ETags exactly. Entries
/// without the suffix pass through untouched.
pub fn strip_conditional(value: &str, suffix: &str) -> String {
    value
        .split(',')
        .map(|entry| {
            let entry = entry.trim();
            if let Some(stripped) = entry.strip_suffix('"') {
                if let Some(without) = stripped.strip_suffix(suffix) {
                    return format!("{}\"", without);
                }
            } else if let Some(without) = entry.strip_suffix(suffix) {
                return without.to_string();
            }
            entry.to_string()
        })
        .collect::<Vec<_>>()
        .join(", ")
}

const BODY_CLOSE: &[u8] = b"</body>";

/// Incremental `</body>` scanner.
///
/// Holds back at most `len(needle) - 1` bytes between chunks so a marker
/// split across chunk boundaries is still found.
pub struct HtmlInjector {
    tags: Vec<u8>,
    pending: Vec<u8>,
    injected: bool,
}

impl HtmlInjector {
    pub fn new(tags_html: &str) -> Self {
        Self {
            tags: tags_html.as_bytes().to_vec(),
            pending: Vec::new(),
            injected: false,
        }
    }

    /// Feed one decoded chunk, returning the bytes ready to emit.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        if self.injected {
            return chunk.to_vec();
        }

        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(chunk);

        if let Some(pos) = find_ci(&data, BODY_CLOSE) {
            let mut out = Vec::with_capacity(data.len() + self.tags.len());
            out.extend_from_slice(&data[..pos]);
            out.extend_from_slice(&self.tags);
            out.extend_from_slice(&data[pos..]);
            self.injected = true;
            return out;
        }

        // Keep the longest tail that could still become the marker.
        let hold = longest_partial_suffix(&data, BODY_CLOSE);
        let emit_len = data.len() - hold;
        self.pending = data.split_off(emit_len);
        data
    }

    /// Flush held-back bytes; append the tags when no marker was seen.
    pub fn finish(&mut self) -> Vec<u8> {
        let mut out = std::mem::take(&mut self.pending);
        if !self.injected {
            out.extend_from_slice(&self.tags);
            self.injected = true;
        }
        out
    }
}

fn find_ci(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    (0..=haystack.len() - needle.len())
        .find(|&i| haystack[i..i + needle.len()].eq_ignore_ascii_case(needle))
}

fn longest_partial_suffix(data: &[u8], needle: &[u8]) -> usize {
    let max = needle.len().saturating_sub(1).min(data.len());
    for len in (1..=max).rev() {
        if data[data.len() - len..].eq_ignore_ascii_case(&needle[..len]) {
            return len;
        }
    }
    0
}

/// Shared byte sink the codec writers drain into; lets us recover output
/// even from writers that only finalize on drop (brotli).
#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut self.0.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

enum Decoder {
    Identity(SharedBuf),
    Gzip(GzDecoder<SharedBuf>, SharedBuf),
    Deflate(ZlibDecoder<SharedBuf>, SharedBuf),
    Brotli(Box<brotli::DecompressorWriter<SharedBuf>>, SharedBuf),
}

impl Decoder {
    fn new(coder: ContentCoder) -> Self {
        let buf = SharedBuf::default();
        match coder {
            ContentCoder::Identity => Decoder::Identity(buf),
            ContentCoder::Gzip => Decoder::Gzip(GzDecoder::new(buf.clone()), buf),
            ContentCoder::Deflate => Decoder::Deflate(ZlibDecoder::new(buf.clone()), buf),
            ContentCoder::Brotli => Decoder::Brotli(
                Box::new(brotli::DecompressorWriter::new(buf.clone(), 4096)),
                buf,
            ),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> std::io::Result<Vec<u8>> {
        match self {
            Decoder::Identity(buf) => {
                buf.write_all(chunk)?;
                Ok(buf.take())
            }
            Decoder::Gzip(w, buf) => {
                w.write_all(chunk)?;
                w.flush()?;
                Ok(buf.take())
            }
            Decoder::Deflate(w, buf) => {
                w.write_all(chunk)?;
                w.flush()?;
                Ok(buf.take())
            }
            Decoder::Brotli(w, buf) => {
                w.write_all(chunk)?;
                w.flush()?;
                Ok(buf.take())
            }
        }
    }

    fn finish(self) -> std::io::Result<Vec<u8>> {
        match self {
            Decoder::Identity(buf) => Ok(buf.take()),
            Decoder::Gzip(w, buf) => {
                w.finish()?;
                Ok(buf.take())
            }
            Decoder::Deflate(w, buf) => {
                w.finish()?;
                Ok(buf.take())
            }
            Decoder::Brotli(w, buf) => {
                drop(w);
                Ok(buf.take())
            }
        }
    }
}

enum Encoder {
    Identity(SharedBuf),
    Gzip(GzEncoder<SharedBuf>, SharedBuf),
    Deflate(ZlibEncoder<SharedBuf>, SharedBuf),
    Brotli(Box<brotli::CompressorWriter<SharedBuf>>, SharedBuf),
}

impl Encoder {
    fn new(coder: ContentCoder) -> Self {
        let buf = SharedBuf::default();
        match coder {
            ContentCoder::Identity => Encoder::Identity(buf),
            ContentCoder::Gzip => Encoder::Gzip(
                GzEncoder::new(buf.clone(), Compression::default()),
                buf,
            ),
            ContentCoder::Deflate => Encoder::Deflate(
                ZlibEncoder::new(buf.clone(), Compression::default()),
                buf,
            ),
            ContentCoder::Brotli => Encoder::Brotli(
                Box::new(brotli::CompressorWriter::new(buf.clone(), 4096, 5, 22)),
                buf,
            ),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> std::io::Result<Vec<u8>> {
        if chunk.is_empty() {
            return Ok(Vec::new());
        }
        match self {
            Encoder::Identity(buf) => {
                buf.write_all(chunk)?;
                Ok(buf.take())
            }
            Encoder::Gzip(w, buf) => {
                w.write_all(chunk)?;
                Ok(buf.take())
            }
            Encoder::Deflate(w, buf) => {
                w.write_all(chunk)?;
                Ok(buf.take())
            }
            Encoder::Brotli(w, buf) => {
                w.write_all(chunk)?;
                Ok(buf.take())
            }
        }
    }

    fn finish(self) -> std::io::Result<Vec<u8>> {
        match self {
            Encoder::Identity(buf) => Ok(buf.take()),
            Encoder::Gzip(w, buf) => {
                w.finish()?;
                Ok(buf.take())
            }
            Encoder::Deflate(w, buf) => {
                w.finish()?;
                Ok(buf.take())
            }
            Encoder::Brotli(w, buf) => {
                drop(w);
                Ok(buf.take())
            }
        }
    }
}

/// The full decode → inject → re-encode pipeline for one response body.
pub struct InjectTransform {
    decoder: Option<Decoder>,
    injector: HtmlInjector,
    encoder: Option<Encoder>,
}

impl InjectTransform {
    pub fn new(coder: ContentCoder, tags_html: &str) -> Self {
        Self {
            decoder: Some(Decoder::new(coder)),
            injector: HtmlInjector::new(tags_html),
            encoder: Some(Encoder::new(coder)),
        }
    }

    /// Feed one wire chunk; returns re-encoded bytes ready to send.
    pub fn push(&mut self, chunk: &[u8]) -> std::io::Result<Vec<u8>> {
        let decoder = self
            .decoder
            .as_mut()
            .ok_or_else(|| std::io::Error::other("transform already finished"))?;
        let encoder = self
            .encoder
            .as_mut()
            .ok_or_else(|| std::io::Error::other("transform already finished"))?;

        let decoded = decoder.push(chunk)?;
        let injected = self.injector.feed(&decoded);
        encoder.push(&injected)
    }

    /// Flush all stages; must be called exactly once at end of body.
    pub fn finish(&mut self) -> std::io::Result<Vec<u8>> {
        let decoder = self
            .decoder
            .take()
            .ok_or_else(|| std::io::Error::other("transform already finished"))?;
        let mut encoder = self
            .encoder
            .take()
            .ok_or_else(|| std::io::Error::other("transform already finished"))?;

        let decoded_tail = decoder.finish()?;
        let mut out = self.injector.feed(&decoded_tail);
        out.extend_from_slice(&self.injector.finish());

        let mut encoded = encoder.push(&out)?;
        encoded.extend_from_slice(&encoder.finish()?);
        Ok(encoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn tag() -> ScriptInjection {
        ScriptInjection {
            src: "https://cdn.example.com/w.js".into(),
            defer: false,
            r#async: false,
        }
    }

    fn run_transform(coder: ContentCoder, input: &[u8], chunk_size: usize) -> Vec<u8> {
        let tags = render_tags(&[tag()]);
        let mut t = InjectTransform::new(coder, &tags);
        let mut out = Vec::new();
        for chunk in input.chunks(chunk_size) {
            out.extend_from_slice(&t.push(chunk).unwrap());
        }
        out.extend_from_slice(&t.finish().unwrap());
        out
    }

    #[test]
    fn test_inject_before_body_close() {
        let html = b"<html><body><p>hi</p></body></html>";
        let out = run_transform(ContentCoder::Identity, html, html.len());
        let expected = format!(
            "<html><body><p>hi</p>{}</body></html>",
            render_tags(&[tag()])
        );
        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }

    #[test]
    fn test_inject_marker_split_across_chunks() {
        let html = b"<html><body><p>hi</p></body></html>";
        // Chunk sizes chosen to split "</body>" at every possible point.
        for chunk_size in 1..html.len() {
            let out = run_transform(ContentCoder::Identity, html, chunk_size);
            let expected = format!(
                "<html><body><p>hi</p>{}</body></html>",
                render_tags(&[tag()])
            );
            assert_eq!(String::from_utf8(out).unwrap(), expected, "chunk={}", chunk_size);
        }
    }

    #[test]
    fn test_inject_appends_when_no_body_close() {
        let html = b"<html><body><p>never closed";
        let out = run_transform(ContentCoder::Identity, html, 7);
        let expected = format!("<html><body><p>never closed{}", render_tags(&[tag()]));
        assert_eq!(String::from_utf8(out).unwrap(), expected);
    }

    #[test]
    fn test_inject_case_insensitive_marker() {
        let html = b"<HTML><BODY>x</BODY></HTML>";
        let out = run_transform(ContentCoder::Identity, html, html.len());
        let s = String::from_utf8(out).unwrap();
        assert!(s.contains(&format!("{}</BODY>", render_tags(&[tag()]))));
    }

    #[test]
    fn test_gzip_round_trip() {
        let html = b"<html><body>content</body></html>";
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(html).unwrap();
        let compressed = enc.finish().unwrap();

        let out = run_transform(ContentCoder::Gzip, &compressed, 11);

        let mut decoder = flate2::read::GzDecoder::new(&out[..]);
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert_eq!(
            decompressed,
            format!("<html><body>content{}</body></html>", render_tags(&[tag()]))
        );
    }

    #[test]
    fn test_unsupported_encoding_rejected() {
        let err = ContentCoder::parse(Some("zstd")).unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedEncoding(_)));
        assert!(ContentCoder::parse(Some("gzip")).is_ok());
        assert!(ContentCoder::parse(None).is_ok());
    }

    #[test]
    fn test_etag_round_trip() {
        let tags = render_tags(&[tag()]);
        let suffix = etag_suffix(&tags);

        let origin = "\"abc123\"";
        let decorated = decorate_etag(origin, &suffix);
        assert_ne!(decorated, origin);
        assert!(decorated.ends_with('"'));

        // Conditional header carrying the decorated value restores exactly.
        assert_eq!(strip_conditional(&decorated, &suffix), origin);

        // Weak ETags keep their marker.
        let weak = "W/\"abc123\"";
        assert_eq!(strip_conditional(&decorate_etag(weak, &suffix), &suffix), weak);

        // Values without the suffix are untouched.
        assert_eq!(strip_conditional("\"other\"", &suffix), "\"other\"");

        // Lists are handled entry-wise.
        let list = format!("{}, \"plain\"", decorated);
        assert_eq!(strip_conditional(&list, &suffix), "\"abc123\", \"plain\"");
    }

    #[test]
    fn test_etag_suffix_deterministic() {
        let tags = render_tags(&[tag()]);
        assert_eq!(etag_suffix(&tags), etag_suffix(&tags));
        assert_ne!(etag_suffix(&tags), etag_suffix("<script></script>"));
    }
}
