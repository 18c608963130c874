//! Streaming HLS (M3U8) playlist rewriting.
//!
//! Every resource a playlist references, whether a bare segment line or a
//! `URI="..."` tag attribute, is replaced with a link back through the
//! gateway: `<proxy_origin>/?url=<form-encoded absolute URL>`. The body is
//! processed one line at a time so memory stays bounded by [`MAX_LINE`]
//! regardless of playlist size.

use std::borrow::Cow;

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use thiserror::Error;
use url::{form_urlencoded, Url};

/// Longest accepted playlist line, excluding the terminator.
pub const MAX_LINE: usize = 1024 * 1024;

const URI_ATTR: &str = "URI=\"";

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum RewriteError {
    #[error("playlist line exceeds {MAX_LINE} bytes")]
    LineTooLong,
    #[error("reading upstream playlist failed: {0}")]
    Body(#[source] BoxError),
}

/// Per-request rewrite parameters derived from the playlist URL.
#[derive(Debug, Clone)]
pub struct RewriteContext {
    scheme: String,
    authority: String,
    base_dir: String,
    proxy_origin: String,
}

impl RewriteContext {
    pub fn new(base: &Url, proxy_origin: impl Into<String>) -> Self {
        let host = base.host_str().unwrap_or_default();
        let authority = match base.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };
        let path = base.path();
        let base_dir = match path.rfind('/') {
            Some(idx) => path[..=idx].to_string(),
            None => "/".to_string(),
        };
        Self {
            scheme: base.scheme().to_string(),
            authority,
            base_dir,
            proxy_origin: proxy_origin.into(),
        }
    }

    /// Turn a playlist reference into an absolute URL.
    pub fn resolve(&self, reference: &str) -> String {
        let mut absolute = self.prefix_for(reference.as_bytes());
        absolute.push_str(reference);
        absolute
    }

    // What has to precede `reference` to make it absolute.
    fn prefix_for(&self, reference: &[u8]) -> String {
        if has_scheme(reference) {
            String::new()
        } else if reference.starts_with(b"//") {
            format!("{}:", self.scheme)
        } else if reference.starts_with(b"/") {
            format!("{}://{}", self.scheme, self.authority)
        } else {
            format!("{}://{}{}", self.scheme, self.authority, self.base_dir)
        }
    }

    /// Link that routes `absolute` back through the gateway.
    pub fn proxy_link(&self, absolute: &str) -> String {
        self.link(absolute.as_bytes())
    }

    fn link(&self, absolute: &[u8]) -> String {
        let encoded: String = form_urlencoded::byte_serialize(absolute).collect();
        format!("{}/?url={}", self.proxy_origin, encoded)
    }

    // Resource names are opaque bytes; they need not be UTF-8.
    fn link_raw(&self, reference: &[u8]) -> String {
        let mut absolute = self.prefix_for(reference).into_bytes();
        absolute.extend_from_slice(reference);
        self.link(&absolute)
    }

    /// Rewrite a single playlist line (without its terminator).
    pub fn rewrite_line<'a>(&self, line: &'a str) -> Cow<'a, str> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Cow::Borrowed(line);
        }
        if trimmed.starts_with('#') {
            if trimmed.contains(URI_ATTR) {
                return Cow::Owned(self.rewrite_tag(line));
            }
            return Cow::Borrowed(line);
        }
        Cow::Owned(self.proxy_link(&self.resolve(trimmed)))
    }

    // Only the quoted URI values change; an opening `URI="` with no closing
    // quote is copied through as-is.
    fn rewrite_tag(&self, line: &str) -> String {
        let mut parts = line.split(URI_ATTR);
        let mut out = String::with_capacity(line.len() + 64);
        out.push_str(parts.next().unwrap_or_default());
        for part in parts {
            out.push_str(URI_ATTR);
            match part.find('"') {
                Some(end) => {
                    out.push_str(&self.proxy_link(&self.resolve(&part[..end])));
                    out.push_str(&part[end..]);
                }
                None => out.push_str(part),
            }
        }
        out
    }

    fn rewrite_into(&self, raw: &[u8], out: &mut BytesMut) {
        let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
        match std::str::from_utf8(raw) {
            Ok(line) => out.extend_from_slice(self.rewrite_line(line).as_bytes()),
            Err(_) => {
                let trimmed = raw.trim_ascii();
                if trimmed.is_empty() || trimmed.starts_with(b"#") {
                    out.extend_from_slice(raw);
                } else {
                    out.extend_from_slice(self.link_raw(trimmed).as_bytes());
                }
            }
        }
        out.put_u8(b'\n');
    }
}

/// RFC 3986 scheme prefix: `ALPHA *( ALPHA / DIGIT / "+" / "-" / "." ) ":"`.
fn has_scheme(reference: &[u8]) -> bool {
    let Some(colon) = reference.iter().position(|b| *b == b':') else {
        return false;
    };
    match reference[..colon].split_first() {
        Some((first, rest)) => {
            first.is_ascii_alphabetic()
                && rest
                    .iter()
                    .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'))
        }
        None => false,
    }
}

/// Line length as counted against [`MAX_LINE`]: a CR before the LF is part
/// of the terminator.
fn content_len(line: &[u8]) -> usize {
    line.len() - usize::from(line.last() == Some(&b'\r'))
}

/// Lazily rewrite a playlist body.
///
/// Each yielded chunk holds only complete rewritten lines. A body error
/// ends the stream with [`RewriteError::Body`] and nothing further is
/// emitted; a trailing line without a terminator is flushed at end of input.
pub fn rewrite_stream<S, E>(
    body: S,
    ctx: RewriteContext,
) -> impl Stream<Item = Result<Bytes, RewriteError>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError> + Send,
{
    async_stream::try_stream! {
        let mut body = std::pin::pin!(body);
        let mut pending = BytesMut::new();
        // Bytes of `pending` already known not to contain a newline.
        let mut scanned = 0;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| RewriteError::Body(e.into()))?;
            pending.extend_from_slice(&chunk);

            let mut out = BytesMut::new();
            while let Some(offset) = pending[scanned..].iter().position(|b| *b == b'\n') {
                let end = scanned + offset;
                if content_len(&pending[..end]) > MAX_LINE {
                    Err(RewriteError::LineTooLong)?;
                }
                let line = pending.split_to(end + 1);
                ctx.rewrite_into(&line[..end], &mut out);
                scanned = 0;
            }
            scanned = pending.len();
            if content_len(&pending) > MAX_LINE {
                Err(RewriteError::LineTooLong)?;
            }
            if !out.is_empty() {
                yield out.freeze();
            }
        }

        if !pending.is_empty() {
            let mut out = BytesMut::with_capacity(pending.len() + 64);
            ctx.rewrite_into(&pending, &mut out);
            yield out.freeze();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{stream, TryStreamExt};
    use std::io;

    const PROXY: &str = "https://gw.example";

    fn ctx() -> RewriteContext {
        let base = Url::parse("http://origin.example/videos/show/index.m3u8").unwrap();
        RewriteContext::new(&base, PROXY)
    }

    async fn rewrite_chunks(chunks: Vec<&'static [u8]>) -> Result<String, RewriteError> {
        let body = stream::iter(
            chunks
                .into_iter()
                .map(|c| Ok::<_, io::Error>(Bytes::from_static(c))),
        );
        let parts: Vec<Bytes> = rewrite_stream(body, ctx()).try_collect().await?;
        Ok(parts
            .iter()
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .collect())
    }

    #[test]
    fn test_resolve_absolute_unchanged() {
        assert_eq!(ctx().resolve("http://x/y.ts"), "http://x/y.ts");
        assert_eq!(ctx().resolve("https://cdn.example/a.ts"), "https://cdn.example/a.ts");
    }

    #[test]
    fn test_resolve_relative_forms() {
        let ctx = ctx();
        assert_eq!(ctx.resolve("//cdn.example/a.ts"), "http://cdn.example/a.ts");
        assert_eq!(ctx.resolve("/root/a.ts"), "http://origin.example/root/a.ts");
        assert_eq!(
            ctx.resolve("720p/seg.ts"),
            "http://origin.example/videos/show/720p/seg.ts"
        );
    }

    #[test]
    fn test_resolve_keeps_port() {
        let base = Url::parse("https://origin.example:8443/live/master.m3u8").unwrap();
        let ctx = RewriteContext::new(&base, PROXY);
        assert_eq!(ctx.resolve("low.m3u8"), "https://origin.example:8443/live/low.m3u8");
    }

    #[test]
    fn test_segment_line_rewritten() {
        assert_eq!(
            ctx().rewrite_line("segment1.ts"),
            "https://gw.example/?url=http%3A%2F%2Forigin.example%2Fvideos%2Fshow%2Fsegment1.ts"
        );
    }

    #[test]
    fn test_segment_line_trimmed() {
        assert_eq!(
            ctx().rewrite_line("  segment1.ts \t"),
            ctx().rewrite_line("segment1.ts")
        );
    }

    #[test]
    fn test_key_tag_only_uri_rewritten() {
        let line = ctx().rewrite_line(r#"#EXT-X-KEY:METHOD=AES-128,URI="key.bin",IV=0x0001"#);
        assert_eq!(
            line,
            "#EXT-X-KEY:METHOD=AES-128,URI=\"https://gw.example/?url=http%3A%2F%2Forigin.example%2Fvideos%2Fshow%2Fkey.bin\",IV=0x0001"
        );
    }

    #[test]
    fn test_multiple_uris_in_one_tag() {
        let line = ctx().rewrite_line(r#"#EXT-X-FAKE:URI="a.key",X=1,URI="/b.key""#);
        assert_eq!(
            line,
            "#EXT-X-FAKE:URI=\"https://gw.example/?url=http%3A%2F%2Forigin.example%2Fvideos%2Fshow%2Fa.key\",X=1,URI=\"https://gw.example/?url=http%3A%2F%2Forigin.example%2Fb.key\""
        );
    }

    #[test]
    fn test_unterminated_uri_untouched() {
        let line = r#"#EXT-X-KEY:METHOD=AES-128,URI="key.bin"#;
        assert_eq!(ctx().rewrite_line(line), line);
    }

    #[test]
    fn test_plain_tags_and_blank_lines_pass_through() {
        let ctx = ctx();
        assert!(matches!(ctx.rewrite_line("#EXTM3U"), Cow::Borrowed("#EXTM3U")));
        assert!(matches!(ctx.rewrite_line("#EXTINF:10.0,"), Cow::Borrowed(_)));
        assert!(matches!(ctx.rewrite_line("   "), Cow::Borrowed("   ")));
    }

    #[test]
    fn test_query_escaping() {
        let link = ctx().proxy_link("http://o.example/a b.ts?x=1&y=2");
        assert_eq!(
            link,
            "https://gw.example/?url=http%3A%2F%2Fo.example%2Fa+b.ts%3Fx%3D1%26y%3D2"
        );
    }

    #[test]
    fn test_has_scheme() {
        assert!(has_scheme(b"http://a"));
        assert!(has_scheme(b"skd://key-id"));
        assert!(has_scheme(b"data:text/plain,x"));
        assert!(!has_scheme(b"1abc:foo"));
        assert!(!has_scheme(b"seg.ts"));
        assert!(!has_scheme(b"/a:b"));
        assert!(!has_scheme(b":x"));
    }

    #[tokio::test]
    async fn test_stream_lines_split_across_chunks() {
        let out = rewrite_chunks(vec![
            b"#EXTM3U\r\n#EXTINF:10,\r\nseg",
            b"ment1.ts\r\n\r\n#EXT-X-ENDL",
            b"IST",
        ])
        .await
        .unwrap();
        assert_eq!(
            out,
            "#EXTM3U\n#EXTINF:10,\nhttps://gw.example/?url=http%3A%2F%2Forigin.example%2Fvideos%2Fshow%2Fsegment1.ts\n\n#EXT-X-ENDLIST\n"
        );
    }

    #[tokio::test]
    async fn test_stream_empty_body() {
        assert_eq!(rewrite_chunks(vec![]).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_stream_invalid_utf8_tag_passes_through() {
        let body = stream::iter(vec![Ok::<_, io::Error>(Bytes::from_static(
            b"#EXTM3U\n#X-\xff\xfe\n",
        ))]);
        let parts: Vec<Bytes> = rewrite_stream(body, ctx()).try_collect().await.unwrap();
        assert_eq!(parts.concat(), b"#EXTM3U\n#X-\xff\xfe\n".to_vec());
    }

    #[tokio::test]
    async fn test_stream_non_utf8_segment_rewritten() {
        let out = rewrite_chunks(vec![b"#EXTM3U\n  vid\xe9o.ts\r\n"]).await.unwrap();
        assert_eq!(
            out,
            "#EXTM3U\nhttps://gw.example/?url=http%3A%2F%2Forigin.example%2Fvideos%2Fshow%2Fvid%E9o.ts\n"
        );
    }

    #[tokio::test]
    async fn test_stream_crlf_not_counted_in_line_limit() {
        let mut line = vec![b'a'; MAX_LINE];
        line.extend_from_slice(b"\r\n");
        let body = stream::iter(vec![Ok::<_, io::Error>(Bytes::from(line))]);
        let parts: Vec<Bytes> = rewrite_stream(body, ctx()).try_collect().await.unwrap();
        assert!(parts.concat().ends_with(b"aaaa\n"));

        // CR arriving at the end of one chunk and LF at the start of the next.
        let mut head = vec![b'a'; MAX_LINE];
        head.push(b'\r');
        let body = stream::iter(vec![
            Ok::<_, io::Error>(Bytes::from(head)),
            Ok(Bytes::from_static(b"\n")),
        ]);
        let result: Result<Vec<Bytes>, _> = rewrite_stream(body, ctx()).try_collect().await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_stream_line_too_long() {
        let long = vec![b'a'; MAX_LINE + 1];
        let body = stream::iter(vec![Ok::<_, io::Error>(Bytes::from(long))]);
        let result: Result<Vec<Bytes>, _> = rewrite_stream(body, ctx()).try_collect().await;
        assert!(matches!(result, Err(RewriteError::LineTooLong)));

        let mut long = vec![b'a'; MAX_LINE + 1];
        long.extend_from_slice(b"\r\n");
        let body = stream::iter(vec![Ok::<_, io::Error>(Bytes::from(long))]);
        let result: Result<Vec<Bytes>, _> = rewrite_stream(body, ctx()).try_collect().await;
        assert!(matches!(result, Err(RewriteError::LineTooLong)));
    }

    #[tokio::test]
    async fn test_stream_body_error_aborts() {
        let body = stream::iter(vec![
            Ok(Bytes::from_static(b"#EXTM3U\nseg1.ts\nseg2")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")),
            Ok(Bytes::from_static(b".ts\n")),
        ]);
        let items: Vec<Result<Bytes, RewriteError>> = rewrite_stream(body, ctx()).collect().await;

        assert_eq!(items.len(), 2);
        let first = items[0].as_ref().unwrap();
        assert!(String::from_utf8_lossy(first).ends_with("seg1.ts\n"));
        assert!(matches!(items[1], Err(RewriteError::Body(_))));
    }
}
