//! Request body decompression.
//!
//! Agents may gzip log pushes (`Content-Encoding: gzip`); zstd is accepted
//! as well. Output is capped so a small compressed body cannot expand
//! without bound.

use async_compression::tokio::bufread::{GzipDecoder, ZstdDecoder};
use axum::http::HeaderMap;
use axum::http::header::CONTENT_ENCODING;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Content encoding of a request body.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContentEncoding {
    Identity,
    Gzip,
    Zstd,
}

impl ContentEncoding {
    /// Read the encoding from request headers. Unknown encodings are `None`.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let Some(value) = headers.get(CONTENT_ENCODING) else {
            return Some(Self::Identity);
        };
        match value.to_str().ok()?.trim().to_ascii_lowercase().as_str() {
            "" | "identity" => Some(Self::Identity),
            "gzip" | "x-gzip" => Some(Self::Gzip),
            "zstd" => Some(Self::Zstd),
            _ => None,
        }
    }
}

/// Errors while decoding a request body.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("unsupported content encoding")]
    Unsupported,

    #[error("decompressed body exceeds {0} bytes")]
    TooLarge(usize),

    #[error("corrupt compressed body: {0}")]
    Corrupt(#[from] std::io::Error),
}

/// Decode `body` according to `encoding`, refusing output above `limit`.
pub async fn decode_body(
    encoding: ContentEncoding,
    body: Bytes,
    limit: usize,
) -> Result<Bytes, DecodeError> {
    match encoding {
        ContentEncoding::Identity => {
            if body.len() > limit {
                return Err(DecodeError::TooLarge(limit));
            }
            Ok(body)
        }
        ContentEncoding::Gzip => read_limited(GzipDecoder::new(&body[..]), limit).await,
        ContentEncoding::Zstd => read_limited(ZstdDecoder::new(&body[..]), limit).await,
    }
}

async fn read_limited<R>(decoder: R, limit: usize) -> Result<Bytes, DecodeError>
where
    R: AsyncRead + Unpin,
{
    let mut out = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .await?;
    if out.len() > limit {
        return Err(DecodeError::TooLarge(limit));
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::write::{GzipEncoder, ZstdEncoder};
    use axum::http::HeaderValue;
    use tokio::io::AsyncWriteExt;

    async fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(data).await.unwrap();
        encoder.shutdown().await.unwrap();
        encoder.into_inner()
    }

    #[test]
    fn test_encoding_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            ContentEncoding::from_headers(&headers),
            Some(ContentEncoding::Identity)
        );
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("GZIP"));
        assert_eq!(
            ContentEncoding::from_headers(&headers),
            Some(ContentEncoding::Gzip)
        );
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("br"));
        assert_eq!(ContentEncoding::from_headers(&headers), None);
    }

    #[tokio::test]
    async fn test_gzip_roundtrip() {
        let body = br#"{"node_key":"k","log_type":"status","data":[]}"#;
        let decoded = decode_body(ContentEncoding::Gzip, Bytes::from(gzip(body).await), 1024)
            .await
            .unwrap();
        assert_eq!(&decoded[..], &body[..]);
    }

    #[tokio::test]
    async fn test_zstd_decodes() {
        let mut encoder = ZstdEncoder::new(Vec::new());
        encoder.write_all(b"hello").await.unwrap();
        encoder.shutdown().await.unwrap();
        let decoded = decode_body(ContentEncoding::Zstd, Bytes::from(encoder.into_inner()), 16)
            .await
            .unwrap();
        assert_eq!(&decoded[..], b"hello");
    }

    #[tokio::test]
    async fn test_expansion_is_capped() {
        let compressed = gzip(&vec![b'a'; 64 * 1024]).await;
        let err = decode_body(ContentEncoding::Gzip, Bytes::from(compressed), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, DecodeError::TooLarge(1024)));
    }

    #[tokio::test]
    async fn test_corrupt_gzip_rejected() {
        let err = decode_body(
            ContentEncoding::Gzip,
            Bytes::from_static(b"definitely not gzip"),
            1024,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, DecodeError::Corrupt(_)));
    }
}
