//! Decoding of compressed response bodies.
//!
//! Bodies are buffered in full before a patcher sees them, so the decoders
//! here operate on complete byte slices rather than streams.

use flate2::read::{DeflateDecoder, MultiGzDecoder, ZlibDecoder};
use std::io::{self, Read};

/// Decodes a response body according to its `Content-Encoding` token.
///
/// `encoding` must already be lower-cased. Only `gzip` and `deflate` are
/// supported; these are the encodings the proxy advertises upstream.
pub fn decode_body(encoding: &str, body: &[u8]) -> io::Result<Vec<u8>> {
    match encoding {
        "gzip" => {
            let mut decoded = Vec::new();
            MultiGzDecoder::new(body).read_to_end(&mut decoded)?;
            Ok(decoded)
        }
        "deflate" => inflate(body),
        other => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported content encoding: {}", other),
        )),
    }
}

// Servers disagree on whether "deflate" means a zlib stream or a raw
// deflate stream. Try zlib first, then retry raw.
fn inflate(body: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoded = Vec::new();
    match ZlibDecoder::new(body).read_to_end(&mut decoded) {
        Ok(_) => Ok(decoded),
        Err(_) => {
            decoded.clear();
            DeflateDecoder::new(body).read_to_end(&mut decoded)?;
            Ok(decoded)
        }
    }
}
