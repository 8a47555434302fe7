//! Data-stream framing: preamble-wrapped request/response messages.
//!
//! Every data-stream message is the 6-byte stream signature, the two
//! version bytes `"01"`, and a single-segment codec message. Requests carry
//! a destination, a connection type and ordered `(key, val)` metadata;
//! responses carry an optional error text and the same metadata shape.
//! After the request/response exchange the stream is a raw byte pipe for
//! the proxied body.

use thiserror::Error;
use tracing::warn;

use crate::codec::{wire_message_size, CodecError, MessageBuilder, MessageReader};
use crate::{
    ConnectRequest, ConnectResponse, Metadata, DATA_STREAM_SIGNATURE, MAX_METADATA, STREAM_VERSION,
};

/// Preamble length: 6-byte signature + 2-byte version.
pub const PREAMBLE_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("bad framing: {0}")]
    BadFraming(&'static str),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Check the signature + version prefix. `false` also covers inputs shorter
/// than the preamble.
pub fn has_valid_preamble(bytes: &[u8]) -> bool {
    bytes.len() >= PREAMBLE_LEN
        && bytes[..6] == DATA_STREAM_SIGNATURE
        && bytes[6..8] == STREAM_VERSION
}

/// Total framed size (preamble + codec message) of the request at the head
/// of `bytes`, or 0 while incomplete. Bytes beyond that size are the
/// request body.
pub fn request_size(bytes: &[u8]) -> usize {
    if bytes.len() < PREAMBLE_LEN {
        return 0;
    }
    match wire_message_size(&bytes[PREAMBLE_LEN..]) {
        0 => 0,
        n => PREAMBLE_LEN + n,
    }
}

/// Parse a framed request.
///
/// The root struct has 1 data word (connection type, u16 at byte 0) and 2
/// pointers (`dest` text, metadata composite list of 2-pointer structs).
pub fn parse_request(bytes: &[u8]) -> Result<ConnectRequest, FramingError> {
    if bytes.len() < PREAMBLE_LEN {
        return Err(FramingError::BadFraming("short preamble"));
    }
    if bytes[..6] != DATA_STREAM_SIGNATURE {
        return Err(FramingError::BadFraming("bad signature"));
    }
    if bytes[6..8] != STREAM_VERSION {
        return Err(FramingError::BadFraming("unsupported version"));
    }

    let reader = MessageReader::new(&bytes[PREAMBLE_LEN..])?;
    let root = reader.struct_ptr(0)?;

    let mut request = ConnectRequest::default();
    if root.data_words >= 1 {
        request.conn_type = reader.u16_at(root.offset, 0);
    }
    if root.ptr_words >= 1 {
        let dest = reader.text(root.ptr(0))?;
        request.dest = String::from_utf8_lossy(dest).into_owned();
    }
    if root.ptr_words >= 2 {
        let list = reader.composite_list(root.ptr(1))?;
        for i in 0..list.count.min(MAX_METADATA) {
            let ptrs = list.element_ptr_section(i);
            let key = reader.text(ptrs)?;
            let val = reader.text(ptrs + 8)?;
            request.metadata.push(Metadata::new(
                String::from_utf8_lossy(key).into_owned(),
                String::from_utf8_lossy(val).into_owned(),
            ));
        }
    }
    Ok(request)
}

/// Encode a framed request. The counterpart of [`parse_request`]; the edge
/// side of the exchange, used by loopback tests and local tooling.
pub fn build_request(request: &ConnectRequest) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&DATA_STREAM_SIGNATURE);
    out.extend_from_slice(&STREAM_VERSION);

    let mut b = MessageBuilder::with_capacity(8192);
    let root = b.alloc(1)?;
    let req = b.alloc(1 + 2)?;
    b.write_struct_ptr(root, req, 1, 2);
    b.put_u16(req, request.conn_type);
    b.write_text(req + 8, &request.dest)?;
    write_metadata(&mut b, req + 16, &request.metadata)?;

    out.extend_from_slice(&b.finalize());
    Ok(out)
}

/// Encode a framed response: preamble + message whose root has 0 data words
/// and 2 pointers (error text, metadata composite list).
pub fn build_response(response: &ConnectResponse) -> Result<Vec<u8>, CodecError> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&DATA_STREAM_SIGNATURE);
    out.extend_from_slice(&STREAM_VERSION);

    let mut b = MessageBuilder::with_capacity(8192);
    let root = b.alloc(1)?;
    let resp = b.alloc(2)?;
    b.write_struct_ptr(root, resp, 0, 2);
    b.write_text(resp, &response.error)?;
    write_metadata(&mut b, resp + 8, &response.metadata)?;

    out.extend_from_slice(&b.finalize());
    Ok(out)
}

/// Decode a framed response. Counterpart of [`build_response`].
pub fn parse_response(bytes: &[u8]) -> Result<ConnectResponse, FramingError> {
    if !has_valid_preamble(bytes) {
        return Err(FramingError::BadFraming("bad preamble"));
    }
    let reader = MessageReader::new(&bytes[PREAMBLE_LEN..])?;
    let root = reader.struct_ptr(0)?;

    let mut response = ConnectResponse::default();
    if root.ptr_words >= 1 {
        let error = reader.text(root.ptr(0))?;
        response.error = String::from_utf8_lossy(error).into_owned();
    }
    if root.ptr_words >= 2 {
        let list = reader.composite_list(root.ptr(1))?;
        for i in 0..list.count.min(MAX_METADATA) {
            let ptrs = list.element_ptr_section(i);
            let key = reader.text(ptrs)?;
            let val = reader.text(ptrs + 8)?;
            response.metadata.push(Metadata::new(
                String::from_utf8_lossy(key).into_owned(),
                String::from_utf8_lossy(val).into_owned(),
            ));
        }
    }
    Ok(response)
}

/// Metadata entries are a composite list of structs with 0 data words and
/// 2 pointers (key text, val text). An empty list stays a null pointer.
fn write_metadata(
    b: &mut MessageBuilder,
    at: usize,
    metadata: &[Metadata],
) -> Result<(), CodecError> {
    if metadata.is_empty() {
        return Ok(());
    }
    let first = b.begin_composite_list(at, metadata.len(), 0, 2)?;
    for (i, entry) in metadata.iter().enumerate() {
        let elem = first + i * 16;
        b.write_text(elem, &entry.key)?;
        b.write_text(elem + 8, &entry.val)?;
    }
    Ok(())
}

/// Build response metadata for an HTTP origin reply: `HttpStatus` first,
/// then one `HttpHeader:<name>` entry per header. Entries past
/// [`MAX_METADATA`] are dropped with a warning; `HttpStatus` always
/// survives.
pub fn build_http_metadata(status: u16, headers: &[(String, String)]) -> ConnectResponse {
    let mut response = ConnectResponse::default();
    response
        .metadata
        .push(Metadata::new("HttpStatus", status.to_string()));

    for (name, value) in headers {
        if response.metadata.len() >= MAX_METADATA {
            warn!(
                dropped = headers.len() - (MAX_METADATA - 1),
                "response metadata overflow, truncating headers"
            );
            break;
        }
        response
            .metadata
            .push(Metadata::new(format!("HttpHeader:{name}"), value.clone()));
    }
    response
}
