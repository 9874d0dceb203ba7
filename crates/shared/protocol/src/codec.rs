//! Encode/decode for provisioning requests and replies.
//!
//! The reply decoder is deliberately best-effort: the service embeds the
//! returned path at a well-known offset, but some builds shift it, so a
//! bounded scan for a leading '/' is kept as a fallback. The race itself
//! never depends on a parsed reply, only on the service's side effects.

use log::debug;
use thiserror::Error;

use crate::types::{ProvisioningReply, ProvisioningRequest, RequestKind};
use crate::wire::{align4, WireConstants};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("message shorter than its fixed header")]
    Truncated,
    #[error("declared size {declared} does not match buffer size {actual}")]
    LengthMismatch { declared: u32, actual: usize },
    #[error("unexpected message id {0:#06x}")]
    BadMessageId(u32),
    #[error("unknown request kind {0}")]
    UnknownKind(u32),
    #[error("subject identifier invalid or longer than {} bytes", WireConstants::MAX_SUBJECT_LEN)]
    BadSubject,
    #[error("subject bytes are not valid UTF-8")]
    InvalidUtf8,
    #[error("success reply carries no locatable path")]
    MalformedReply,
}

/// Capacity that drops exactly the trailing separator of the service's
/// `/tmp/` suffix: room is left for "/tmp" plus the NUL, nothing more.
pub fn truncating_capacity(base_path_len: usize) -> u32 {
    (base_path_len + WireConstants::CAPACITY_SLACK) as u32
}

/// Encode one provisioning request.
///
/// Layout invariant: `len == REQUEST_HEADER_LEN + align4(subject+NUL) + 4`,
/// always a multiple of 4.
pub fn encode_request(request: &ProvisioningRequest) -> Result<Vec<u8>, CodecError> {
    let subject = request.subject.as_bytes();
    if subject.is_empty()
        || subject.len() > WireConstants::MAX_SUBJECT_LEN
        || subject.contains(&0)
    {
        return Err(CodecError::BadSubject);
    }

    let path_len = subject.len() + 1; // includes NUL terminator
    let padded = align4(path_len);
    let total = WireConstants::REQUEST_HEADER_LEN + padded + 4;

    let mut buf = Vec::with_capacity(total);
    put_u32(&mut buf, WireConstants::REQUEST_MSG_ID);
    put_u32(&mut buf, total as u32);
    put_u32(&mut buf, WireConstants::FMT_WORD1);
    put_u32(&mut buf, WireConstants::FMT_WORD2);
    put_u32(&mut buf, request.kind.as_u32());
    put_u32(&mut buf, request.flags);
    put_u32(&mut buf, 0); // alignment pad
    put_u32(&mut buf, path_len as u32);
    buf.extend_from_slice(subject);
    buf.push(0);
    buf.resize(WireConstants::REQUEST_HEADER_LEN + padded, 0);
    put_u32(&mut buf, request.declared_capacity);

    debug_assert_eq!(buf.len(), total);
    debug_assert_eq!(buf.len() % 4, 0);
    Ok(buf)
}

/// Decode a provisioning request (simulated-service side).
pub fn decode_request(bytes: &[u8]) -> Result<ProvisioningRequest, CodecError> {
    if bytes.len() < WireConstants::REQUEST_HEADER_LEN + 4 {
        return Err(CodecError::Truncated);
    }
    let msg_id = read_u32(bytes, 0);
    if msg_id != WireConstants::REQUEST_MSG_ID {
        return Err(CodecError::BadMessageId(msg_id));
    }
    let declared = read_u32(bytes, 4);
    if declared as usize != bytes.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            actual: bytes.len(),
        });
    }
    let kind = RequestKind::from_u32(read_u32(bytes, 16))
        .ok_or_else(|| CodecError::UnknownKind(read_u32(bytes, 16)))?;
    let flags = read_u32(bytes, 20);
    let path_len = read_u32(bytes, 28) as usize;
    if path_len == 0 || path_len > WireConstants::MAX_SUBJECT_LEN + 1 {
        return Err(CodecError::BadSubject);
    }

    let subject_start = WireConstants::REQUEST_HEADER_LEN;
    let capacity_off = subject_start + align4(path_len);
    if bytes.len() < capacity_off + 4 {
        return Err(CodecError::Truncated);
    }
    let raw = &bytes[subject_start..subject_start + path_len];
    if raw[path_len - 1] != 0 {
        return Err(CodecError::BadSubject);
    }
    let subject = std::str::from_utf8(&raw[..path_len - 1])
        .map_err(|_| CodecError::InvalidUtf8)?
        .to_owned();
    let declared_capacity = read_u32(bytes, capacity_off);

    Ok(ProvisioningRequest {
        kind,
        flags,
        subject,
        declared_capacity,
    })
}

/// Encode a reply with the path embedded at the well-known offset.
/// Used by tests and the simulated service.
pub fn encode_reply(status: u32, path: Option<&str>) -> Vec<u8> {
    let path_bytes = path.map(str::as_bytes).unwrap_or_default();
    let total = WireConstants::REPLY_PATH_OFFSET + align4(path_bytes.len() + 1);

    let mut buf = Vec::with_capacity(total);
    put_u32(&mut buf, WireConstants::REPLY_MSG_ID);
    put_u32(&mut buf, total as u32);
    put_u32(&mut buf, WireConstants::FMT_WORD1);
    put_u32(&mut buf, WireConstants::FMT_WORD2);
    put_u32(&mut buf, status);
    put_u32(&mut buf, WireConstants::REPLY_PATH_OFFSET as u32);
    buf.extend_from_slice(path_bytes);
    buf.resize(total, 0);
    buf
}

/// Decode a provisioning reply.
///
/// Path extraction is dual-strategy: the well-known offset first, then a
/// forward scan for the first '/' past the fixed words. Beyond basic size
/// validation, only a success status with no locatable path is an error.
pub fn decode_reply(bytes: &[u8]) -> Result<ProvisioningReply, CodecError> {
    if bytes.len() < WireConstants::REPLY_HEADER_LEN {
        return Err(CodecError::Truncated);
    }
    let declared = read_u32(bytes, 4) as usize;
    if declared < WireConstants::REPLY_HEADER_LEN {
        // A size word smaller than the fixed header cannot be honoured;
        // the scan window below is bounded by it.
        return Err(CodecError::Truncated);
    }
    let window = declared.min(bytes.len()).min(WireConstants::MAX_REPLY_LEN);
    let status = read_u32(bytes, 16);

    let mut path = read_cstr(bytes, WireConstants::REPLY_PATH_OFFSET, window);
    if path.is_none() {
        // Some service builds shift the path; scan for the leading '/'.
        if let Some(pos) = bytes[WireConstants::REPLY_SCAN_START..window]
            .iter()
            .position(|&b| b == b'/')
        {
            let off = WireConstants::REPLY_SCAN_START + pos;
            path = read_cstr(bytes, off, window);
            if path.is_some() {
                debug!("[Codec] reply path located by scan at offset {off}");
            }
        }
    }

    if path.is_none() && status == 0 {
        return Err(CodecError::MalformedReply);
    }
    Ok(ProvisioningReply { status, path })
}

fn read_cstr(bytes: &[u8], offset: usize, window: usize) -> Option<String> {
    if offset >= window {
        return None;
    }
    let tail = &bytes[offset..window];
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    if end == 0 {
        return None;
    }
    std::str::from_utf8(&tail[..end]).ok().map(str::to_owned)
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(
        bytes[offset..offset + 4]
            .try_into()
            .expect("offset bounds checked"),
    )
}
