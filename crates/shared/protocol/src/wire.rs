// This file is the "Single Source of Truth" for the provisioning wire format.
// Offsets are bytes from the start of the message; all words little-endian.

pub struct WireConstants;

impl WireConstants {
    /// Message id of the provisioning request.
    pub const REQUEST_MSG_ID: u32 = 0xB872;
    /// Reply message id (request id + 100, reply convention).
    pub const REPLY_MSG_ID: u32 = 0xB8D6;

    /// Format-version words carried in every message header.
    pub const FMT_WORD1: u32 = 0x0000_0000;
    pub const FMT_WORD2: u32 = 0x0000_0001;

    pub const KIND_CONTAINER: u32 = 1;
    pub const KIND_CACHE: u32 = 2;
    pub const DEFAULT_FLAGS: u32 = 1;

    /// Request layout: [msg_id][msg_size][fmt1][fmt2][kind][flags][pad][path_len]
    /// then the NUL-terminated subject padded to 4 bytes, then the capacity word.
    pub const REQUEST_HEADER_LEN: usize = 32;

    /// Reply layout: [msg_id][msg_size][fmt1][fmt2][status][path_offset] then path bytes.
    pub const REPLY_HEADER_LEN: usize = 24;
    /// Well-known offset of the embedded reply path.
    pub const REPLY_PATH_OFFSET: usize = 24;
    /// Fallback scan for a leading '/' starts past the fixed words.
    pub const REPLY_SCAN_START: usize = 16;
    /// Upper bound on a reply we are willing to buffer.
    pub const MAX_REPLY_LEN: usize = 4096;

    pub const MAX_SUBJECT_LEN: usize = 255;

    /// Suffix the service concatenates onto the base path before truncation.
    pub const TRUNCATION_SUFFIX: &'static str = "/tmp/";
    /// Capacity slack that drops exactly the suffix's trailing separator:
    /// room for "/tmp" plus NUL, not "/tmp/".
    pub const CAPACITY_SLACK: usize = 5;
    /// Capacity large enough that nothing truncates (benign request).
    pub const DEFAULT_CAPACITY: u32 = 1024;
}

/// Round up to a 4-byte boundary.
pub const fn align4(n: usize) -> usize {
    (n + 3) & !3
}
