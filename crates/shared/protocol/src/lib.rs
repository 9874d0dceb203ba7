//! Wire protocol for the privileged directory-provisioning service.
//!
//! One request kind matters here: a provisioning call whose
//! `declared_output_capacity` field bounds the path buffer the service
//! writes into. Undersizing it truncates the trailing separator off the
//! computed path, which is what makes the directory race winnable.

mod codec;
mod types;
mod wire;

pub use codec::{
    decode_reply, decode_request, encode_reply, encode_request, truncating_capacity, CodecError,
};
pub use types::{ProvisioningReply, ProvisioningRequest, RequestKind};
pub use wire::{align4, WireConstants};
