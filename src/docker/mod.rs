//! Docker endpoint access
//!
//! Everything that speaks HTTP to the outside lives here: the per-endpoint
//! daemon client with its availability tracking and stream decoders, the
//! wire types of the remote API, and the image-registry client used by tag
//! reconciliation.

mod client;
mod offline;
mod registry;
mod result;
mod stream;
mod types;

pub use client::{DockerService, EndpointAddress, EndpointConfig};
pub use offline::{AvailabilityTracker, FailureOutcome, OfflineCause, INITIAL_OFFLINE_COOLDOWN};
pub use registry::RegistryClient;
pub use result::{CallError, CallResult, ResultCode};
pub use stream::{JsonLineDecoder, LogFrameDecoder, StreamEnd};
pub use types::*;
