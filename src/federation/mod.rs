//! ActivityPub federation module
//!
//! Handles:
//! - HTTP Signatures (codec, inbound verification, outbound signing)
//! - Actor key fetching and caching
//! - Activity delivery (Accept / Reject replies, broadcasts)
//! - Follow / unfollow processing
//! - WebFinger

mod activity;
mod authenticator;
mod client;
mod clock;
mod delivery;
mod key_cache;
mod signature;
mod signer;
#[cfg(test)]
pub(crate) mod testing;
mod webfinger;

pub use activity::{
    ActivityEnvelope, ActivityType, ActorProfile, ActorPublicKey, FollowOutcome, FollowProcessor,
    ObjectRef,
};
pub use authenticator::{AuthenticatedActor, InboundAuthenticator};
pub use client::{HttpClient, HttpError, HttpResponse, ReqwestHttpClient};
pub use clock::{Clock, FixedClock, SystemClock};
pub use delivery::{ActivityDelivery, Audience, DeliveryResponse, DeliveryResult, builder};
pub use key_cache::{ActorKey, ActorKeyCache};
pub use signature::{
    REQUEST_TARGET, SignatureHeader, build_signature_header, canonicalize, format_http_date,
    generate_digest, key_id_matches_actor, parse_http_date, parse_signature_header,
    strip_fragment,
};
pub use signer::{RsaKeySigner, SigningOracle, decode_public_key_pem};
pub use webfinger::{WebFingerLink, WebFingerResponse, generate_webfinger_response, resource_matches};
