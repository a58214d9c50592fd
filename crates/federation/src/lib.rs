//! Federation engine: HTTP signatures, the inbound and outbound activity
//! pipelines, WebFinger discovery, and the collection read views.

pub mod client;
pub mod context;
pub mod handler;
pub mod inbound;
pub mod outbound;
pub mod signature;
pub mod views;
pub mod webfinger;

pub use client::{ApClient, Deliver, DeliveryError};
pub use context::Context;
pub use handler::{router, SharedContext, BEARER_USERNAME_HEADER};
pub use inbound::{
    dispatch_inbound_activity, receive_inbound_activity, InboxRequest, PREFILTER_BODY_SIZE,
};
pub use outbound::{
    deliver_activity, expand_recipients, push_staged_activity, push_staged_object,
    run_outbound_pipeline, stage_outbound_object, translate_staged_object, update_last_activity,
    Translation,
};
pub use signature::{
    digest_request_body, make_signature_header, parse_signature_header, sign_post_request,
    verify_signature_and_headers, SignatureError, SignatureHeader,
};
