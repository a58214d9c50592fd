//! Activity Streams vocabulary: validated, lazily-typed views over JSON
//! documents exchanged on the federation wire.

pub mod activity;
pub mod actor;
pub mod fetch;
pub mod note;
pub mod object;

pub use activity::{make_accept_response, Activity, ActivityKind};
pub use actor::{Actor, ActorResolveError, PublicKey, ACTOR_TYPES};
pub use fetch::{Fetch, FetchError, StaticFetcher};
pub use note::Note;
pub use object::{
    ApObject, Link, ObjectCache, Reference, ResolveError, ACTIVITY_STREAMS_CONTEXT,
    COLLECTION_TYPES, PUBLIC_ADDRESS,
};
