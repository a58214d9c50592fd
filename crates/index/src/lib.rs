//! The index tables: user records and follow edges, object metadata and
//! history, and the derived-counter maintainer.

pub mod object;
pub mod statistics;
pub mod user;

pub use object::{ActivityRecord, ActivityWalk, ObjectIndex, PostRecord, ReplyRecord, ReplyWalk};
pub use statistics::StatisticsMaintainer;
pub use user::{EdgeWalk, User, UserIndex};
