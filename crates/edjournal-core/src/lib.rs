//! # edjournal-core
//!
//! Session reconstruction over the ordered journal event stream.
//!
//! ## Key Types
//!
//! - [`SessionReconstructor`] - Segments the stream into sessions
//! - [`LiveSessionTracker`] - Finer-grained view of the open session
//! - [`Ingestor`] - Folds tailer batches and commits them atomically
//! - [`Engine`] / [`EngineHandle`] - Background worker and its read interface
//! - [`ProfileSink`] - Receives folded events and closed sessions

mod engine;
mod error;
mod ingestor;
pub mod live;
mod profile;
mod reconstructor;
pub mod rules;

pub use engine::{Engine, EngineConfig, EngineHandle, LiveView};
pub use error::IngestError;
pub use ingestor::{IngestionStatus, Ingestor, IngestorConfig};
pub use live::{LiveRates, LiveSessionSnapshot, LiveSessionTracker};
pub use profile::{NoopProfileSink, ProfileSink, RecentEvent, RecentEvents, DEFAULT_RECENT_EVENTS};
pub use reconstructor::{
    opening_identity, FoldOutcome, ReconstructorState, SessionReconstructor, SESSION_OPENING_EVENT,
};
