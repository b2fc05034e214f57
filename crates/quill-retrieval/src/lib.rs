//! Adaptive transcript retrieval against a live, partially-rendered host page.
//!
//! Defines the page-adapter collaborator seam, the named scroll timing
//! profiles, and the retrieval controller that decides between bulk fetch,
//! progressive forward scrolling, and backward infinite scrolling.

pub mod controller;
pub mod page_adapter;
pub mod profiles;

pub use controller::{
    RetrievalCollection, RetrievalConfig, RetrievalController, RetrievalMode, RetrievalStats,
    RetrievalStrategy, RETRIEVAL_ERROR_CONTAINER_NOT_FOUND, RETRIEVAL_ERROR_EXTRACTION_FAILED,
    RETRIEVAL_STATE_KEY,
};
pub use page_adapter::{PageAdapter, ScrollMetrics};
pub use profiles::{
    ResolvedScrollProfile, ScrollProfile, ScrollProfileSet, SCROLL_PROFILE_SCHEMA_VERSION,
};
