//! State-coordination core: iteration control, stream resolution,
//! initiative-scoped archival

pub mod archive;
pub mod iteration;
pub mod streams;

pub use archive::ArchivalScoper;
pub use iteration::IterationEngine;
pub use streams::StreamResolver;
