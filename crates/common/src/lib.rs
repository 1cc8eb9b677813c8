//! Process-level plumbing shared by tumbler client embeddings.

pub mod logging;
