pub mod ingest;
pub mod merge;
pub mod requeue;
pub mod status;
