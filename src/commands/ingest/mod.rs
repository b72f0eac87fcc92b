const DB_SCHEMA_VERSION: &str = "1.0.0";

mod batch_writer;
mod db_setup;
mod extract;
mod lotx;
mod pipeline;
mod run;
mod scanner;
#[cfg(test)]
mod tests;
mod tracker;
mod void_csv;

pub use run::run;

pub(crate) use batch_writer::*;
pub(crate) use db_setup::*;
pub(crate) use extract::*;
pub(crate) use pipeline::*;
pub(crate) use run::latest_manifest;
#[cfg(test)]
pub(crate) use run::run_streams;
pub(crate) use scanner::*;
pub(crate) use tracker::*;
