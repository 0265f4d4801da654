//! Integration tests for the mcdiff-chm pipeline.

#[cfg(unix)]
mod cli;
mod pipeline_run;
