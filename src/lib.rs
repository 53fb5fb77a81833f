//! sqlbench - a TPC-B-like relational database benchmarking driver.
//!
//! The library is organized around the dataflow in the design doc: a script
//! parser and expression evaluator feed a per-client state machine, which a
//! thread-per-worker scheduler steps over non-blocking connections, folding
//! results into the statistics and logging pipeline.

pub mod cli;
pub mod client;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod expr;
pub mod init;
pub mod logfile;
pub mod rand;
pub mod script;
pub mod shell;
pub mod stats;
pub mod termination;
pub mod throttle;
pub mod variables;
pub mod worker;
