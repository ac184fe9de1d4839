//! # tasktree
//!
//! Distributed task-tree scheduler.
//!
//! A fleet of workers pulls steps of recursively decomposable jobs from a
//! shared store, runs them and writes the results back under optimistic
//! concurrency. Each job carries one completion estimate that only ever
//! grows, however deep its tree of subtasks becomes.
//!
//! ## Architecture
//!
//! ```text
//!   tasktree-submit ──► TaskDb ◄──────────── TaskWorker ──┐
//!                         ▲   claim / apply (CAS)   │      │ heartbeat
//!                         │                         ▼      │
//!                      BlobStore ◄──── state ──── TaskRunner
//!                                                   │
//!                                                   ▼
//!                                            Task (by type name)
//! ```
//!
//! ## Task Flow
//! 1. A job is submitted as a task type plus its initial state blob
//! 2. A worker claims a `ready` node and runs one step of it
//! 3. The step finishes the task, spawns subtasks, or asks to run again
//! 4. The worker applies the result; finished children wake their parent
//!
//! ## Modules
//! - `task`: task contract, attempt records, runner, tree node state machine
//! - `store`: conditional-write task store (memory, SQLite)
//! - `blob`: write-once blob storage for task state and outputs
//! - `worker`: claiming, result application, tree maintenance, worker loop
//! - `builtin`: generic `echo` and `fan_out` task types
//! - `config`: environment-driven configuration

pub mod blob;
pub mod builtin;
pub mod config;
pub mod store;
pub mod task;
pub mod worker;

pub use config::Config;
pub use store::{create_task_db, TaskDb, TaskDbType};
pub use task::{Task, TaskContext, TaskInfo, TaskRegistry, TaskState};
pub use worker::{run_loop, LoopExit, TaskWorker};
