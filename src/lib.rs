//! shellmind - terminal assistant on top of a local llama.cpp server
//!
//! Layers, leaves first:
//! - `supervisor`: start, watch and stop the `llama-server` process
//! - `client`: `/health` and `/v1/chat/completions` (streaming and not)
//! - `conversation`: turn history, token budget, save/load
//! - `commands`: `!ps`, `!ls`, `!analyze`, `!explain`, `@system`, ...
//! - `session` / `repl`: the per-line protocol and the interactive loop

pub mod client;
pub mod commands;
pub mod config;
pub mod conversation;
pub mod error;
pub mod repl;
pub mod session;
pub mod supervisor;
pub mod ui;
