pub mod broadcast;
pub mod cli;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod interaction;
pub mod keys;
pub mod lease;
pub mod paths;
pub mod pending;
pub mod server;
pub mod tmux;
pub mod transcript;
pub mod watcher;
