pub mod activity;
pub mod bridge;
pub mod broker;
pub mod buffer;
pub mod config;
pub mod context;
pub mod event;
pub mod monitor;
pub mod pattern;
pub mod pty;
pub mod recorder;
pub mod session;
pub mod shutdown;
