pub mod config;
pub mod control;
pub mod error;
pub mod flow;
pub mod listener;
pub mod message;
pub mod net;
pub mod pacing;
pub mod packet;
pub mod probe;
pub mod protocol;
pub mod receiver;
pub mod report;
pub mod traits;
