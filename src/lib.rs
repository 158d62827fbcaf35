//! dreambotrs: a multi-frontend, multi-backend request router for
//! conversational AI workloads. Chat platforms (IRC, Discord, Slack) and
//! request backends (image generation, LLM chat, utility commands) are
//! independent workers that exchange envelopes over a durable pub/sub bus.

pub mod address;
pub mod argparse;
pub mod backend;
pub mod bus;
pub mod config;
pub mod envelope;
pub mod error;
pub mod frontend;
pub mod runtime;
pub mod worker;

pub use error::{Error, Result};
