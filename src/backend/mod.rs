//! Backend workers (C7/C8/C9, §4.6-§4.8): turn a triggered request into a
//! reply, synchronously or via an async completion.

pub mod commands;
pub mod image;
pub mod llm;

pub use commands::CommandsBackend;
pub use image::ImageBackend;
pub use llm::LlmBackend;
