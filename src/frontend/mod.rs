//! Frontend workers (C5/C6, §4.4, §4.5): adapt a chat platform's wire
//! protocol into envelopes and back.

pub mod discord;
pub mod irc;
pub mod slack;

pub use discord::DiscordFrontend;
pub use irc::IrcFrontend;
pub use slack::SlackFrontend;
