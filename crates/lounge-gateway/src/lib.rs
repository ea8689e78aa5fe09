pub mod connection;
pub mod coordinator;
pub mod dispatcher;
pub mod irc;
pub mod moderation;
pub mod reactions;
pub mod registry;
pub mod tube;
