pub mod connection;

pub use connection::{Backoff, ChannelSettings, ChannelState, ConnectionManager};
