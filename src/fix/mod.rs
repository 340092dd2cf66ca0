pub mod codec;
pub mod frame;
pub mod message;
pub mod messages;
pub mod tags;
