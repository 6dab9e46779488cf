pub mod balance;
pub mod message;

pub use balance::*;
pub use message::*;
