//! Commands: request/response on top of one-way pub/sub.
//!
//! A logical topic maps onto two channels:
//!
//! ```text
//! <topic>::command   sender ──▶ receivers
//! <topic>::response  receivers ──▶ sender   (each response carries `_re` = request id)
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! let rover = Rover::in_memory();
//!
//! let receiver = rover.receiver("greetings", Some("greeters")).await?;
//! receiver.on_request(|_cmd| async { json!("World") });
//!
//! let sender = rover.sender("greetings").await?;
//! let reply = sender.request_one(&"Hello").await?;
//! assert_eq!(reply.payload(), &json!("World"));
//! ```

mod pending;
mod receiver;
mod sender;

pub use pending::PendingRequests;
pub use receiver::{CommandReceiver, ReceiverStats};
pub use sender::{CommandSender, SenderStats};

use crate::error::{Result, RoverError};

/// Separator between a topic and its derived channel suffix.
pub const CHANNEL_SEPARATOR: &str = "::";

fn derived(topic: &str, suffix: &str) -> Result<String> {
    if topic.is_empty() {
        return Err(RoverError::invalid("command topic must not be empty"));
    }
    Ok(format!("{}{}{}", topic, CHANNEL_SEPARATOR, suffix))
}

/// `"<topic>::command"`
pub fn command_channel(topic: &str) -> Result<String> {
    derived(topic, "command")
}

/// `"<topic>::response"`
pub fn response_channel(topic: &str) -> Result<String> {
    derived(topic, "response")
}
