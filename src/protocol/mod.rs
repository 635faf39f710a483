//! Wire protocol: the [`Message`] data model and frame transmission.
//!
//! Every call travels as one request frame and, unless it is one-way, one
//! response frame carrying the same sequence number. Many calls share one
//! connection, so responses may arrive in any order.

mod message;
mod wire;

pub use message::{
    CompressType, Message, MessageStatusType, MessageType, SerializeType, HEADER_LEN,
    MAGIC_NUMBER, MAX_MESSAGE_LENGTH, PROTOCOL_VERSION,
};
pub use wire::{read_message, read_message_timeout, write_frame, write_message};
