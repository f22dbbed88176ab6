//! North service: OMF linked-data emission and forwarding.

pub mod linkdata;
pub mod sender;
pub mod task;

pub use linkdata::{OmfHint, OmfHints, OmfLinkedData, OMF_HINT};
pub use sender::{HttpSender, SendError, Sender};
pub use task::SendTask;
