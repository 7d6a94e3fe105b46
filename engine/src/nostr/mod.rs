pub mod event;
pub mod feed;
pub mod signer;
pub mod sink;

pub use event::{event_id, verify_signed_challenge, NostrEvent};
pub use signer::{SchnorrSigner, Signer};
pub use sink::{EventSink, MemorySink, RelayQueueSink};
