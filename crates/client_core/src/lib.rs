pub mod backend;
pub mod client;
pub mod deletion;
pub mod error;
pub mod presence;
pub mod receipts;
pub mod timeline;
pub mod transport;
pub mod voice;

pub use backend::{ChatBackend, FileUpload, HttpChatBackend, MissingChatBackend};
pub use client::{ChatClient, ClientEvent};
pub use error::{MediaError, TimelineError};
pub use timeline::{LocalId, TempId, TimelineEntry};
pub use transport::{RelaySink, TransportEvent, TransportHandle};
