//! Wire protocol types for gantry inter-component communication.
//!
//! One rkyv-encoded protocol is used on two paths:
//!
//! - the bridge: a supervisor and the one worker process it spawned, over a
//!   private Unix socket
//! - the broker: gateway → worker manager work items, and the responses
//!   published back to the gateway's callback channel
//!
//! # Wire Format
//!
//! Every message is prefixed with an 8-byte frame header:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │              Frame Header (8 bytes, fixed)               │
//! ├──────────────┬──────────────┬────────────────────────────┤
//! │  Version (2) │ Msg Type (2) │    Payload Length (4)      │
//! ├──────────────┴──────────────┴────────────────────────────┤
//! │                  rkyv-serialised payload                 │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use gantry_proto::{Codec, MessageType, RequestId, WorkItem};
//!
//! let item = WorkItem::builder(RequestId::generate(), "gantry.callback")
//!     .method("POST")
//!     .body(b"hello".to_vec())
//!     .build();
//!
//! let mut codec = Codec::new();
//! let frame = codec.encode(&item, MessageType::WorkItem)?;
//! ```

pub mod codec;
mod error;
mod schema;
pub mod transport;
mod types;
mod work;

pub use codec::{Codec, FrameHeader, MessageType, CURRENT_VERSION, FRAME_HEADER_SIZE, MAX_MESSAGE_SIZE};
pub use error::ProtocolError;
pub use schema::SchemaDescriptor;
pub use types::{now_millis, RequestId};
pub use work::{
    BridgeMessage, BridgeResponse, LogRecord, Severity, WorkItem, WorkItemBuilder, WorkResponse,
    PROCESSING_ERROR_BODY, UNABLE_TO_PROCESS_BODY, UNAVAILABLE_BODY,
};

/// Protocol version constants.
pub mod version {
    /// Current protocol version.
    pub const CURRENT: u16 = 1;

    /// Minimum supported protocol version.
    pub const MIN_SUPPORTED: u16 = 1;
}

/// Environment handed from the supervisor to a spawned worker.
pub mod spawn {
    /// Name of the handler the worker should serve.
    pub const HANDLER_ENV: &str = "GANTRY_HANDLER";

    /// Directory holding the handler's code and assets.
    pub const CODE_PATH_ENV: &str = "GANTRY_CODE_PATH";

    /// Unix socket the worker must bind.
    pub const SOCKET_PATH_ENV: &str = "GANTRY_SOCKET_PATH";

    /// Base64 [`SchemaDescriptor`](crate::SchemaDescriptor).
    pub const SCHEMA_ENV: &str = "GANTRY_SCHEMA";

    /// Line printed on stdout once the socket is bound.
    pub const READY_MARKER: &str = "GANTRY_READY";
}
