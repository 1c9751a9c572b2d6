//! Application layer for the client.
//!
//! # What lives here?
//!
//! - **`link`** – The ports the session loop talks through: a [`link::Connector`]
//!   that produces handshaken [`link::Link`]s, and the chunk-level error type
//!   that decides whether unsent data is kept or dropped.
//!
//! - **`outbound_buffer`** – The FIFO of serial bytes waiting for delivery, and
//!   the drain algorithm that splits it into cipher-sized chunks.
//!
//! - **`session`** – The 50 ms loop that ties the serial port, the buffer and
//!   the link together, including reconnects and keep-alives.

pub mod link;
pub mod outbound_buffer;
pub mod session;
