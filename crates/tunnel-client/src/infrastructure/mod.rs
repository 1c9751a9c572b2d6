//! Infrastructure layer for the client application.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `tunnel_core`, but MUST NOT be imported by the `application` layer.
//!
//! # Sub-modules
//!
//! - **`network`** – TCP implementation of the application's `Connector` and
//!   `Link` ports: connect with a timeout, exchange public keys, then send one
//!   encrypted frame per chunk.
//!
//! - **`storage`** – TOML configuration file for the client.

pub mod network;
pub mod storage;
