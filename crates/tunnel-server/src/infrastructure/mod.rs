//! Infrastructure layer: TCP listener, per-connection sessions, the serial
//! writer and config persistence.

pub mod network;
pub mod serial_writer;
pub mod storage;
