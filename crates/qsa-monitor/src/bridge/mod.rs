//! Wire bridge between the QSA admin and monitored QGIS Server instances.
//!
//! # Architecture
//!
//! - **protocol**: Command tokens (admin → worker) and reply frames (worker → admin)
//! - **codec**: Length-prefixed JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
