// src/transport/mod.rs
//! Byte-level framing over TCP
//!
//! - **Codec**: magic + 6-byte length framing with a reassembly buffer
//! - **Writer**: single-task queued writer with chunked payload writes

pub mod codec;
pub mod writer;

pub use codec::{FrameCodec, HEADER_LEN, MAGIC};
pub use writer::{spawn_writer, FrameSender};

/// Read half of a framed connection
pub type FrameReader<R> = tokio_util::codec::FramedRead<R, FrameCodec>;
