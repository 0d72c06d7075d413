//! Shared pieces of the facecam clients: configuration, the live frame
//! source and its camera readers, JPEG encoding, the face-service client and
//! the user-facing message line.

pub mod config;
pub mod encoder;
pub mod frame;
pub mod mjpeg;
pub mod service;
pub mod source;
pub mod status;

