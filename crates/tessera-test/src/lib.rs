//! # Tessera Test
//!
//! Test utilities for Tessera WebSocket endpoints: a scripted client that
//! writes masked frames and reads the server's unmasked ones, over an
//! in-memory duplex stream or a real socket.
//!
//! ## Example
//!
//! ```ignore
//! use tessera_test::{ClientEmulator, TestUpgrade};
//!
//! #[tokio::test]
//! async fn test_echo() {
//!     let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
//!     let (mut client, reply) = ClientEmulator::connect(stream, &TestUpgrade::new("/echo"))
//!         .await
//!         .unwrap();
//!     assert!(reply.is_upgraded());
//!
//!     client.send_text("HOLA").await.unwrap();
//!     assert_eq!(client.expect_text().await.unwrap(), "HOLA");
//! }
//! ```

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod client;
mod error;
pub mod frame;
mod request;
mod response;

pub use client::{ClientEmulator, DEFAULT_TIMEOUT};
pub use error::TestError;
pub use frame::{ClientFrame, ServerFrame};
pub use request::{TestUpgrade, SAMPLE_ACCEPT, SAMPLE_KEY};
pub use response::HandshakeReply;
