//! # Beambox Core Library
//!
//! `beambox-core` lets two devices on the same network find each other and
//! exchange files without a central server.
//!
//! ## Features
//!
//! - **Binary framing**: `type | messageId | length | body` frames over TCP and UDP
//! - **Request/response**: message-id correlation with one retransmission and
//!   server-side replay of cached responses
//! - **Two discovery paths**: UDP broadcast announcements and QR-code rendezvous
//! - **FileExplore sessions**: handshake, heartbeat, directory browsing and chat
//! - **Parallel transfers**: chunked multi-connection file streaming with speed sampling
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`connection`] - TCP/UDP connection tasks and their observers
//! - [`discovery`] - Broadcast and QR-code discovery
//! - [`explore`] - FileExplore control session
//! - [`mod@file`] - Local file helpers and size formatting
//! - [`protocol`] - Frame codec and message bodies
//! - [`rpc`] - Request client and server dispatch table
//! - [`transfer`] - File transfer engine and speed calculator
//!
//! ## Example
//!
//! ```rust,ignore
//! use beambox_core::explore::{FileExplore, ExploreOptions};
//!
//! let explore = FileExplore::new(handlers, ExploreOptions::default());
//! explore.connect(peer_ip).await?;
//! let handshake = explore.request_handshake().await?;
//! let listing = explore.request_scan_dir("/").await?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod explore;
pub mod file;
mod observer;
pub mod protocol;
pub mod rpc;
pub mod transfer;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version exchanged in handshakes and discovery requests
pub const PROTOCOL_VERSION: i32 = 1;

/// FileExplore control port (TCP)
pub const DEFAULT_FILE_EXPLORE_PORT: u16 = 1996;

/// File transfer data port (TCP)
pub const DEFAULT_FILE_TRANSFER_PORT: u16 = 1997;

/// QR-code rendezvous port (UDP)
pub const DEFAULT_QR_CODE_PORT: u16 = 1998;

/// Broadcast announcement port (UDP)
pub const DEFAULT_BROADCAST_RECEIVER_PORT: u16 = 1999;

/// Broadcast transfer-request port (UDP)
pub const DEFAULT_BROADCAST_TRANSFER_PORT: u16 = 2000;

/// Default heartbeat interval in milliseconds
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 8000;

/// Heartbeat intervals without traffic before a connection is considered dead
pub const DEFAULT_IDLE_MULTIPLIER: u32 = 3;

/// Default request retry timeout in milliseconds
pub const DEFAULT_RETRY_TIMEOUT_MS: u64 = 1000;

/// Default broadcast announcement interval in milliseconds
pub const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 1000;

/// Default chunk size for file transfers (512 KB)
pub const DEFAULT_BUFFER_SIZE: usize = 512 * 1024;

/// Default number of parallel data connections
pub const DEFAULT_MAX_CONNECTION: usize = 4;
