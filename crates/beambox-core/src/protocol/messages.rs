//! Message type numbers and JSON bodies for every Beambox protocol.
//!
//! Type numbers are scoped per protocol: the same number means different
//! things on a FileExplore connection and on a broadcast socket. Bodies use
//! camelCase keys and ignore unknown fields on read.

use serde::{Deserialize, Serialize};

macro_rules! message_types {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident = $code:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $code),+
        }

        impl $name {
            /// Wire value of this message type.
            #[must_use]
            pub const fn code(self) -> i32 {
                self as i32
            }

            /// Look up a message type by its wire value.
            #[must_use]
            pub const fn from_code(code: i32) -> Option<Self> {
                match code {
                    $($code => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }

        impl From<$name> for i32 {
            fn from(value: $name) -> Self {
                value.code()
            }
        }
    };
}

message_types! {
    /// FileExplore control session message types.
    ExploreMessage {
        /// Client opens the session
        HandshakeReq = 0,
        /// Server accepts the session
        HandshakeResp = 1,
        /// List a remote directory
        ScanDirReq = 2,
        /// Directory listing
        ScanDirResp = 3,
        /// Offer files to the peer
        SendFilesReq = 4,
        /// Peer accepts with a chunk size
        SendFilesResp = 5,
        /// Ask the peer for files
        DownloadFilesReq = 6,
        /// Peer accepts with a connection count
        DownloadFilesResp = 7,
        /// Chat message
        SendMsgReq = 8,
        /// Chat acknowledgement
        SendMsgResp = 9,
        /// Liveness probe
        HeartbeatReq = 10,
        /// Liveness acknowledgement
        HeartbeatResp = 11,
    }
}

message_types! {
    /// Broadcast discovery message types.
    BroadcastMessage {
        /// Periodic announcement
        BroadcastMsg = 0,
        /// Receiver asks the announcer for a transfer
        TransferFileReq = 1,
        /// Announcer accepts
        TransferFileResp = 2,
    }
}

message_types! {
    /// QR-code rendezvous message types.
    QrCodeMessage {
        /// Scanner asks the QR owner for a transfer
        TransferFileReq = 0,
        /// QR owner accepts
        TransferFileResp = 1,
    }
}

message_types! {
    /// File transfer data-plane message types.
    TransferMessage {
        /// Downloader claims a byte range of a file
        DownloadReq = 0,
        /// One chunk of file content (raw body)
        SendData = 1,
        /// Downloader has nothing left to claim
        FinishedReq = 2,
        /// Either side reports a failure
        ErrorReq = 3,
    }
}

/// Opens a FileExplore session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeReq {
    /// Protocol version of the requester
    pub version: i32,
    /// Path separator used by the requester's file system
    pub file_separator: String,
}

/// Accepts a FileExplore session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HandshakeResp {
    /// Path separator used by the responder's file system
    pub file_separator: String,
}

/// Requests a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanDirReq {
    /// Remote path to list
    pub request_path: String,
}

/// A directory entry as seen by the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileExploreDir {
    /// Entry name
    pub name: String,
    /// Full path on the owning device
    pub path: String,
    /// Number of direct children
    pub children_count: u32,
    /// Last modification time, milliseconds since the Unix epoch
    pub last_modify: i64,
}

/// A regular file as seen by the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileExploreFile {
    /// File name
    pub name: String,
    /// Full path on the owning device
    pub path: String,
    /// Size in bytes
    pub size: u64,
    /// Last modification time, milliseconds since the Unix epoch
    pub last_modify: i64,
}

/// Directory listing reply.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanDirResp {
    /// Listed path
    pub path: String,
    /// Child directories
    #[serde(default)]
    pub children_dirs: Vec<FileExploreDir>,
    /// Child files
    #[serde(default)]
    pub children_files: Vec<FileExploreFile>,
}

/// Offers files to the peer, which will download them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendFilesReq {
    /// Files on the sending device
    pub send_files: Vec<FileExploreFile>,
    /// Parallel data connections the sender will serve
    pub max_connection: u32,
}

/// Accepts a file offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendFilesResp {
    /// Chunk size the downloader wants
    pub buffer_size: u32,
}

/// Asks the peer to serve files to us.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFilesReq {
    /// Files on the peer's device
    pub download_files: Vec<FileExploreFile>,
    /// Chunk size the requester wants
    pub buffer_size: u32,
}

/// Accepts a download request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadFilesResp {
    /// Parallel data connections the serving side allows
    pub max_connection: u32,
}

/// A chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMsgReq {
    /// Send time, milliseconds since the Unix epoch
    pub send_time: i64,
    /// Message text
    pub msg: String,
}

/// Periodic broadcast announcement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMsg {
    /// Protocol version of the announcer
    pub version: i32,
    /// Announcer's device name
    pub device_name: String,
}

/// Transfer request sent to a broadcast announcer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastTransferFileReq {
    /// Protocol version of the requester
    pub version: i32,
    /// Requester's device name
    pub device_name: String,
}

/// Announcer accepts a transfer request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastTransferFileResp {
    /// Announcer's device name
    pub device_name: String,
}

/// Transfer request sent by a QR-code scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QRCodeTransferFileReq {
    /// Protocol version of the scanner
    pub version: i32,
    /// Scanner's device name
    pub device_name: String,
}

/// Payload encoded in the QR image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QRCodeShare {
    /// Protocol version of the QR owner
    pub version: i32,
    /// QR owner's device name
    pub device_name: String,
    /// QR owner's IP address
    pub address: String,
}

/// Claims a byte range of a file on a data connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadReq {
    /// File being requested
    pub file: FileExploreFile,
    /// First byte, inclusive
    pub start: u64,
    /// Last byte, exclusive
    pub end: u64,
}

/// Application failure reported by either transfer peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReq {
    /// Human readable reason
    pub error_msg: String,
}
