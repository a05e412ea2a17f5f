#![doc = include_str!("../README.md")]

pub mod asr;
pub mod build_identity;
pub mod component;
pub mod fdr;
pub mod format;
pub mod ipsw;
pub mod provider;
pub mod restore;
pub mod restored;
pub mod tss;
mod util;

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub use restored::RestoredClient;
pub use util::{pretty_print_dictionary, pretty_print_plist};

/// A trait combining all required characteristics for a device communication socket
///
/// This serves as a convenience trait for any type that can be used as an asynchronous
/// read/write socket for device communication. Tokio's TcpStream and UnixStream
/// implement this trait.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

// Blanket implementation for any compatible type
impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Comprehensive error type for everything that can go wrong during a restore
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RestoreError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error),
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("http request failed")]
    Reqwest(#[from] reqwest::Error),
    #[error("zip archive error")]
    Zip(#[from] zip::result::ZipError),
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("no established connection")]
    NoEstablishedConnection,
    #[error("device is not in restore mode")]
    NotRestoreMode,
    #[error("receive timed out")]
    ReceiveTimeout,
    #[error("device did not leave restore mode")]
    StillInRestoreMode,

    #[error("ticket server returned a non-success status")]
    TssRequestFailed,
    #[error("ticket response is missing `{0}`")]
    TssMissingEntry(&'static str),

    #[error("`{0}` not found in the firmware archive")]
    IpswFileNotFound(String),
    #[error("build identity has no component `{0}`")]
    MissingComponent(String),
    #[error("build identity is missing `{0}`")]
    MalformedBuildIdentity(&'static str),

    #[error("component personalization failed: {0}")]
    Personalization(String),

    #[error("message is missing `{0}` or it has the wrong type")]
    MalformedMessage(&'static str),
    #[error("unknown firmware updater `{0}`")]
    UnknownUpdater(String),
    #[error("no baseband firmware element named `{0}`")]
    UnknownBasebandElement(String),
    #[error("filesystem transfer failed: {0}")]
    FilesystemTransfer(String),

    #[error("modem binary parse failed: {0}")]
    MbnParse(#[from] format::mbn::MbnError),
    #[error("firmware load script parse failed: {0}")]
    FlsParse(#[from] format::fls::FlsError),
    #[error("firmware table parse failed: {0}")]
    FtabParse(#[from] format::ftab::FtabError),

    #[error("restore failed with status {0}")]
    StatusFailure(u64),
    #[error("device reported error {0}")]
    AmrError(i64),
}
