//! Core primitives shared by the `pixel-wall` service.
//!
//! Nothing in here knows about sockets or an async runtime: the grid and the
//! one-time token store are plain lock-guarded state machines, which lets the
//! server crate and tests drive them directly.

pub mod grid;
pub mod otp;
pub mod protocol;

pub use grid::{GridError, GridSnapshot, GridState};
pub use otp::{OtpRecord, OtpStore, TokenGrant};
pub use protocol::{GridUpdate, TokenRequest, TokenRequestError, TokenResponse};
