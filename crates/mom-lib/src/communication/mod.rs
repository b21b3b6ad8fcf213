//! Host ↔ guest RPC
//!
//! Frames are a 4-byte little-endian length followed by a JSON document.
//! The host side talks through a [`GuestClient`]; the guest side answers
//! with a [`GuestServer`].

mod client;
pub mod codec;
mod messages;
mod server;

pub use client::{Connector, GuestClient, TcpConnector, TcpTransport, Transport};
pub use messages::{
    Allocation, Envelope, InquiryContent, Message, NotifyContent, TargetAllocation,
    TargetAllocationContent,
};
pub use server::{
    GuestServer, LocalTransport, ServerData, StoredAppTarget, StoredInquiry, StoredNotify,
};
