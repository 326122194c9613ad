//! Host networking for guests.
//!
//! Every guest gets a tap device attached to one host bridge. The bridge owns
//! the gateway address of the guest subnet.

mod bridge;

pub use bridge::HostNetwork;
