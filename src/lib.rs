//! An embedded software-defined Ethernet switch and IPv4 router.
//!
//! Gatewire provides the packet-processing core for small embedded
//! gateways: a multi-port Ethernet switch with a plugin pipeline
//! (MAC-address learning, 802.1Q VLAN membership and rate limiting),
//! an IPv4 router with longest-prefix routing, deferred forwarding
//! with ARP resolution, and ICMP error generation, plus the minimal
//! host-side protocol stack (Ethernet, ARP, IPv4, ICMP, UDP) that
//! keeps the switch and router reachable.
//!
//! The crate is `no_std` (with `alloc`) and single-threaded by
//! design: everything runs inside one cooperative event loop that
//! alternates between draining port buffers and servicing timers.
//! All long-lived state is allocated up front; per-packet storage
//! comes from a fixed, reference-counted buffer pool. Time and
//! randomness are explicit dependencies ([`util::Clock`] and
//! [`util::Prng`]) so that tests can run fully deterministic.

#![no_std]
#![warn(rust_2018_idioms)]

#[macro_use]
extern crate alloc;
#[macro_use]
extern crate log;

pub mod config;
pub mod eth;
pub mod iface;
pub mod io;
pub mod ip;
pub mod net;
pub mod router;
pub mod switch;
pub mod udp;
pub mod util;

pub use crate::eth::{EthHeader, EtherType, MacAddr, VlanTag};
pub use crate::io::{Readable, StreamError, Writeable};
pub use crate::ip::IpHeader;
pub use crate::net::Type;
pub use crate::router::Router;
pub use crate::switch::{PortMask, SwitchCore, SwitchPort};
