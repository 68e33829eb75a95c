//! Compile-time tuning parameters.
//!
//! These mirror the build-time options of the gateware: anything a
//! deployment may need to adjust without touching the algorithms.

/// Maximum number of switch or router ports. Port sets are carried
/// as bitmasks, so this must not exceed the width of
/// [`PortMask`](crate::switch::PortMask).
pub const MAX_PORTS: usize = 32;

/// Chunk granularity of the shared packet pool, in bytes.
pub const MBUF_CHUNK_BYTES: usize = 64;

/// Per-packet metadata words (source port index, VLAN snapshot, ...).
pub const MBUF_USER_WORDS: usize = 4;

/// Initial time-to-live for locally generated IPv4 packets.
pub const IP_DEFAULT_TTL: u8 = 128;

/// Minimum interval between repeated ARP queries for one address.
pub const ARP_RETRY_MSEC: u32 = 100;

/// Retry budget for deferred forwarding (initial query + retries).
pub const DEFER_RETRY_MAX: u16 = 4;

/// Timeout before the first deferred-forwarding retry. Each further
/// retry doubles the previous timeout.
pub const DEFER_RETRY_MSEC: u16 = 10;

/// Service interval for the deferred-forwarding timer.
pub const DEFER_POLL_MSEC: u32 = 3;

/// Service interval for the VLAN token-bucket refill timer.
pub const VLAN_RATE_MSEC: u32 = 1;

/// Capacity of the IPv4 routing table, including cached host routes.
pub const ROUTE_TABLE_SIZE: usize = 32;

/// Size of the hardware-offload frame buffer, in bytes.
pub const OFFLOAD_BUFF_BYTES: usize = 1600;

/// Frames shorter than this are zero-padded by the offload path.
pub const MIN_FRAME_BYTES: usize = 60;
