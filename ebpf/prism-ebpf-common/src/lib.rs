#![cfg_attr(not(test), no_std)]

pub mod probe;

/// Payload bytes captured per frame
pub const MAX_DATA_SIZE: usize = 4000;

/// Frames of this length or shorter cannot hold an HTTP start-line and headers
pub const HTTP_DATA_MIN_SIZE: usize = 91;

/// Ring buffer size for the modern transport (256 KiB)
pub const RING_BUF_BYTE_SIZE: u32 = 256 * 1024;

/// Ethernet header length
pub const ETH_HLEN: usize = 14;

/// IPv4 header length (without options)
pub const IPV4_HLEN: usize = 20;

/// TCP header length (without options)
pub const TCP_HLEN: usize = 20;

/// Ethertype for IPv4
pub const ETH_P_IP: u16 = 0x0800;

/// IP protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;

/// TC verdict that hands the packet on untouched
pub const TC_ACT_OK: i32 = 0;

// =============================================================================
// Wire layout
// =============================================================================

/// Offset of the 4-byte direction tag
pub const DIRECTION_OFFSET: usize = 0;

/// Offset of the payload buffer
pub const PAYLOAD_OFFSET: usize = 4;

/// Offset of the 4-byte payload length
pub const LENGTH_OFFSET: usize = PAYLOAD_OFFSET + MAX_DATA_SIZE;

/// Size of one record as produced by the probe
pub const EVENT_SIZE: usize = LENGTH_OFFSET + 4;

// =============================================================================
// Object names shared by the probe and the loader
// =============================================================================

/// Classifier attached at the ingress hook
pub const INGRESS_PROGRAM: &str = "http_tap_ingress";

/// Classifier attached at the egress hook
pub const EGRESS_PROGRAM: &str = "http_tap_egress";

/// Transport map (ring buffer or perf event array, depending on the object)
pub const EVENTS_MAP: &str = "HTTP_EVENTS";

/// Per-CPU scratch arena
pub const SCRATCH_MAP: &str = "SCRATCH";

/// Hook a frame was observed at.
///
/// Encoded as a 4-byte little-endian integer on the wire.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Egress = 0,
    Ingress = 1,
}

impl Direction {
    /// Both hooks, in attach order
    pub const ALL: [Direction; 2] = [Direction::Ingress, Direction::Egress];

    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Direction::Egress),
            1 => Some(Direction::Ingress),
            _ => None,
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Direction::Egress => "egress",
            Direction::Ingress => "ingress",
        }
    }

    /// Name of the classifier program bound to this hook
    pub const fn program_name(&self) -> &'static str {
        match self {
            Direction::Egress => EGRESS_PROGRAM,
            Direction::Ingress => INGRESS_PROGRAM,
        }
    }
}

/// One captured frame, sent from kernel to userspace.
///
/// This struct is shared between the probe and userspace. It must be:
/// - `#[repr(C)]` so the layout matches the wire table
/// - `Copy` for eBPF map operations
/// - Fixed size (no dynamic allocation)
///
/// Bytes `[0, length)` of `payload` are a verbatim prefix of the frame;
/// anything beyond `length` is stale.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct CapturedPacketEvent {
    /// Hook that fired
    pub direction: Direction,
    /// Frame prefix
    pub payload: [u8; MAX_DATA_SIZE],
    /// Meaningful bytes in `payload`
    pub length: u32,
}

impl CapturedPacketEvent {
    /// Create a new zeroed event
    pub const fn zeroed() -> Self {
        Self {
            direction: Direction::Egress,
            payload: [0u8; MAX_DATA_SIZE],
            length: 0,
        }
    }

    /// Give the header fields of a freshly reserved, uninitialized slot valid
    /// values so a reference to it can be formed. The payload is untouched.
    ///
    /// # Safety
    ///
    /// `event` must be non-null, aligned and valid for writes of `Self`.
    #[inline(always)]
    pub unsafe fn init_header(event: *mut Self) {
        unsafe {
            core::ptr::addr_of_mut!((*event).direction).write(Direction::Egress);
            core::ptr::addr_of_mut!((*event).length).write(0);
        }
    }

    /// The meaningful part of the payload
    pub fn data(&self) -> &[u8] {
        let len = (self.length as usize).min(MAX_DATA_SIZE);
        &self.payload[..len]
    }
}

const _: () = assert!(core::mem::size_of::<CapturedPacketEvent>() == EVENT_SIZE);
