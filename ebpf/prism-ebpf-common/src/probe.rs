//! Per-packet capture logic for the TC classifiers.
//!
//! The probe binaries provide a [`Frame`] over the socket buffer and a
//! [`Transport`] over their event map; everything else lives here so it can be
//! exercised on the host. All code is written for the eBPF verifier: no
//! allocation, the copy loop is bounded by [`MAX_DATA_SIZE`], and every packet
//! byte goes through [`Frame::load_u8`], which re-checks the end of the linear
//! data area on each call.

use crate::{
    CapturedPacketEvent, Direction, ETH_HLEN, ETH_P_IP, HTTP_DATA_MIN_SIZE, IPPROTO_TCP,
    IPV4_HLEN, MAX_DATA_SIZE, TCP_HLEN, TC_ACT_OK,
};

/// Offset of the ethertype inside the Ethernet header
const ETHERTYPE_OFFSET: usize = 12;

/// Offset of the protocol field inside the IPv4 header
const IPV4_PROTOCOL_OFFSET: usize = 9;

/// Read access to the frame currently being classified.
pub trait Frame {
    /// Make the whole packet reachable from the linear data area.
    fn linearize(&mut self);

    /// Bytes between the start and the end of the linear data area.
    fn len(&self) -> usize;

    /// Read one byte, or `None` when `offset` is past the end of the data area.
    fn load_u8(&self, offset: usize) -> Option<u8>;

    #[inline(always)]
    fn load_be_u16(&self, offset: usize) -> Option<u16> {
        let hi = self.load_u8(offset)?;
        let lo = self.load_u8(offset + 1)?;
        Some(u16::from_be_bytes([hi, lo]))
    }
}

/// Space for one event handed out by a [`Transport`].
pub trait Reservation {
    fn event(&mut self) -> &mut CapturedPacketEvent;

    /// Make the event visible to userspace.
    fn submit(self);
}

/// Kernel-to-userspace event channel.
pub trait Transport {
    type Reservation: Reservation;

    /// Reserve space for one event; `None` when the channel is full.
    fn reserve(&self) -> Option<Self::Reservation>;
}

/// Why a frame was passed through without producing an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// Shorter than Ethernet + IPv4 + TCP headers
    TooShortForHeaders,
    NotIpv4,
    NotTcp,
    /// At or below [`HTTP_DATA_MIN_SIZE`]
    BelowHttpMinimum,
    /// Reservation failed
    TransportFull,
}

/// Classifier body. Always returns [`TC_ACT_OK`]: the probe only observes.
#[inline(always)]
pub fn capture_packet<F: Frame, T: Transport>(
    frame: &mut F,
    transport: &T,
    direction: Direction,
) -> i32 {
    match try_capture(frame, transport, direction) {
        Ok(_) => TC_ACT_OK,
        Err(_) => TC_ACT_OK,
    }
}

/// Run the capture steps and return the number of bytes copied.
#[inline(always)]
pub fn try_capture<F: Frame, T: Transport>(
    frame: &mut F,
    transport: &T,
    direction: Direction,
) -> Result<u32, Skip> {
    frame.linearize();

    let len = frame.len();
    if len < ETH_HLEN + IPV4_HLEN + TCP_HLEN {
        return Err(Skip::TooShortForHeaders);
    }

    if frame.load_be_u16(ETHERTYPE_OFFSET) != Some(ETH_P_IP) {
        return Err(Skip::NotIpv4);
    }

    if frame.load_u8(ETH_HLEN + IPV4_PROTOCOL_OFFSET) != Some(IPPROTO_TCP) {
        return Err(Skip::NotTcp);
    }

    if len <= HTTP_DATA_MIN_SIZE {
        return Err(Skip::BelowHttpMinimum);
    }

    let mut reservation = transport.reserve().ok_or(Skip::TransportFull)?;

    let event = reservation.event();
    event.direction = direction;
    let copied = copy_frame_prefix(frame, &mut event.payload);
    event.length = copied;

    reservation.submit();

    Ok(copied)
}

/// Copy `min(frame.len(), MAX_DATA_SIZE)` bytes from the start of the frame.
#[inline(always)]
pub fn copy_frame_prefix<F: Frame>(frame: &F, payload: &mut [u8; MAX_DATA_SIZE]) -> u32 {
    let mut copied: u32 = 0;
    for (offset, slot) in payload.iter_mut().enumerate() {
        match frame.load_u8(offset) {
            Some(byte) => {
                *slot = byte;
                copied += 1;
            }
            None => break,
        }
    }
    copied
}
