#![cfg_attr(target_arch = "bpf", no_std)]
#![cfg_attr(target_arch = "bpf", no_main)]

#[cfg(not(target_arch = "bpf"))]
fn main() {}

#[cfg(target_arch = "bpf")]
use aya_ebpf::{
    macros::{classifier, map},
    maps::{PerCpuArray, RingBuf, ring_buf::RingBufEntry},
    programs::TcContext,
};
#[cfg(target_arch = "bpf")]
use prism_ebpf_common::{
    CapturedPacketEvent, Direction, RING_BUF_BYTE_SIZE,
    probe::{Reservation, Transport, capture_packet},
};
#[cfg(target_arch = "bpf")]
use prism_ebpf_probe::SkbFrame;

// =============================================================================
// Maps
// =============================================================================

/// Ring buffer for sending captured frames to userspace
/// Size: 256KB - holds ~65 full-size events
#[cfg(target_arch = "bpf")]
#[map]
static HTTP_EVENTS: RingBuf = RingBuf::with_byte_size(RING_BUF_BYTE_SIZE, 0);

/// BPF programs are limited to a 512-byte stack, so event-sized values live
/// in a per-CPU slot. In this object the ring buffer reservation is the real
/// storage; the slot lookup still gates the capture.
#[cfg(target_arch = "bpf")]
#[map]
static SCRATCH: PerCpuArray<CapturedPacketEvent> = PerCpuArray::with_max_entries(1, 0);

// =============================================================================
// Transport
// =============================================================================

#[cfg(target_arch = "bpf")]
struct RingTransport;

#[cfg(target_arch = "bpf")]
struct RingSlot(RingBufEntry<CapturedPacketEvent>);

#[cfg(target_arch = "bpf")]
impl Reservation for RingSlot {
    #[inline(always)]
    fn event(&mut self) -> &mut CapturedPacketEvent {
        unsafe { &mut *self.0.as_mut_ptr() }
    }

    #[inline(always)]
    fn submit(self) {
        self.0.submit(0);
    }
}

#[cfg(target_arch = "bpf")]
impl Transport for RingTransport {
    type Reservation = RingSlot;

    #[inline(always)]
    fn reserve(&self) -> Option<RingSlot> {
        let _scratch = SCRATCH.get_ptr_mut(0)?;
        let mut entry = HTTP_EVENTS.reserve::<CapturedPacketEvent>(0)?;
        // Reserved memory holds whatever the last record left there
        unsafe { CapturedPacketEvent::init_header(entry.as_mut_ptr()) };
        Some(RingSlot(entry))
    }
}

// =============================================================================
// Classifiers
// =============================================================================

/// http_tap_ingress is called for packets coming into the interface
#[cfg(target_arch = "bpf")]
#[classifier]
pub fn http_tap_ingress(ctx: TcContext) -> i32 {
    capture_packet(&mut SkbFrame::new(&ctx), &RingTransport, Direction::Ingress)
}

/// http_tap_egress is called for packets leaving the interface
#[cfg(target_arch = "bpf")]
#[classifier]
pub fn http_tap_egress(ctx: TcContext) -> i32 {
    capture_packet(&mut SkbFrame::new(&ctx), &RingTransport, Direction::Egress)
}

#[cfg(target_arch = "bpf")]
#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    loop {}
}

#[cfg(target_arch = "bpf")]
#[unsafe(link_section = "license")]
#[unsafe(no_mangle)]
static LICENSE: [u8; 13] = *b"Dual MIT/GPL\0";
