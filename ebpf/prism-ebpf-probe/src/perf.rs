#![cfg_attr(target_arch = "bpf", no_std)]
#![cfg_attr(target_arch = "bpf", no_main)]

#[cfg(not(target_arch = "bpf"))]
fn main() {}

#[cfg(target_arch = "bpf")]
use aya_ebpf::{
    macros::{classifier, map},
    maps::{PerCpuArray, PerfEventArray},
    programs::TcContext,
};
#[cfg(target_arch = "bpf")]
use prism_ebpf_common::{
    CapturedPacketEvent, Direction,
    probe::{Reservation, Transport, capture_packet},
};
#[cfg(target_arch = "bpf")]
use prism_ebpf_probe::SkbFrame;

// =============================================================================
// Maps
// =============================================================================

/// Per-CPU perf buffers for kernels without BPF ring buffer support
#[cfg(target_arch = "bpf")]
#[map]
static HTTP_EVENTS: PerfEventArray<CapturedPacketEvent> = PerfEventArray::new(0);

/// BPF programs are limited to a 512-byte stack. The event is assembled in
/// this per-CPU slot and copied out by perf_event_output.
#[cfg(target_arch = "bpf")]
#[map]
static SCRATCH: PerCpuArray<CapturedPacketEvent> = PerCpuArray::with_max_entries(1, 0);

// =============================================================================
// Transport
// =============================================================================

#[cfg(target_arch = "bpf")]
struct PerfTransport<'a> {
    ctx: &'a TcContext,
}

#[cfg(target_arch = "bpf")]
struct PerfSlot<'a> {
    ctx: &'a TcContext,
    event: *mut CapturedPacketEvent,
}

#[cfg(target_arch = "bpf")]
impl Reservation for PerfSlot<'_> {
    #[inline(always)]
    fn event(&mut self) -> &mut CapturedPacketEvent {
        unsafe { &mut *self.event }
    }

    #[inline(always)]
    fn submit(self) {
        // A full per-CPU buffer drops the sample; userspace sees it in the lost count.
        HTTP_EVENTS.output(self.ctx, unsafe { &*self.event }, 0);
    }
}

#[cfg(target_arch = "bpf")]
impl<'a> Transport for PerfTransport<'a> {
    type Reservation = PerfSlot<'a>;

    #[inline(always)]
    fn reserve(&self) -> Option<PerfSlot<'a>> {
        let event = SCRATCH.get_ptr_mut(0)?;
        Some(PerfSlot {
            ctx: self.ctx,
            event,
        })
    }
}

// =============================================================================
// Classifiers
// =============================================================================

/// http_tap_ingress is called for packets coming into the interface
#[cfg(target_arch = "bpf")]
#[classifier]
pub fn http_tap_ingress(ctx: TcContext) -> i32 {
    let transport = PerfTransport { ctx: &ctx };
    capture_packet(&mut SkbFrame::new(&ctx), &transport, Direction::Ingress)
}

/// http_tap_egress is called for packets leaving the interface
#[cfg(target_arch = "bpf")]
#[classifier]
pub fn http_tap_egress(ctx: TcContext) -> i32 {
    let transport = PerfTransport { ctx: &ctx };
    capture_packet(&mut SkbFrame::new(&ctx), &transport, Direction::Egress)
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
