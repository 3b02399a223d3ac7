#![cfg_attr(target_arch = "bpf", no_std)]

//! Kernel-side pieces shared by the two probe objects.
//!
//! `prism-probe-ringbuf` emits through a BPF ring buffer (kernel 5.8+),
//! `prism-probe-perf` through a per-CPU perf event array. Both run the same
//! classifier body from `prism_ebpf_common::probe`.

#[cfg(target_arch = "bpf")]
pub use skb::SkbFrame;

#[cfg(target_arch = "bpf")]
mod skb {
    use aya_ebpf::programs::TcContext;
    use prism_ebpf_common::probe::Frame;

    /// [`Frame`] over the socket buffer of one classifier invocation.
    pub struct SkbFrame<'a> {
        ctx: &'a TcContext,
    }

    impl<'a> SkbFrame<'a> {
        #[inline(always)]
        pub fn new(ctx: &'a TcContext) -> Self {
            Self { ctx }
        }
    }

    impl Frame for SkbFrame<'_> {
        #[inline(always)]
        fn linearize(&mut self) {
            // On failure the linear area stays as it was; every read below is
            // still checked against data_end.
            let _ = self.ctx.pull_data(self.ctx.len());
        }

        #[inline(always)]
        fn len(&self) -> usize {
            self.ctx.data_end().saturating_sub(self.ctx.data())
        }

        #[inline(always)]
        fn load_u8(&self, offset: usize) -> Option<u8> {
            // data/data_end are re-read on every call: the verifier needs the
            // check next to the access.
            let start = self.ctx.data();
            let end = self.ctx.data_end();
            if start + offset + 1 > end {
                return None;
            }
            Some(unsafe { *((start + offset) as *const u8) })
        }
    }
}
