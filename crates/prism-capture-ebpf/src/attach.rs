//! TC attachment of the capture classifiers
//!
//! [`AttachmentManager`] owns the interface binding: it makes sure a `clsact`
//! qdisc exists, then installs one filter per direction with replace
//! semantics so at most one of our filters is active per direction. The
//! binding is released exactly once, either through [`AttachmentManager::detach`]
//! or when the manager is dropped.
//!
//! The kernel side sits behind [`TcBackend`] so the state machine can be
//! exercised without netlink.

use prism_ebpf_common::Direction;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Attachment errors
#[derive(Debug, Error)]
pub enum AttachError {
    #[error("failed to add clsact qdisc on {iface}: {reason}")]
    Qdisc { iface: String, reason: String },

    #[error("program {0} not found in probe object")]
    ProgramNotFound(&'static str),

    #[error("failed to load program {program}: {reason}")]
    Load {
        program: &'static str,
        reason: String,
    },

    #[error("failed to remove stale {program} filter on {iface}: {reason}")]
    RemoveStale {
        program: &'static str,
        iface: String,
        reason: String,
    },

    #[error("failed to attach {program} to {iface}: {reason}")]
    Attach {
        program: &'static str,
        iface: String,
        reason: String,
    },

    #[error("failed to detach {program} from {iface}: {reason}")]
    Detach {
        program: &'static str,
        iface: String,
        reason: String,
    },
}

/// Kernel traffic-control operations used by the manager
pub trait TcBackend {
    /// Handle for one installed filter
    type Link;

    /// Make sure a `clsact` qdisc exists. An existing one is not an error.
    fn ensure_clsact(&mut self, iface: &str) -> Result<(), AttachError>;

    /// Remove any filter carrying our program name at `direction`, including
    /// ones left behind by an earlier process. Nothing to remove is not an error.
    fn remove_stale(&mut self, iface: &str, direction: Direction) -> Result<(), AttachError>;

    /// Install the classifier for `direction`
    fn attach(&mut self, iface: &str, direction: Direction) -> Result<Self::Link, AttachError>;

    /// Remove a filter installed by [`TcBackend::attach`]
    fn detach(&mut self, iface: &str, direction: Direction, link: Self::Link)
        -> Result<(), AttachError>;
}

/// Lifecycle of the interface binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Detached,
    QdiscEnsured,
    IngressAttached,
    BothAttached,
    Detaching,
}

/// Owner of the qdisc and both filters on one interface
pub struct AttachmentManager<B: TcBackend> {
    backend: B,
    iface: String,
    ifindex: u32,
    state: BindingState,
    ingress: Option<B::Link>,
    egress: Option<B::Link>,
}

impl<B: TcBackend> AttachmentManager<B> {
    pub fn new(backend: B, iface: impl Into<String>, ifindex: u32) -> Self {
        Self {
            backend,
            iface: iface.into(),
            ifindex,
            state: BindingState::Detached,
            ingress: None,
            egress: None,
        }
    }

    pub fn state(&self) -> BindingState {
        self.state
    }

    pub fn interface(&self) -> &str {
        &self.iface
    }

    pub fn ifindex(&self) -> u32 {
        self.ifindex
    }

    /// Install both filters, replacing whatever was there.
    ///
    /// On error, filters installed so far stay held and are released by
    /// [`detach`](Self::detach) or on drop.
    pub fn attach(&mut self) -> Result<(), AttachError> {
        if self.state != BindingState::Detached {
            debug!("Re-attaching on {}, releasing current filters first", self.iface);
            self.detach();
        }

        self.backend.ensure_clsact(&self.iface)?;
        self.state = BindingState::QdiscEnsured;

        for direction in Direction::ALL {
            self.backend.remove_stale(&self.iface, direction)?;
            let link = self.backend.attach(&self.iface, direction)?;

            match direction {
                Direction::Ingress => {
                    self.ingress = Some(link);
                    self.state = BindingState::IngressAttached;
                }
                Direction::Egress => {
                    self.egress = Some(link);
                    self.state = BindingState::BothAttached;
                }
            }

            info!(
                "Attached {} to {} (ifindex {}, {})",
                direction.program_name(),
                self.iface,
                self.ifindex,
                direction.as_str()
            );
        }

        Ok(())
    }

    /// Remove both filters. Best effort: failures are logged and returned,
    /// never retried. Calling it again once detached does nothing.
    ///
    /// The `clsact` qdisc is left in place; other tools may share it.
    pub fn detach(&mut self) -> Vec<AttachError> {
        if self.state == BindingState::Detached {
            return Vec::new();
        }
        self.state = BindingState::Detaching;

        let mut errors = Vec::new();
        let held = [
            (Direction::Egress, self.egress.take()),
            (Direction::Ingress, self.ingress.take()),
        ];
        for (direction, link) in held {
            let Some(link) = link else { continue };
            match self.backend.detach(&self.iface, direction, link) {
                Ok(()) => info!(
                    "Detached {} from {}",
                    direction.program_name(),
                    self.iface
                ),
                Err(e) => {
                    warn!("{}", e);
                    errors.push(e);
                }
            }
        }

        self.state = BindingState::Detached;
        errors
    }
}

impl<B: TcBackend> Drop for AttachmentManager<B> {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(target_os = "linux")]
pub use aya_backend::AyaTcBackend;

#[cfg(target_os = "linux")]
mod aya_backend {
    use super::{AttachError, TcBackend};
    use aya::programs::tc::{self, NlOptions, SchedClassifierLinkId, TcAttachOptions};
    use aya::programs::{SchedClassifier, TcAttachType};
    use aya::Ebpf;
    use prism_ebpf_common::Direction;
    use std::io;
    use tracing::debug;

    const FILTER_PRIORITY: u16 = 1;
    const FILTER_HANDLE: u32 = 1;

    fn attach_type(direction: Direction) -> TcAttachType {
        match direction {
            Direction::Ingress => TcAttachType::Ingress,
            Direction::Egress => TcAttachType::Egress,
        }
    }

    /// Netlink-backed TC operations on a loaded probe object
    pub struct AyaTcBackend {
        ebpf: Ebpf,
    }

    impl AyaTcBackend {
        /// Load both classifiers into the kernel
        pub fn new(mut ebpf: Ebpf) -> Result<Self, AttachError> {
            for direction in Direction::ALL {
                let name = direction.program_name();
                let program: &mut SchedClassifier = ebpf
                    .program_mut(name)
                    .ok_or(AttachError::ProgramNotFound(name))?
                    .try_into()
                    .map_err(|e: aya::programs::ProgramError| AttachError::Load {
                        program: name,
                        reason: e.to_string(),
                    })?;
                program.load().map_err(|e| AttachError::Load {
                    program: name,
                    reason: e.to_string(),
                })?;
                debug!("Loaded classifier {}", name);
            }
            Ok(Self { ebpf })
        }

        fn classifier(&mut self, name: &'static str) -> Result<&mut SchedClassifier, AttachError> {
            self.ebpf
                .program_mut(name)
                .ok_or(AttachError::ProgramNotFound(name))?
                .try_into()
                .map_err(|e: aya::programs::ProgramError| AttachError::Load {
                    program: name,
                    reason: e.to_string(),
                })
        }
    }

    impl TcBackend for AyaTcBackend {
        type Link = SchedClassifierLinkId;

        fn ensure_clsact(&mut self, iface: &str) -> Result<(), AttachError> {
            match tc::qdisc_add_clsact(iface) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!("clsact qdisc already present on {}", iface);
                    Ok(())
                }
                Err(e) => Err(AttachError::Qdisc {
                    iface: iface.to_string(),
                    reason: e.to_string(),
                }),
            }
        }

        fn remove_stale(&mut self, iface: &str, direction: Direction) -> Result<(), AttachError> {
            let name = direction.program_name();
            match tc::qdisc_detach_program(iface, attach_type(direction), name) {
                Ok(()) => {
                    debug!("Removed stale {} filter on {}", name, iface);
                    Ok(())
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(AttachError::RemoveStale {
                    program: name,
                    iface: iface.to_string(),
                    reason: e.to_string(),
                }),
            }
        }

        fn attach(&mut self, iface: &str, direction: Direction) -> Result<Self::Link, AttachError> {
            let name = direction.program_name();
            let options = TcAttachOptions::Netlink(NlOptions {
                priority: FILTER_PRIORITY,
                handle: FILTER_HANDLE,
            });
            self.classifier(name)?
                .attach_with_options(iface, attach_type(direction), options)
                .map_err(|e| AttachError::Attach {
                    program: name,
                    iface: iface.to_string(),
                    reason: e.to_string(),
                })
        }

        fn detach(
            &mut self,
            iface: &str,
            direction: Direction,
            link: Self::Link,
        ) -> Result<(), AttachError> {
            let name = direction.program_name();
            self.classifier(name)?
                .detach(link)
                .map_err(|e| AttachError::Detach {
                    program: name,
                    iface: iface.to_string(),
                    reason: e.to_string(),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;

    /// In-memory traffic-control table for one host
    #[derive(Default)]
    struct TcTable {
        clsact: bool,
        /// Active filters: (direction, program) -> handle
        filters: Vec<(Direction, &'static str, u32)>,
        next_handle: u32,
        fail_attach: HashMap<&'static str, String>,
        fail_detach: bool,
        detach_calls: usize,
    }

    impl TcTable {
        fn count(&self, direction: Direction) -> usize {
            self.filters.iter().filter(|(d, _, _)| *d == direction).count()
        }
    }

    #[derive(Clone, Default)]
    struct FakeTc(Rc<RefCell<TcTable>>);

    impl TcBackend for FakeTc {
        type Link = u32;

        fn ensure_clsact(&mut self, _iface: &str) -> Result<(), AttachError> {
            self.0.borrow_mut().clsact = true;
            Ok(())
        }

        fn remove_stale(&mut self, _iface: &str, direction: Direction) -> Result<(), AttachError> {
            let name = direction.program_name();
            self.0
                .borrow_mut()
                .filters
                .retain(|(d, p, _)| !(*d == direction && *p == name));
            Ok(())
        }

        fn attach(&mut self, iface: &str, direction: Direction) -> Result<u32, AttachError> {
            let mut table = self.0.borrow_mut();
            let name = direction.program_name();
            if !table.clsact {
                return Err(AttachError::Attach {
                    program: name,
                    iface: iface.to_string(),
                    reason: "no clsact qdisc".into(),
                });
            }
            if let Some(reason) = table.fail_attach.get(name) {
                return Err(AttachError::Attach {
                    program: name,
                    iface: iface.to_string(),
                    reason: reason.clone(),
                });
            }
            table.next_handle += 1;
            let handle = table.next_handle;
            table.filters.push((direction, name, handle));
            Ok(handle)
        }

        fn detach(&mut self, iface: &str, direction: Direction, link: u32) -> Result<(), AttachError> {
            let mut table = self.0.borrow_mut();
            table.detach_calls += 1;
            if table.fail_detach {
                return Err(AttachError::Detach {
                    program: direction.program_name(),
                    iface: iface.to_string(),
                    reason: "netlink said no".into(),
                });
            }
            table.filters.retain(|(_, _, h)| *h != link);
            Ok(())
        }
    }

    fn manager(tc: &FakeTc) -> AttachmentManager<FakeTc> {
        AttachmentManager::new(tc.clone(), "lo", 1)
    }

    #[test]
    fn test_attach_installs_both_filters() {
        let tc = FakeTc::default();
        let mut mgr = manager(&tc);
        assert_eq!(mgr.state(), BindingState::Detached);

        mgr.attach().unwrap();
        assert_eq!(mgr.state(), BindingState::BothAttached);

        let table = tc.0.borrow();
        assert!(table.clsact);
        assert_eq!(table.count(Direction::Ingress), 1);
        assert_eq!(table.count(Direction::Egress), 1);
    }

    #[test]
    fn test_attach_twice_keeps_one_filter_per_direction() {
        let tc = FakeTc::default();
        let mut mgr = manager(&tc);

        mgr.attach().unwrap();
        mgr.attach().unwrap();

        let table = tc.0.borrow();
        assert_eq!(table.count(Direction::Ingress), 1);
        assert_eq!(table.count(Direction::Egress), 1);
    }

    #[test]
    fn test_attach_replaces_stale_filters_from_previous_run() {
        let tc = FakeTc::default();
        {
            let mut crashed = manager(&tc);
            crashed.attach().unwrap();
            // Simulate a process that died without cleaning up
            std::mem::forget(crashed);
        }
        assert_eq!(tc.0.borrow().filters.len(), 2);

        let mut mgr = manager(&tc);
        mgr.attach().unwrap();

        let table = tc.0.borrow();
        assert_eq!(table.count(Direction::Ingress), 1);
        assert_eq!(table.count(Direction::Egress), 1);
    }

    #[test]
    fn test_detach_removes_both_filters() {
        let tc = FakeTc::default();
        let mut mgr = manager(&tc);
        mgr.attach().unwrap();

        let errors = mgr.detach();
        assert!(errors.is_empty());
        assert_eq!(mgr.state(), BindingState::Detached);
        assert!(tc.0.borrow().filters.is_empty());
        // qdisc is shared and stays
        assert!(tc.0.borrow().clsact);
    }

    #[test]
    fn test_detach_is_idempotent() {
        let tc = FakeTc::default();
        let mut mgr = manager(&tc);
        mgr.attach().unwrap();

        mgr.detach();
        mgr.detach();
        drop(mgr);
        assert_eq!(tc.0.borrow().detach_calls, 2);
    }

    #[test]
    fn test_drop_releases_binding() {
        let tc = FakeTc::default();
        {
            let mut mgr = manager(&tc);
            mgr.attach().unwrap();
        }
        assert!(tc.0.borrow().filters.is_empty());
    }

    #[test]
    fn test_partial_attach_released_on_drop() {
        let tc = FakeTc::default();
        tc.0
            .borrow_mut()
            .fail_attach
            .insert(prism_ebpf_common::EGRESS_PROGRAM, "EPERM".into());

        {
            let mut mgr = manager(&tc);
            let err = mgr.attach().unwrap_err();
            assert!(matches!(err, AttachError::Attach { program, .. }
                if program == prism_ebpf_common::EGRESS_PROGRAM));
            assert_eq!(mgr.state(), BindingState::IngressAttached);
            assert_eq!(tc.0.borrow().count(Direction::Ingress), 1);
        }

        assert!(tc.0.borrow().filters.is_empty());
    }

    #[test]
    fn test_detach_failure_is_reported_not_fatal() {
        let tc = FakeTc::default();
        let mut mgr = manager(&tc);
        mgr.attach().unwrap();
        tc.0.borrow_mut().fail_detach = true;

        let errors = mgr.detach();
        assert_eq!(errors.len(), 2);
        assert_eq!(mgr.state(), BindingState::Detached);

        // Not retried on drop
        drop(mgr);
        assert_eq!(tc.0.borrow().detach_calls, 2);
    }

    #[test]
    fn test_detach_before_attach_does_nothing() {
        let tc = FakeTc::default();
        let mut mgr = manager(&tc);
        assert!(mgr.detach().is_empty());
        assert_eq!(tc.0.borrow().detach_calls, 0);
        assert_eq!(mgr.interface(), "lo");
        assert_eq!(mgr.ifindex(), 1);
    }
}
