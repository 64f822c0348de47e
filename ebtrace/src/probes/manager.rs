//! Probe lifecycle bookkeeping.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};

use super::backend::{EbpfBackend, ProbeBackend};
use super::spec::{AttachPoint, ProgramSpec};
use crate::domain::AttachError;

/// Identifier of an attachment within one manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProbeId(pub u64);

impl fmt::Display for ProbeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "probe#{}", self.0)
    }
}

/// Lifecycle of one attachment.
///
/// `Loaded` → `Attached` → `Detached`; `Failed` when load or attach gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeState {
    Loaded,
    Attached,
    Detached,
    Failed,
}

/// Caller-facing token for an attachment.
///
/// Only meaningful to the manager that issued it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeHandle {
    id: ProbeId,
    program: String,
    attach_point: AttachPoint,
}

impl ProbeHandle {
    #[must_use]
    pub fn id(&self) -> ProbeId {
        self.id
    }

    #[must_use]
    pub fn program(&self) -> &str {
        &self.program
    }

    #[must_use]
    pub fn attach_point(&self) -> &AttachPoint {
        &self.attach_point
    }
}

/// Retry behavior for transient kernel resource exhaustion.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retry_exhausted: bool,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { retry_exhausted: false, backoff: Duration::from_millis(100) }
    }
}

struct ProbeRecord<L> {
    spec: ProgramSpec,
    state: ProbeState,
    link: Option<L>,
}

/// Outcome of attaching a batch of specs.
#[derive(Debug, Default)]
pub struct AttachSummary {
    pub attached: Vec<ProbeHandle>,
    pub failed: Vec<(ProgramSpec, AttachError)>,
}

/// Loads, attaches and detaches eBPF programs, tracking every attachment.
///
/// Whatever is still attached when the manager is dropped gets detached.
pub struct ProbeManager<B: ProbeBackend = EbpfBackend> {
    backend: B,
    probes: BTreeMap<ProbeId, ProbeRecord<B::Link>>,
    next_id: u64,
    retry: RetryPolicy,
}

impl<B: ProbeBackend> ProbeManager<B> {
    pub fn new(backend: B) -> Self {
        Self { backend, probes: BTreeMap::new(), next_id: 1, retry: RetryPolicy::default() }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Load the program named by `spec` and attach it.
    ///
    /// A failed attempt is still recorded (as [`ProbeState::Failed`]) so
    /// that [`failed_count`](Self::failed_count) reflects it.
    ///
    /// # Errors
    /// Returns the classified kernel failure; only resource exhaustion is
    /// retried, once, after unloading idle programs and only when the retry
    /// policy allows it
    pub fn attach(&mut self, spec: &ProgramSpec) -> Result<ProbeHandle, AttachError> {
        let id = ProbeId(self.next_id);
        self.next_id += 1;
        self.probes.insert(id, ProbeRecord { spec: spec.clone(), state: ProbeState::Failed, link: None });

        let mut result = self.try_attach(id, spec);
        if let Err(e) = &result {
            if e.is_retryable() && self.retry.retry_exhausted {
                let released = self.release_idle(&spec.program);
                warn!(
                    "{e}; released {released} idle program(s), retrying {} once in {:?}",
                    spec.program, self.retry.backoff
                );
                std::thread::sleep(self.retry.backoff);
                result = self.try_attach(id, spec);
            }
        }

        match result {
            Ok(link) => {
                if let Some(record) = self.probes.get_mut(&id) {
                    record.state = ProbeState::Attached;
                    record.link = Some(link);
                }
                info!("✓ Attached {} to {}", spec.program, spec.attach_point);
                Ok(ProbeHandle {
                    id,
                    program: spec.program.clone(),
                    attach_point: spec.attach_point.clone(),
                })
            }
            Err(e) => {
                if let Some(record) = self.probes.get_mut(&id) {
                    record.state = ProbeState::Failed;
                }
                Err(e)
            }
        }
    }

    /// Unload programs that no attached probe uses, except `keep`.
    ///
    /// Returns how many programs were unloaded.
    fn release_idle(&mut self, keep: &str) -> usize {
        let in_use: BTreeSet<&str> = self
            .probes
            .values()
            .filter(|record| record.state == ProbeState::Attached)
            .map(|record| record.spec.program.as_str())
            .collect();
        let idle: BTreeSet<String> = self
            .probes
            .values()
            .map(|record| record.spec.program.as_str())
            .filter(|program| *program != keep && !in_use.contains(program))
            .map(str::to_string)
            .collect();

        let mut released = 0;
        for program in idle {
            match self.backend.unload(&program) {
                Ok(()) => released += 1,
                Err(e) => debug!("{e}"),
            }
        }
        released
    }

    fn try_attach(&mut self, id: ProbeId, spec: &ProgramSpec) -> Result<B::Link, AttachError> {
        self.backend.load(&spec.program, spec.attach_point.program_kind())?;
        if let Some(record) = self.probes.get_mut(&id) {
            record.state = ProbeState::Loaded;
        }
        self.backend.attach(&spec.program, &spec.attach_point)
    }

    /// Attach every spec, collecting successes and failures.
    ///
    /// Failures are logged and do not stop the remaining specs.
    pub fn attach_all(&mut self, specs: &[ProgramSpec]) -> AttachSummary {
        let mut summary = AttachSummary::default();
        for spec in specs {
            match self.attach(spec) {
                Ok(handle) => summary.attached.push(handle),
                Err(e) => {
                    warn!("⚠️  {e}");
                    summary.failed.push((spec.clone(), e));
                }
            }
        }
        summary
    }

    /// Detach one attachment. Detaching twice is a no-op.
    ///
    /// # Errors
    /// Returns [`AttachError::UnknownHandle`] for handles issued by another
    /// manager and [`AttachError::DetachFailed`] if the kernel refuses
    pub fn detach(&mut self, handle: &ProbeHandle) -> Result<(), AttachError> {
        self.detach_id(handle.id)
    }

    fn detach_id(&mut self, id: ProbeId) -> Result<(), AttachError> {
        let record = self.probes.get_mut(&id).ok_or(AttachError::UnknownHandle(id.0))?;
        match record.state {
            ProbeState::Attached => {
                // The link is consumed either way; a failed detach leaves
                // nothing to retry.
                record.state = ProbeState::Detached;
                let Some(link) = record.link.take() else {
                    return Ok(());
                };
                let program = record.spec.program.clone();
                self.backend.detach(&program, link)?;
                debug!("Detached {program} ({id})");
                Ok(())
            }
            ProbeState::Loaded => {
                record.state = ProbeState::Detached;
                Ok(())
            }
            ProbeState::Detached | ProbeState::Failed => Ok(()),
        }
    }

    /// Detach everything still attached. Returns how many were detached.
    ///
    /// Individual failures are logged and do not stop the sweep.
    pub fn detach_all(&mut self) -> usize {
        let attached: Vec<ProbeId> = self
            .probes
            .iter()
            .filter(|(_, record)| record.state == ProbeState::Attached)
            .map(|(id, _)| *id)
            .collect();

        let mut detached = 0;
        for id in attached {
            match self.detach_id(id) {
                Ok(()) => detached += 1,
                Err(e) => warn!("⚠️  {e}"),
            }
        }
        if detached > 0 {
            info!("Detached {detached} probe(s)");
        }
        detached
    }

    #[must_use]
    pub fn state(&self, handle: &ProbeHandle) -> Option<ProbeState> {
        self.probes.get(&handle.id).map(|record| record.state)
    }

    #[must_use]
    pub fn is_active(&self, handle: &ProbeHandle) -> bool {
        self.state(handle) == Some(ProbeState::Attached)
    }

    #[must_use]
    pub fn attached_count(&self) -> usize {
        self.count(ProbeState::Attached)
    }

    #[must_use]
    pub fn failed_count(&self) -> usize {
        self.count(ProbeState::Failed)
    }

    fn count(&self, state: ProbeState) -> usize {
        self.probes.values().filter(|record| record.state == state).count()
    }
}

impl<B: ProbeBackend> Drop for ProbeManager<B> {
    fn drop(&mut self) {
        if self.attached_count() > 0 {
            self.detach_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probes::spec::ProgramKind;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    /// Backend double recording kernel calls.
    #[derive(Default, Clone)]
    struct FakeBackend {
        pub calls: Arc<Mutex<Vec<String>>>,
        pub attach_failures: Arc<Mutex<HashMap<String, VecDeque<AttachError>>>>,
        pub load_failures: Arc<Mutex<HashMap<String, AttachError>>>,
        next_link: u64,
    }

    impl FakeBackend {
        pub fn fail_attach(&self, program: &str, err: AttachError) {
            self.attach_failures
                .lock()
                .unwrap()
                .entry(program.to_string())
                .or_default()
                .push_back(err);
        }

        pub fn fail_load(&self, program: &str, err: AttachError) {
            self.load_failures.lock().unwrap().insert(program.to_string(), err);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ProbeBackend for FakeBackend {
        type Link = u64;

        fn load(&mut self, program: &str, _kind: ProgramKind) -> Result<(), AttachError> {
            self.calls.lock().unwrap().push(format!("load {program}"));
            match self.load_failures.lock().unwrap().remove(program) {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }

        fn attach(&mut self, program: &str, point: &AttachPoint) -> Result<u64, AttachError> {
            self.calls.lock().unwrap().push(format!("attach {program} {point}"));
            let queued = self
                .attach_failures
                .lock()
                .unwrap()
                .get_mut(program)
                .and_then(VecDeque::pop_front);
            if let Some(err) = queued {
                return Err(err);
            }
            self.next_link += 1;
            Ok(self.next_link)
        }

        fn detach(&mut self, program: &str, link: u64) -> Result<(), AttachError> {
            self.calls.lock().unwrap().push(format!("detach {program} {link}"));
            Ok(())
        }

        fn unload(&mut self, program: &str) -> Result<(), AttachError> {
            self.calls.lock().unwrap().push(format!("unload {program}"));
            Ok(())
        }
    }

    fn spec(program: &str, function: &str) -> ProgramSpec {
        ProgramSpec::new(program, AttachPoint::KProbe { function: function.into(), offset: 0 })
    }

    fn exhausted(program: &str) -> AttachError {
        AttachError::ResourceExhausted { program: program.into(), reason: "ENOMEM".into() }
    }

    #[test]
    fn test_attach_then_detach() {
        let backend = FakeBackend::default();
        let mut manager = ProbeManager::new(backend.clone());

        let handle = manager.attach(&spec("trace_send", "tcp_sendmsg")).unwrap();
        assert!(manager.is_active(&handle));
        assert_eq!(manager.attached_count(), 1);

        manager.detach(&handle).unwrap();
        assert!(!manager.is_active(&handle));
        assert_eq!(manager.state(&handle), Some(ProbeState::Detached));
        assert_eq!(
            backend.calls(),
            vec!["load trace_send", "attach trace_send kprobe:tcp_sendmsg", "detach trace_send 1"]
        );
    }

    #[test]
    fn test_detach_is_idempotent() {
        let backend = FakeBackend::default();
        let mut manager = ProbeManager::new(backend.clone());
        let handle = manager.attach(&spec("trace_send", "tcp_sendmsg")).unwrap();

        manager.detach(&handle).unwrap();
        manager.detach(&handle).unwrap();
        assert_eq!(manager.detach_all(), 0);

        let detaches = backend.calls().iter().filter(|c| c.starts_with("detach")).count();
        assert_eq!(detaches, 1);
    }

    #[test]
    fn test_foreign_handle_rejected() {
        let mut first = ProbeManager::new(FakeBackend::default());
        let mut second = ProbeManager::new(FakeBackend::default());
        let handle = first.attach(&spec("a", "tcp_sendmsg")).unwrap();
        first.detach(&handle).unwrap();

        let foreign = ProbeHandle { id: ProbeId(99), ..handle };
        assert!(matches!(second.detach(&foreign), Err(AttachError::UnknownHandle(99))));
    }

    #[test]
    fn test_missing_target_recorded_as_failed() {
        let backend = FakeBackend::default();
        backend.fail_attach(
            "trace_missing",
            AttachError::AttachTargetMissing {
                program: "trace_missing".into(),
                target: "kprobe:no_such_fn".into(),
            },
        );
        let mut manager = ProbeManager::new(backend);

        let err = manager.attach(&spec("trace_missing", "no_such_fn")).unwrap_err();
        assert!(matches!(err, AttachError::AttachTargetMissing { .. }));
        assert_eq!(manager.failed_count(), 1);
        assert_eq!(manager.attached_count(), 0);
    }

    #[test]
    fn test_load_rejection_skips_attach() {
        let backend = FakeBackend::default();
        backend.fail_load(
            "trace_bad",
            AttachError::LoadRejected { program: "trace_bad".into(), reason: "invalid mem access".into() },
        );
        let mut manager = ProbeManager::new(backend.clone());

        assert!(manager.attach(&spec("trace_bad", "tcp_sendmsg")).is_err());
        assert_eq!(backend.calls(), vec!["load trace_bad"]);
    }

    #[test]
    fn test_exhaustion_retried_once_when_enabled() {
        let backend = FakeBackend::default();
        backend.fail_attach("trace_send", exhausted("trace_send"));
        let mut manager = ProbeManager::new(backend.clone()).with_retry(RetryPolicy {
            retry_exhausted: true,
            backoff: Duration::from_millis(1),
        });

        let handle = manager.attach(&spec("trace_send", "tcp_sendmsg")).unwrap();
        assert!(manager.is_active(&handle));
        let attaches = backend.calls().iter().filter(|c| c.starts_with("attach")).count();
        assert_eq!(attaches, 2);
    }

    #[test]
    fn test_retry_releases_idle_programs_first() {
        let backend = FakeBackend::default();
        backend.fail_attach(
            "trace_idle",
            AttachError::AttachFailed { program: "trace_idle".into(), target: "t".into(), reason: "EINVAL".into() },
        );
        backend.fail_attach("trace_recv", exhausted("trace_recv"));
        let mut manager = ProbeManager::new(backend.clone()).with_retry(RetryPolicy {
            retry_exhausted: true,
            backoff: Duration::from_millis(1),
        });

        let summary = manager.attach_all(&[
            spec("trace_send", "tcp_sendmsg"),
            spec("trace_idle", "f2"),
            spec("trace_recv", "tcp_recvmsg"),
        ]);
        assert_eq!(summary.attached.len(), 2);

        let calls = backend.calls();
        let unloads: Vec<&String> = calls.iter().filter(|c| c.starts_with("unload")).collect();
        assert_eq!(unloads, vec!["unload trace_idle"]);

        let unload_at = calls.iter().position(|c| c == "unload trace_idle").unwrap();
        let retry_at = calls.iter().rposition(|c| c.starts_with("attach trace_recv")).unwrap();
        assert!(unload_at < retry_at);
    }

    #[test]
    fn test_exhaustion_not_retried_by_default() {
        let backend = FakeBackend::default();
        backend.fail_attach("trace_send", exhausted("trace_send"));
        let mut manager = ProbeManager::new(backend.clone());

        let err = manager.attach(&spec("trace_send", "tcp_sendmsg")).unwrap_err();
        assert!(err.is_retryable());
        let attaches = backend.calls().iter().filter(|c| c.starts_with("attach")).count();
        assert_eq!(attaches, 1);
        assert!(!backend.calls().iter().any(|c| c.starts_with("unload")));
    }

    #[test]
    fn test_attach_all_continues_past_failures() {
        let backend = FakeBackend::default();
        backend.fail_attach(
            "b",
            AttachError::AttachFailed { program: "b".into(), target: "t".into(), reason: "EINVAL".into() },
        );
        let mut manager = ProbeManager::new(backend);

        let summary = manager.attach_all(&[spec("a", "f1"), spec("b", "f2"), spec("c", "f3")]);
        assert_eq!(summary.attached.len(), 2);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed[0].0.program, "b");
    }

    #[test]
    fn test_drop_detaches_everything() {
        let backend = FakeBackend::default();
        {
            let mut manager = ProbeManager::new(backend.clone());
            manager.attach(&spec("a", "f1")).unwrap();
            manager.attach(&spec("b", "f2")).unwrap();
        }
        let detaches = backend.calls().iter().filter(|c| c.starts_with("detach")).count();
        assert_eq!(detaches, 2);
    }
}
