//! Kernel side of probe attachment.
//!
//! [`ProbeBackend`] is the seam between the bookkeeping in
//! [`ProbeManager`](super::ProbeManager) and the kernel. [`EbpfBackend`] is
//! the aya implementation used by the agent.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use aya::maps::Map;
use aya::programs::kprobe::KProbeLinkId;
use aya::programs::trace_point::TracePointLinkId;
use aya::programs::uprobe::UProbeLinkId;
use aya::programs::{KProbe, ProbeKind, Program, TracePoint, UProbe};
use aya::Ebpf;
use aya_log::EbpfLogger;
use log::{debug, info};

use super::spec::{AttachPoint, ProgramKind, UprobeLocation};
use super::targets::{kernel_function_names, tracepoint_exists};
use crate::domain::AttachError;

/// Loads and attaches programs on behalf of a `ProbeManager`.
pub trait ProbeBackend {
    /// Kernel link returned by a successful attach
    type Link;

    /// Load `program` into the kernel. Loading an already loaded program is a no-op.
    ///
    /// # Errors
    /// Returns a classified [`AttachError`] on failure
    fn load(&mut self, program: &str, kind: ProgramKind) -> Result<(), AttachError>;

    /// Attach a loaded program.
    ///
    /// # Errors
    /// Returns a classified [`AttachError`] on failure
    fn attach(&mut self, program: &str, point: &AttachPoint) -> Result<Self::Link, AttachError>;

    /// Remove a link created by [`attach`](Self::attach).
    ///
    /// # Errors
    /// Returns [`AttachError::DetachFailed`] on failure
    fn detach(&mut self, program: &str, link: Self::Link) -> Result<(), AttachError>;

    /// Unload a program with no remaining links, releasing its kernel
    /// resources. Unloading a program that is not loaded is a no-op.
    ///
    /// # Errors
    /// Returns [`AttachError::DetachFailed`] on failure
    fn unload(&mut self, program: &str) -> Result<(), AttachError>;
}

/// Link handle for any program type the agent attaches.
#[derive(Debug)]
pub enum EbpfLink {
    KProbe(KProbeLinkId),
    TracePoint(TracePointLinkId),
    UProbe(UProbeLinkId),
}

/// aya-backed [`ProbeBackend`] owning the loaded object.
pub struct EbpfBackend {
    bpf: Ebpf,
    loaded: HashSet<String>,
    kallsyms: PathBuf,
    kernel_functions: OnceLock<Option<HashSet<String>>>,
}

impl EbpfBackend {
    /// Load a compiled eBPF object file.
    ///
    /// Must be called from within a tokio runtime: the aya-log reader runs
    /// as a task.
    ///
    /// # Errors
    /// Returns an error if the object cannot be parsed or its maps cannot be created
    pub fn load_file(path: &Path) -> Result<Self, AttachError> {
        let bpf = Ebpf::load_file(path).map_err(|e| {
            let label = path.display().to_string();
            match classify(&e) {
                ErrnoClass::Permission => AttachError::PermissionDenied { program: label },
                ErrnoClass::Exhausted => {
                    AttachError::ResourceExhausted { program: label, reason: e.to_string() }
                }
                _ => AttachError::ObjectLoadFailed { path: label, reason: e.to_string() },
            }
        })?;
        info!("Loaded eBPF object {}", path.display());
        Ok(Self::from_ebpf(bpf))
    }

    #[must_use]
    pub fn from_ebpf(mut bpf: Ebpf) -> Self {
        init_ebpf_logger(&mut bpf);
        Self {
            bpf,
            loaded: HashSet::new(),
            kallsyms: PathBuf::from("/proc/kallsyms"),
            kernel_functions: OnceLock::new(),
        }
    }

    /// Move a map out of the object (e.g. the perf event array).
    pub fn take_map(&mut self, name: &str) -> Option<Map> {
        self.bpf.take_map(name)
    }

    fn program_mut(&mut self, program: &str) -> Result<&mut Program, AttachError> {
        self.bpf
            .program_mut(program)
            .ok_or_else(|| AttachError::ProgramNotFound(program.to_string()))
    }

    fn check_target(&self, program: &str, point: &AttachPoint) -> Result<(), AttachError> {
        let present = match point {
            AttachPoint::KProbe { function, .. } | AttachPoint::KRetProbe { function } => self
                .kernel_functions
                .get_or_init(|| kernel_function_names(&self.kallsyms).ok())
                .as_ref()
                .map(|names| names.contains(function)),
            AttachPoint::TracePoint { category, name } => tracepoint_exists(category, name),
            AttachPoint::UProbe { target, .. } | AttachPoint::URetProbe { target, .. } => {
                Some(target.exists())
            }
        };
        if present == Some(false) {
            return Err(AttachError::AttachTargetMissing {
                program: program.to_string(),
                target: point.to_string(),
            });
        }
        Ok(())
    }
}

/// Initialize eBPF logger
fn init_ebpf_logger(bpf: &mut Ebpf) {
    if let Err(e) = EbpfLogger::init(bpf) {
        debug!("eBPF logger not initialized: {e}");
    }
}

fn wrong_type(program: &str, expected: ProgramKind) -> AttachError {
    let expected = match expected {
        ProgramKind::KProbe => "kprobe",
        ProgramKind::TracePoint => "tracepoint",
        ProgramKind::UProbe => "uprobe",
    };
    AttachError::WrongProgramType { program: program.to_string(), expected }
}

/// aya picks entry or return from the program's section, so the attach
/// point has to agree with what the program was compiled as.
fn check_probe_direction(
    program: &str,
    point: &AttachPoint,
    actual: ProbeKind,
) -> Result<(), AttachError> {
    let (agrees, expected) = match point {
        AttachPoint::KProbe { .. } => (matches!(actual, ProbeKind::KProbe), "kprobe"),
        AttachPoint::KRetProbe { .. } => (matches!(actual, ProbeKind::KRetProbe), "kretprobe"),
        AttachPoint::UProbe { .. } => (matches!(actual, ProbeKind::UProbe), "uprobe"),
        AttachPoint::URetProbe { .. } => (matches!(actual, ProbeKind::URetProbe), "uretprobe"),
        AttachPoint::TracePoint { .. } => return Ok(()),
    };
    if agrees {
        Ok(())
    } else {
        Err(AttachError::WrongProgramType { program: program.to_string(), expected })
    }
}

impl ProbeBackend for EbpfBackend {
    type Link = EbpfLink;

    fn load(&mut self, program: &str, kind: ProgramKind) -> Result<(), AttachError> {
        if self.loaded.contains(program) {
            return Ok(());
        }
        let prog = self.program_mut(program)?;
        let result = match kind {
            ProgramKind::KProbe => {
                let p: &mut KProbe = prog.try_into().map_err(|_| wrong_type(program, kind))?;
                p.load()
            }
            ProgramKind::TracePoint => {
                let p: &mut TracePoint = prog.try_into().map_err(|_| wrong_type(program, kind))?;
                p.load()
            }
            ProgramKind::UProbe => {
                let p: &mut UProbe = prog.try_into().map_err(|_| wrong_type(program, kind))?;
                p.load()
            }
        };
        result.map_err(|e| load_error(program, &e))?;
        debug!("Loaded {kind} program {program}");
        self.loaded.insert(program.to_string());
        Ok(())
    }

    fn attach(&mut self, program: &str, point: &AttachPoint) -> Result<EbpfLink, AttachError> {
        self.check_target(program, point)?;
        let kind = point.program_kind();
        let prog = self.program_mut(program)?;
        let result = match point {
            AttachPoint::KProbe { function, offset } => {
                let p: &mut KProbe = prog.try_into().map_err(|_| wrong_type(program, kind))?;
                check_probe_direction(program, point, p.kind())?;
                p.attach(function, *offset).map(EbpfLink::KProbe)
            }
            AttachPoint::KRetProbe { function } => {
                let p: &mut KProbe = prog.try_into().map_err(|_| wrong_type(program, kind))?;
                check_probe_direction(program, point, p.kind())?;
                p.attach(function, 0).map(EbpfLink::KProbe)
            }
            AttachPoint::TracePoint { category, name } => {
                let p: &mut TracePoint = prog.try_into().map_err(|_| wrong_type(program, kind))?;
                p.attach(category, name).map(EbpfLink::TracePoint)
            }
            AttachPoint::UProbe { target, location, pid }
            | AttachPoint::URetProbe { target, location, pid } => {
                let p: &mut UProbe = prog.try_into().map_err(|_| wrong_type(program, kind))?;
                check_probe_direction(program, point, p.kind())?;
                let pid = pid.map(|pid| pid.0);
                let (symbol, offset) = match location {
                    UprobeLocation::Symbol { name, offset } => (Some(name.as_str()), *offset),
                    UprobeLocation::Offset(offset) => (None, *offset),
                };
                p.attach(symbol, offset, target, pid).map(EbpfLink::UProbe)
            }
        };
        result.map_err(|e| attach_error(program, point, &e))
    }

    fn detach(&mut self, program: &str, link: EbpfLink) -> Result<(), AttachError> {
        let failed = |e: &dyn std::fmt::Display| AttachError::DetachFailed {
            program: program.to_string(),
            reason: e.to_string(),
        };
        let prog = self.program_mut(program)?;
        match link {
            EbpfLink::KProbe(id) => {
                let p: &mut KProbe =
                    prog.try_into().map_err(|_| wrong_type(program, ProgramKind::KProbe))?;
                p.detach(id).map_err(|e| failed(&e))
            }
            EbpfLink::TracePoint(id) => {
                let p: &mut TracePoint =
                    prog.try_into().map_err(|_| wrong_type(program, ProgramKind::TracePoint))?;
                p.detach(id).map_err(|e| failed(&e))
            }
            EbpfLink::UProbe(id) => {
                let p: &mut UProbe =
                    prog.try_into().map_err(|_| wrong_type(program, ProgramKind::UProbe))?;
                p.detach(id).map_err(|e| failed(&e))
            }
        }
    }

    fn unload(&mut self, program: &str) -> Result<(), AttachError> {
        if !self.loaded.contains(program) {
            return Ok(());
        }
        let result = match self.program_mut(program)? {
            Program::KProbe(p) => p.unload(),
            Program::TracePoint(p) => p.unload(),
            Program::UProbe(p) => p.unload(),
            _ => Ok(()),
        };
        result.map_err(|e| AttachError::DetachFailed {
            program: program.to_string(),
            reason: e.to_string(),
        })?;
        self.loaded.remove(program);
        debug!("Unloaded {program}");
        Ok(())
    }
}

/// Coarse classes of kernel errno values seen during load and attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrnoClass {
    Permission,
    Exhausted,
    Missing,
    Other,
}

impl ErrnoClass {
    pub(crate) fn from_errno(errno: i32) -> Self {
        match errno {
            libc::EPERM | libc::EACCES => ErrnoClass::Permission,
            libc::ENOMEM | libc::E2BIG | libc::ENOSPC | libc::EMFILE | libc::ENFILE => {
                ErrnoClass::Exhausted
            }
            libc::ENOENT | libc::ENODEV | libc::ENXIO => ErrnoClass::Missing,
            _ => ErrnoClass::Other,
        }
    }
}

/// First OS error code found along the error's source chain.
pub(crate) fn os_error(err: &(dyn std::error::Error + 'static)) -> Option<i32> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(code) = e.downcast_ref::<std::io::Error>().and_then(std::io::Error::raw_os_error)
        {
            return Some(code);
        }
        current = e.source();
    }
    None
}

fn classify(err: &(dyn std::error::Error + 'static)) -> ErrnoClass {
    os_error(err).map_or(ErrnoClass::Other, ErrnoClass::from_errno)
}

/// Map a program load failure onto the error taxonomy.
///
/// The verifier reports rejections as `EACCES`, so only `EPERM` means the
/// caller lacks privileges here.
pub(crate) fn load_error(program: &str, err: &(dyn std::error::Error + 'static)) -> AttachError {
    let program = program.to_string();
    match os_error(err) {
        Some(libc::EPERM) => AttachError::PermissionDenied { program },
        Some(errno) if ErrnoClass::from_errno(errno) == ErrnoClass::Exhausted => {
            AttachError::ResourceExhausted { program, reason: err.to_string() }
        }
        _ => AttachError::LoadRejected { program, reason: err.to_string() },
    }
}

pub(crate) fn attach_error(
    program: &str,
    point: &AttachPoint,
    err: &(dyn std::error::Error + 'static),
) -> AttachError {
    let program = program.to_string();
    match classify(err) {
        ErrnoClass::Permission => AttachError::PermissionDenied { program },
        ErrnoClass::Exhausted => AttachError::ResourceExhausted { program, reason: err.to_string() },
        ErrnoClass::Missing => AttachError::AttachTargetMissing { program, target: point.to_string() },
        ErrnoClass::Other => AttachError::AttachFailed {
            program,
            target: point.to_string(),
            reason: err.to_string(),
        },
    }
}
