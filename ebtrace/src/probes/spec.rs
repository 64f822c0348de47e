//! Attach-point specifications.
//!
//! A [`ProgramSpec`] names a program inside the loaded eBPF object and the
//! point it should be attached to. Specs are written on the command line as
//! `<kind>:<target>=<program>`:
//!
//! ```text
//! kprobe:tcp_sendmsg=trace_tcp_sendmsg
//! kprobe:tcp_sendmsg+0x10=trace_tcp_sendmsg_body
//! kretprobe:tcp_recvmsg=trace_tcp_recvmsg_ret
//! tracepoint:sched/sched_process_exec=trace_exec
//! uprobe:/usr/lib/libssl.so.3:SSL_write=trace_ssl_write
//! uprobe:/usr/bin/app:0x4f20@1234=trace_app
//! uretprobe:/usr/lib/libssl.so.3:SSL_read=trace_ssl_read_ret
//! ```

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::domain::{AttachError, Pid};

/// Program type needed for an attach point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProgramKind {
    KProbe,
    TracePoint,
    UProbe,
}

impl fmt::Display for ProgramKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ProgramKind::KProbe => "kprobe",
            ProgramKind::TracePoint => "tracepoint",
            ProgramKind::UProbe => "uprobe",
        })
    }
}

/// Where in the user binary a uprobe fires.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UprobeLocation {
    /// Symbol name plus offset into the symbol
    Symbol { name: String, offset: u64 },
    /// Raw file offset
    Offset(u64),
}

/// A kernel function, tracepoint or user-space probe point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AttachPoint {
    KProbe { function: String, offset: u64 },
    KRetProbe { function: String },
    TracePoint { category: String, name: String },
    UProbe { target: PathBuf, location: UprobeLocation, pid: Option<Pid> },
    URetProbe { target: PathBuf, location: UprobeLocation, pid: Option<Pid> },
}

impl AttachPoint {
    #[must_use]
    pub fn program_kind(&self) -> ProgramKind {
        match self {
            AttachPoint::KProbe { .. } | AttachPoint::KRetProbe { .. } => ProgramKind::KProbe,
            AttachPoint::TracePoint { .. } => ProgramKind::TracePoint,
            AttachPoint::UProbe { .. } | AttachPoint::URetProbe { .. } => ProgramKind::UProbe,
        }
    }
}

impl fmt::Display for AttachPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachPoint::KProbe { function, offset: 0 } => write!(f, "kprobe:{function}"),
            AttachPoint::KProbe { function, offset } => write!(f, "kprobe:{function}+{offset:#x}"),
            AttachPoint::KRetProbe { function } => write!(f, "kretprobe:{function}"),
            AttachPoint::TracePoint { category, name } => write!(f, "tracepoint:{category}/{name}"),
            AttachPoint::UProbe { target, location, pid } => {
                write_uprobe(f, "uprobe", target, location, *pid)
            }
            AttachPoint::URetProbe { target, location, pid } => {
                write_uprobe(f, "uretprobe", target, location, *pid)
            }
        }
    }
}

fn write_uprobe(
    f: &mut fmt::Formatter<'_>,
    kind: &str,
    target: &std::path::Path,
    location: &UprobeLocation,
    pid: Option<Pid>,
) -> fmt::Result {
    write!(f, "{kind}:{}:", target.display())?;
    match location {
        UprobeLocation::Symbol { name, offset: 0 } => write!(f, "{name}")?,
        UprobeLocation::Symbol { name, offset } => write!(f, "{name}+{offset:#x}")?,
        UprobeLocation::Offset(offset) => write!(f, "{offset:#x}")?,
    }
    if let Some(pid) = pid {
        write!(f, "@{}", pid.0)?;
    }
    Ok(())
}

/// A program in the loaded object plus where to attach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProgramSpec {
    pub program: String,
    pub attach_point: AttachPoint,
}

impl ProgramSpec {
    pub fn new(program: impl Into<String>, attach_point: AttachPoint) -> Self {
        Self { program: program.into(), attach_point }
    }
}

impl fmt::Display for ProgramSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.attach_point, self.program)
    }
}

impl FromStr for ProgramSpec {
    type Err = AttachError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| AttachError::InvalidSpec {
            spec: spec.to_string(),
            reason: reason.to_string(),
        };

        let (point, program) =
            spec.rsplit_once('=').ok_or_else(|| invalid("missing '=<program>'"))?;
        if program.is_empty() {
            return Err(invalid("empty program name"));
        }
        let (kind, target) =
            point.split_once(':').ok_or_else(|| invalid("missing '<kind>:' prefix"))?;
        if target.is_empty() {
            return Err(invalid("empty attach target"));
        }

        let attach_point = match kind {
            "kprobe" | "k" => {
                let (function, offset) = split_offset(target).map_err(|r| invalid(&r))?;
                AttachPoint::KProbe { function, offset }
            }
            "kretprobe" | "kr" => AttachPoint::KRetProbe { function: target.to_string() },
            "tracepoint" | "t" => {
                let (category, name) = target
                    .split_once('/')
                    .or_else(|| target.split_once(':'))
                    .ok_or_else(|| invalid("tracepoint must be <category>/<name>"))?;
                if category.is_empty() || name.is_empty() {
                    return Err(invalid("tracepoint must be <category>/<name>"));
                }
                AttachPoint::TracePoint { category: category.to_string(), name: name.to_string() }
            }
            "uprobe" | "u" | "uretprobe" | "ur" => {
                let (target, location, pid) = parse_uprobe_target(target).map_err(|r| invalid(&r))?;
                if kind.starts_with("ur") {
                    AttachPoint::URetProbe { target, location, pid }
                } else {
                    AttachPoint::UProbe { target, location, pid }
                }
            }
            other => return Err(invalid(&format!("unknown probe kind '{other}'"))),
        };

        Ok(ProgramSpec { program: program.to_string(), attach_point })
    }
}

fn parse_u64(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    };
    parsed.map_err(|_| format!("invalid number '{text}'"))
}

/// `name[+offset]`
fn split_offset(text: &str) -> Result<(String, u64), String> {
    match text.split_once('+') {
        Some((name, offset)) if !name.is_empty() => Ok((name.to_string(), parse_u64(offset)?)),
        Some(_) => Err("empty symbol name".to_string()),
        None => Ok((text.to_string(), 0)),
    }
}

/// `path:symbol[+offset][@pid]` or `path:0xaddr[@pid]`
fn parse_uprobe_target(text: &str) -> Result<(PathBuf, UprobeLocation, Option<Pid>), String> {
    let (rest, pid) = match text.rsplit_once('@') {
        Some((rest, pid)) => {
            let pid = pid.parse::<i32>().map_err(|_| format!("invalid pid '{pid}'"))?;
            (rest, Some(Pid(pid)))
        }
        None => (text, None),
    };

    let (path, location) =
        rest.rsplit_once(':').ok_or_else(|| "uprobe must be <path>:<symbol>".to_string())?;
    if path.is_empty() || location.is_empty() {
        return Err("uprobe must be <path>:<symbol>".to_string());
    }

    let location = if location.starts_with("0x") || location.chars().all(|c| c.is_ascii_digit()) {
        UprobeLocation::Offset(parse_u64(location)?)
    } else {
        let (name, offset) = split_offset(location)?;
        UprobeLocation::Symbol { name, offset }
    };

    Ok((PathBuf::from(path), location, pid))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kprobe() {
        let spec: ProgramSpec = "kprobe:tcp_sendmsg=trace_tcp_sendmsg".parse().unwrap();
        assert_eq!(spec.program, "trace_tcp_sendmsg");
        assert_eq!(
            spec.attach_point,
            AttachPoint::KProbe { function: "tcp_sendmsg".into(), offset: 0 }
        );
        assert_eq!(spec.attach_point.program_kind(), ProgramKind::KProbe);
    }

    #[test]
    fn test_parse_kprobe_with_offset() {
        let spec: ProgramSpec = "kprobe:tcp_sendmsg+0x10=p".parse().unwrap();
        assert_eq!(
            spec.attach_point,
            AttachPoint::KProbe { function: "tcp_sendmsg".into(), offset: 16 }
        );
    }

    #[test]
    fn test_parse_tracepoint() {
        let spec: ProgramSpec = "tracepoint:sched/sched_process_exec=trace_exec".parse().unwrap();
        assert_eq!(
            spec.attach_point,
            AttachPoint::TracePoint { category: "sched".into(), name: "sched_process_exec".into() }
        );
        assert_eq!(spec.to_string(), "tracepoint:sched/sched_process_exec=trace_exec");
    }

    #[test]
    fn test_parse_uprobe_symbol_and_pid() {
        let spec: ProgramSpec = "uprobe:/usr/lib/libssl.so.3:SSL_write@1234=ssl".parse().unwrap();
        assert_eq!(
            spec.attach_point,
            AttachPoint::UProbe {
                target: PathBuf::from("/usr/lib/libssl.so.3"),
                location: UprobeLocation::Symbol { name: "SSL_write".into(), offset: 0 },
                pid: Some(Pid(1234)),
            }
        );
    }

    #[test]
    fn test_parse_uretprobe_offset() {
        let spec: ProgramSpec = "uretprobe:/usr/bin/app:0x4f20=ret".parse().unwrap();
        assert_eq!(
            spec.attach_point,
            AttachPoint::URetProbe {
                target: PathBuf::from("/usr/bin/app"),
                location: UprobeLocation::Offset(0x4f20),
                pid: None,
            }
        );
        assert_eq!(spec.to_string(), "uretprobe:/usr/bin/app:0x4f20=ret");
    }

    #[test]
    fn test_invalid_specs() {
        for bad in [
            "kprobe:tcp_sendmsg",
            "kprobe:tcp_sendmsg=",
            "tcp_sendmsg=prog",
            "tracepoint:sched=prog",
            "uprobe:/usr/bin/app=prog",
            "uprobe:/usr/bin/app:sym@abc=prog",
            "fentry:tcp_sendmsg=prog",
            "kprobe:+0x10=prog",
        ] {
            let err = bad.parse::<ProgramSpec>().unwrap_err();
            assert!(matches!(err, AttachError::InvalidSpec { .. }), "{bad} parsed");
        }
    }
}
