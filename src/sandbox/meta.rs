//! Isolate meta file parser
//!
//! Parses the `key:value` meta file isolate writes after a run.

/// Raw execution status from isolate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IsolateStatus {
    /// Program exited on its own (any exit code)
    Exited,
    /// Wall-clock or CPU limit exceeded
    TimeOut,
    /// Killed by signal
    Signal(i32),
    /// Isolate itself failed
    InternalError,
}

/// Parsed isolate meta file contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolateMeta {
    pub status: IsolateStatus,
    pub exit_code: i32,
    /// Wall clock time in milliseconds
    pub wall_time_ms: u32,
    /// Peak memory in KB (cg-mem or max-rss, whichever is larger)
    pub memory_kb: u32,
    /// Set when the cgroup OOM killer fired
    pub oom_killed: bool,
    /// Human-readable explanation from isolate, if any
    pub message: Option<String>,
}

impl Default for IsolateMeta {
    fn default() -> Self {
        Self {
            status: IsolateStatus::Exited,
            exit_code: 0,
            wall_time_ms: 0,
            memory_kb: 0,
            oom_killed: false,
            message: None,
        }
    }
}

/// Parse isolate meta file content.
///
/// An empty or unreadable meta file means isolate never got to report, which
/// is an internal error rather than a clean exit.
pub fn parse_meta(content: &str) -> IsolateMeta {
    let mut meta = IsolateMeta::default();
    let mut status = "";
    let mut signal = None;
    let mut saw_any = false;
    let mut bad_exit_code = None;

    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        saw_any = true;

        match key.trim() {
            "status" => status = value,
            "exitcode" => match value.parse() {
                Ok(code) => meta.exit_code = code,
                Err(_) => bad_exit_code = Some(value.to_string()),
            },
            "exitsig" => signal = value.parse::<i32>().ok(),
            "time-wall" => {
                if let Ok(t) = value.parse::<f64>() {
                    meta.wall_time_ms = (t * 1000.0) as u32;
                }
            }
            "cg-mem" | "max-rss" => {
                if let Ok(m) = value.parse::<u32>() {
                    meta.memory_kb = meta.memory_kb.max(m);
                }
            }
            "cg-oom-killed" => meta.oom_killed = value == "1",
            "message" => meta.message = Some(value.to_string()),
            _ => {}
        }
    }

    if let Some(value) = bad_exit_code {
        meta.status = IsolateStatus::InternalError;
        meta.message = Some(format!("unreadable exit code {:?}", value));
        return meta;
    }

    meta.status = match (status, signal) {
        ("XX", _) => IsolateStatus::InternalError,
        ("TO", _) => IsolateStatus::TimeOut,
        (_, Some(sig)) => IsolateStatus::Signal(sig),
        ("SG", None) => IsolateStatus::InternalError,
        _ if !saw_any => IsolateStatus::InternalError,
        _ => IsolateStatus::Exited,
    };

    if meta.status == IsolateStatus::InternalError && meta.message.is_none() {
        meta.message = Some("isolate did not report a usable status".to_string());
    }

    meta
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_meta_clean_exit() {
        let meta = parse_meta("time:0.015\ntime-wall:0.020\ncg-mem:1024\nexitcode:0\n");
        assert_eq!(meta.status, IsolateStatus::Exited);
        assert_eq!(meta.exit_code, 0);
        assert_eq!(meta.wall_time_ms, 20);
        assert_eq!(meta.memory_kb, 1024);
    }

    #[test]
    fn test_parse_meta_nonzero_exit() {
        let meta = parse_meta("status:RE\nexitcode:3\nmessage:Exited with error status 3\n");
        assert_eq!(meta.status, IsolateStatus::Exited);
        assert_eq!(meta.exit_code, 3);
    }

    #[test]
    fn test_parse_meta_timeout() {
        let meta = parse_meta("time-wall:2.001\nstatus:TO\nmessage:Time limit exceeded (wall clock)\n");
        assert_eq!(meta.status, IsolateStatus::TimeOut);
        assert_eq!(meta.wall_time_ms, 2001);
    }

    #[test]
    fn test_parse_meta_signal_and_oom() {
        let meta = parse_meta("status:SG\nexitsig:9\ncg-oom-killed:1\n");
        assert_eq!(meta.status, IsolateStatus::Signal(9));
        assert!(meta.oom_killed);
    }

    #[test]
    fn test_parse_meta_internal_error() {
        let meta = parse_meta("status:XX\nmessage:cannot set up cgroup\n");
        assert_eq!(meta.status, IsolateStatus::InternalError);
        assert_eq!(meta.message.as_deref(), Some("cannot set up cgroup"));

        let empty = parse_meta("");
        assert_eq!(empty.status, IsolateStatus::InternalError);
        assert!(empty.message.is_some());
    }

    #[test]
    fn test_parse_meta_garbled_exit_code_is_internal_error() {
        let meta = parse_meta("status:RE\nexitcode:3x\n");
        assert_eq!(meta.status, IsolateStatus::InternalError);
        assert_eq!(meta.exit_code, 0);
        assert!(meta.message.unwrap().contains("3x"));
    }
}
