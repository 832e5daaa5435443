use log::{info, warn};
use std::io;

/// Soft fd limit we ask for, both for this process and for every pane.
pub const DEFAULT_NOFILE_TARGET: u64 = 1_048_576;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NofileLimit {
    pub soft: u64,
    pub hard: u64,
}

pub fn current_nofile_limit() -> io::Result<NofileLimit> {
    let mut rlim = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let ret = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(NofileLimit {
        soft: rlim.rlim_cur as u64,
        hard: rlim.rlim_max as u64,
    })
}

fn set_nofile_limit(limit: NofileLimit) -> io::Result<()> {
    let rlim = libc::rlimit {
        rlim_cur: limit.soft as libc::rlim_t,
        rlim_max: limit.hard as libc::rlim_t,
    };
    let ret = unsafe { libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// New soft limit to apply, or `None` when the current one already reaches
/// the target.
pub fn plan_nofile_raise(current: NofileLimit, target: u64) -> Option<u64> {
    if current.soft >= target {
        return None;
    }
    Some(target.min(current.hard))
}

/// Raises this process's RLIMIT_NOFILE soft limit toward `target`.
///
/// Never fails: problems are logged and the process keeps its old limit.
/// Returns the limit in effect afterwards when it could be read.
pub fn raise_nofile_limit(target: u64) -> Option<NofileLimit> {
    let current = match current_nofile_limit() {
        Ok(limit) => limit,
        Err(err) => {
            warn!("Could not raise RLIMIT_NOFILE: {err}");
            return None;
        }
    };
    let Some(new_soft) = plan_nofile_raise(current, target) else {
        return Some(current);
    };
    let raised = NofileLimit {
        soft: new_soft,
        hard: current.hard,
    };
    match set_nofile_limit(raised) {
        Ok(()) => {
            info!("Raised RLIMIT_NOFILE from {} to {}", current.soft, new_soft);
            Some(raised)
        }
        Err(err) => {
            warn!("Could not raise RLIMIT_NOFILE: {err}");
            Some(current)
        }
    }
}
