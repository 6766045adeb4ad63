//! Background-mode plumbing: the classic double fork, a pid file, and
//! stdio redirection so log output survives the detach.

use std::{fs, io, process};

pub const PID_FILE: &str = "/tmp/lnsd.pid";
pub const LOG_FILE: &str = "/tmp/lnsd.log";

fn cvt(result: libc::c_int) -> io::Result<libc::c_int> {
    if result < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(result)
    }
}

/// Detaches the process from its terminal. The first fork hands control
/// back to the shell, `setsid` sheds the controlling terminal, and the
/// second fork keeps the daemon from ever reacquiring one. Standard input
/// comes from `/dev/null` afterwards; stdout and stderr append to the log
/// file, which is where the logger already writes.
pub fn daemonize() -> io::Result<()> {
    unsafe {
        if cvt(libc::fork())? > 0 {
            libc::_exit(0);
        }

        cvt(libc::setsid())?;

        if cvt(libc::fork())? > 0 {
            libc::_exit(0);
        }

        cvt(libc::chdir(c"/".as_ptr()))?;

        let null = cvt(libc::open(c"/dev/null".as_ptr(), libc::O_RDWR))?;
        cvt(libc::dup2(null, libc::STDIN_FILENO))?;

        let log = cvt(libc::open(
            c"/tmp/lnsd.log".as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
            0o644 as libc::c_uint,
        ))?;
        cvt(libc::dup2(log, libc::STDOUT_FILENO))?;
        cvt(libc::dup2(log, libc::STDERR_FILENO))?;

        if null > libc::STDERR_FILENO {
            libc::close(null);
        }
        if log > libc::STDERR_FILENO {
            libc::close(log);
        }
    }

    fs::write(PID_FILE, format!("{}\n", process::id()))?;

    Ok(())
}
