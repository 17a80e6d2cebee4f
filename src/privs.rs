//! Privilege drop and daemonization for root-started deployments.

use anyhow::{Context, Result, bail};
use std::ffi::CString;

/// Sheds root after resource acquisition. Group first: once the uid is
/// gone, the gid could no longer be changed. A root start without any
/// user/group configured is allowed but warned about.
pub fn drop_privileges(user: Option<&str>, group: Option<&str>) -> Result<()> {
    if unsafe { libc::geteuid() } != 0 {
        return Ok(());
    }
    if user.is_none() && group.is_none() {
        log::warn!("running as root without user/group configured");
        return Ok(());
    }

    if let Some(group) = group {
        let name = CString::new(group).context("invalid group name")?;
        let gr = unsafe { libc::getgrnam(name.as_ptr()) };
        if gr.is_null() {
            bail!("group '{group}' not found");
        }
        let gid = unsafe { (*gr).gr_gid };
        if unsafe { libc::setgid(gid) } != 0 {
            bail!(
                "failed to set group '{group}': {}",
                std::io::Error::last_os_error()
            );
        }
        log::info!("changed group to '{group}' (gid {gid})");
    }

    if let Some(user) = user {
        let name = CString::new(user).context("invalid user name")?;
        let pw = unsafe { libc::getpwnam(name.as_ptr()) };
        if pw.is_null() {
            bail!("user '{user}' not found");
        }
        let uid = unsafe { (*pw).pw_uid };
        if unsafe { libc::setuid(uid) } != 0 {
            bail!(
                "failed to set user '{user}': {}",
                std::io::Error::last_os_error()
            );
        }
        log::info!("changed user to '{user}' (uid {uid})");
    }

    Ok(())
}

/// Classic double fork: detach from session and terminal, park stdio on
/// /dev/null. Must run before any threads exist, so the caller invokes it
/// ahead of engine construction. Foreground is the default for service
/// managers.
pub fn daemonize() -> Result<()> {
    unsafe {
        match libc::fork() {
            -1 => bail!("fork failed: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }
        if libc::setsid() < 0 {
            bail!("setsid failed: {}", std::io::Error::last_os_error());
        }
        match libc::fork() {
            -1 => bail!("second fork failed: {}", std::io::Error::last_os_error()),
            0 => {}
            _ => libc::_exit(0),
        }

        if libc::chdir(c"/".as_ptr()) != 0 {
            log::warn!("chdir to / failed: {}", std::io::Error::last_os_error());
        }
        libc::umask(0);

        let null = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if null >= 0 {
            libc::dup2(null, 0);
            libc::dup2(null, 1);
            libc::dup2(null, 2);
            if null > 2 {
                libc::close(null);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unprivileged_process_skips_the_drop() {
        if unsafe { libc::geteuid() } != 0 {
            // Arguments are irrelevant without root; nothing to drop.
            assert!(drop_privileges(Some("nobody"), Some("nogroup")).is_ok());
        }
    }
}
