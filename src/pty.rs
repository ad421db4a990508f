#![cfg_attr(not(target_family = "unix"), allow(dead_code))]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::channel::{ChannelLauncher, ChildExit, ProcessSignaller, ReadOutcome, ReplChannel, ReplSignal};
use crate::error::SessionError;

#[cfg(target_family = "unix")]
pub use self::unix::PtyChannel;

/// Launches the REPL attached to a fresh pseudo-terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct PtyLauncher;

impl ChannelLauncher for PtyLauncher {
    fn launch(&self, program: &Path, args: &[String]) -> Result<Box<dyn ReplChannel>, SessionError> {
        #[cfg(target_family = "unix")]
        {
            let channel = unix::PtyChannel::spawn(program, args)?;
            Ok(Box::new(channel))
        }
        #[cfg(not(target_family = "unix"))]
        {
            let _ = (program, args);
            Err(SessionError::Startup(
                "driving Stata requires a unix-style pty".to_string(),
            ))
        }
    }
}

#[cfg(target_family = "unix")]
mod unix {
    use std::fs::File;
    use std::io::{Read, Write};
    use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
    use std::os::unix::process::{CommandExt, ExitStatusExt};
    use std::process::{Child, Command, Stdio};
    use std::time::Instant;

    use super::*;

    const WRITE_STALL_TIMEOUT: Duration = Duration::from_secs(5);

    pub struct PtyChannel {
        master: File,
        child: Child,
        signaller: Arc<GroupSignaller>,
        exit: Option<ChildExit>,
    }

    /// Signals the child's process group. The child is a session leader, so its group id is its
    /// pid and anything it spawned receives the signal too.
    struct GroupSignaller {
        pid: i32,
    }

    impl ProcessSignaller for GroupSignaller {
        fn signal(&self, signal: ReplSignal) -> Result<(), SessionError> {
            let signo = match signal {
                ReplSignal::Interrupt => libc::SIGINT,
                ReplSignal::Terminate => libc::SIGTERM,
                ReplSignal::Kill => libc::SIGKILL,
            };
            let result = unsafe { libc::kill(-self.pid, signo) };
            if result == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            // Already gone.
            if err.raw_os_error() == Some(libc::ESRCH) {
                return Ok(());
            }
            Err(SessionError::Io(err))
        }
    }

    impl PtyChannel {
        pub fn spawn(program: &Path, args: &[String]) -> Result<Self, SessionError> {
            let (master, slave) =
                open_pty_pair().map_err(|err| SessionError::startup("failed to open pty", err))?;
            let slave_fd = slave.as_raw_fd();

            let mut child = {
                let stdin = slave
                    .try_clone()
                    .map_err(|err| SessionError::startup("failed to clone pty", err))?;
                let stdout = slave
                    .try_clone()
                    .map_err(|err| SessionError::startup("failed to clone pty", err))?;
                let stderr = slave;
                let mut command = Command::new(program);
                command
                    .args(args)
                    .stdin(Stdio::from(stdin))
                    .stdout(Stdio::from(stdout))
                    .stderr(Stdio::from(stderr));
                unsafe {
                    command.pre_exec(move || {
                        if libc::setsid() < 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                        if libc::ioctl(slave_fd, libc::TIOCSCTTY as _, 0) < 0 {
                            return Err(std::io::Error::last_os_error());
                        }
                        Ok(())
                    });
                }
                // The command (and with it the parent's copies of the slave side) is dropped at the
                // end of this block, so reads see EOF once the child exits.
                command.spawn().map_err(|err| {
                    SessionError::startup(&format!("failed to launch {}", program.display()), err)
                })?
            };

            if let Some(status) = child.try_wait()? {
                return Err(SessionError::Startup(format!(
                    "{} exited immediately with {}",
                    program.display(),
                    exit_from_status(status)
                )));
            }
            if let Err(err) = set_nonblocking(master.as_raw_fd()) {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SessionError::startup("failed to configure pty", err));
            }

            let pid = child.id() as i32;
            Ok(Self {
                master,
                child,
                signaller: Arc::new(GroupSignaller { pid }),
                exit: None,
            })
        }

        fn wait_writable(&self, timeout: Duration) -> std::io::Result<bool> {
            let mut fds = libc::pollfd {
                fd: self.master.as_raw_fd(),
                events: libc::POLLOUT,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut fds, 1, duration_to_poll_ms(timeout)) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    return Ok(false);
                }
                return Err(err);
            }
            Ok(rc > 0 && fds.revents & libc::POLLOUT != 0)
        }
    }

    impl ReplChannel for PtyChannel {
        fn pid(&self) -> Option<u32> {
            Some(self.child.id())
        }

        fn write_all(&mut self, bytes: &[u8]) -> Result<(), SessionError> {
            let mut offset = 0usize;
            let mut stalled_since: Option<Instant> = None;
            while offset < bytes.len() {
                match self.master.write(&bytes[offset..]) {
                    Ok(0) => {
                        return Err(SessionError::Io(std::io::Error::new(
                            std::io::ErrorKind::WriteZero,
                            "pty accepted no bytes",
                        )));
                    }
                    Ok(written) => {
                        offset += written;
                        stalled_since = None;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                        let since = *stalled_since.get_or_insert_with(Instant::now);
                        if since.elapsed() >= WRITE_STALL_TIMEOUT {
                            return Err(SessionError::Io(std::io::Error::new(
                                std::io::ErrorKind::TimedOut,
                                format!("short write to pty ({offset} of {} bytes)", bytes.len()),
                            )));
                        }
                        self.wait_writable(Duration::from_millis(50))?;
                    }
                    Err(err) => return Err(SessionError::Io(err)),
                }
            }
            Ok(())
        }

        fn poll_read(
            &mut self,
            buf: &mut [u8],
            timeout: Duration,
        ) -> Result<ReadOutcome, SessionError> {
            let mut fds = libc::pollfd {
                fd: self.master.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            };
            let rc = unsafe { libc::poll(&mut fds, 1, duration_to_poll_ms(timeout)) };
            if rc < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    return Ok(ReadOutcome::Idle);
                }
                return Err(SessionError::Io(err));
            }
            if rc == 0 {
                return Ok(ReadOutcome::Idle);
            }
            if fds.revents & libc::POLLIN == 0 {
                if fds.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
                    return Ok(ReadOutcome::Closed);
                }
                return Ok(ReadOutcome::Idle);
            }
            match self.master.read(buf) {
                Ok(0) => Ok(ReadOutcome::Closed),
                Ok(n) => Ok(ReadOutcome::Data(n)),
                Err(err)
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::Interrupted
                    ) =>
                {
                    Ok(ReadOutcome::Idle)
                }
                // Linux reports EIO on the master once every slave descriptor is closed.
                Err(err) if err.raw_os_error() == Some(libc::EIO) => Ok(ReadOutcome::Closed),
                Err(err) => Err(SessionError::Io(err)),
            }
        }

        fn signaller(&self) -> Arc<dyn ProcessSignaller> {
            self.signaller.clone()
        }

        fn try_wait(&mut self) -> Result<Option<ChildExit>, SessionError> {
            if self.exit.is_none()
                && let Some(status) = self.child.try_wait()?
            {
                self.exit = Some(exit_from_status(status));
            }
            Ok(self.exit)
        }

        fn wait(&mut self) -> Result<ChildExit, SessionError> {
            if let Some(exit) = self.exit {
                return Ok(exit);
            }
            let exit = exit_from_status(self.child.wait()?);
            self.exit = Some(exit);
            Ok(exit)
        }
    }

    impl Drop for PtyChannel {
        fn drop(&mut self) {
            if matches!(self.try_wait(), Ok(None)) {
                let _ = self.signaller.signal(ReplSignal::Kill);
                let _ = self.child.wait();
            }
        }
    }

    fn exit_from_status(status: std::process::ExitStatus) -> ChildExit {
        if let Some(signal) = status.signal() {
            return ChildExit::Signal(signal);
        }
        match status.code() {
            Some(code) => ChildExit::Code(code),
            None => ChildExit::Unknown,
        }
    }

    fn duration_to_poll_ms(duration: Duration) -> libc::c_int {
        let millis = duration.as_millis();
        if millis > libc::c_int::MAX as u128 {
            libc::c_int::MAX
        } else {
            millis as libc::c_int
        }
    }

    fn set_cloexec(fd: RawFd, enabled: bool) -> std::io::Result<()> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let new_flags = if enabled {
            flags | libc::FD_CLOEXEC
        } else {
            flags & !libc::FD_CLOEXEC
        };
        if unsafe { libc::fcntl(fd, libc::F_SETFD, new_flags) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_nonblocking(fd: RawFd) -> std::io::Result<()> {
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }

    fn open_pty_pair() -> std::io::Result<(File, File)> {
        let mut master: RawFd = -1;
        let mut slave: RawFd = -1;
        let result = unsafe {
            libc::openpty(
                &mut master,
                &mut slave,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
            )
        };
        if result != 0 {
            return Err(std::io::Error::last_os_error());
        }
        let master_file = unsafe { File::from_raw_fd(master) };
        let slave_file = unsafe { File::from_raw_fd(slave) };
        set_cloexec(master, true)?;
        set_cloexec(slave, true)?;
        Ok((master_file, slave_file))
    }

}
