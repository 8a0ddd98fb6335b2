use std::os::fd::RawFd;

use anyhow::{Context, Result};
use nix::errno::Errno;

use burrow::err;

pub const HANDOFF_VERSION: i32 = 1;

/* Well-known SysV key the continuation re-attaches under. The segment only
 * exists for the instant between execing ourselves and re-entering main. */
const HANDOFF_KEY: libc::key_t = 0xdeadbeef_u32 as libc::key_t;

pub const TITLE_SIZE: usize = 128;

/// Pointer-free record carried across the supervisor's internal re-exec.
/// The fds it names have CLOEXEC cleared for the crossing.
#[derive(Clone, Copy)]
#[repr(C)]
pub struct HandoffState {
    pub version: i32,
    pub listen_fd: RawFd,
    pub barrier_read_fd: RawFd,
    pub barrier_write_fd: RawFd,
    pub has_title: i32,
    pub title: [u8; TITLE_SIZE],
}

impl HandoffState {
    pub fn title(&self) -> Option<&str> {
        if self.has_title == 0 {
            return None;
        }
        let end = self
            .title
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.title.len());
        std::str::from_utf8(&self.title[..end]).ok()
    }

    pub fn set_title(&mut self, title: &str) {
        let len = title.len().min(TITLE_SIZE - 1);
        self.title = [0; TITLE_SIZE];
        self.title[..len].copy_from_slice(&title.as_bytes()[..len]);
        self.has_title = 1;
    }
}

fn attach(id: libc::c_int) -> nix::Result<*mut libc::c_void> {
    let addr = unsafe { libc::shmat(id, std::ptr::null(), 0) };
    if addr as isize == -1 {
        return Err(Errno::last());
    }
    Ok(addr)
}

/// Creates the segment; refuses to reuse one left over from a previous
/// supervisor (IPC_EXCL).
pub fn save(state: &HandoffState) -> Result<()> {
    let id = err(unsafe {
        libc::shmget(
            HANDOFF_KEY,
            std::mem::size_of::<HandoffState>(),
            libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
        )
    })
    .context("shmget")?;

    let addr = attach(id).context("shmat")?;
    unsafe {
        std::ptr::write(addr as *mut HandoffState, *state);
        err(libc::shmdt(addr)).context("shmdt")?;
    }
    Ok(())
}

/// Reads the state back and removes the segment so nothing outlives the
/// handoff.
pub fn load() -> Result<HandoffState> {
    let id = err(unsafe {
        libc::shmget(HANDOFF_KEY, std::mem::size_of::<HandoffState>(), 0o600)
    })
    .context("shmget")?;

    let addr = attach(id).context("shmat")?;
    let state = unsafe { std::ptr::read(addr as *const HandoffState) };
    unsafe {
        err(libc::shmdt(addr)).context("shmdt")?;
    }
    err(unsafe { libc::shmctl(id, libc::IPC_RMID, std::ptr::null_mut()) }).context("shmctl")?;

    Ok(state)
}
