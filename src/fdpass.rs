use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::retry;

// SCM_RIGHTS payload bound: a session response carries at most four fds
pub const MAX_PASSED_FDS: usize = 4;

const CMSG_BUF_SIZE: usize = 64;

/// Sends `data` plus the given fds as one SCM_RIGHTS message. The fds stay
/// owned by the caller; the kernel installs duplicates on the receive side.
pub fn send_with_fds(sock: RawFd, data: &[u8], fds: &[RawFd]) -> nix::Result<usize> {
    assert!(fds.len() <= MAX_PASSED_FDS);

    let mut iov = libc::iovec {
        iov_base: data.as_ptr() as *mut libc::c_void,
        iov_len: data.len(),
    };
    let mut cmsg_buf = [0u8; CMSG_BUF_SIZE];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    if !fds.is_empty() {
        let payload = std::mem::size_of_val(fds);
        let space = unsafe { libc::CMSG_SPACE(payload as u32) } as usize;
        assert!(space <= cmsg_buf.len());

        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space as _;

        unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            (*cmsg).cmsg_len = libc::CMSG_LEN(payload as u32) as _;
            std::ptr::copy_nonoverlapping(
                fds.as_ptr() as *const u8,
                libc::CMSG_DATA(cmsg),
                payload,
            );
        }
    }

    let n = retry(|| unsafe { libc::sendmsg(sock, &msg, libc::MSG_NOSIGNAL) })?;
    Ok(n as usize)
}

/// Receives one message into `buf`, collecting any passed fds (CLOEXEC)
/// into `fds_out`. Returns the number of data bytes received; 0 means the
/// peer closed the connection.
pub fn recv_with_fds(sock: RawFd, buf: &mut [u8], fds_out: &mut Vec<OwnedFd>) -> nix::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut cmsg_buf = [0u8; CMSG_BUF_SIZE];

    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = retry(|| unsafe { libc::recvmsg(sock, &mut msg, libc::MSG_CMSG_CLOEXEC) })?;

    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let payload = (*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize;
                let data = libc::CMSG_DATA(cmsg) as *const RawFd;
                for i in 0..payload / std::mem::size_of::<RawFd>() {
                    let fd = std::ptr::read_unaligned(data.add(i));
                    fds_out.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&mut msg, cmsg);
        }
    }

    Ok(n as usize)
}

#[cfg(test)]
mod tests {
    use std::os::fd::AsRawFd;

    use super::*;
    use crate::err;
    use crate::ioutil::{atomic_read, atomic_write, pipe_cloexec};

    fn socketpair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0 as RawFd; 2];
        err(unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        })
        .unwrap();
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    #[test]
    fn fds_survive_the_trip() {
        let (a, b) = socketpair();
        let (pipe_r, pipe_w) = pipe_cloexec().unwrap();

        let n = send_with_fds(a.as_raw_fd(), b"hi", &[pipe_r.as_raw_fd()]).unwrap();
        assert_eq!(n, 2);
        drop(pipe_r);

        let mut buf = [0u8; 8];
        let mut fds = Vec::new();
        let n = recv_with_fds(b.as_raw_fd(), &mut buf, &mut fds).unwrap();
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"hi");
        assert_eq!(fds.len(), 1);

        // the received fd is a live duplicate of the pipe's read end
        atomic_write(pipe_w.as_raw_fd(), b"zz");
        let (n, _) = atomic_read(fds[0].as_raw_fd(), &mut buf[..2]);
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"zz");
    }

    #[test]
    fn plain_data_passes_no_fds() {
        let (a, b) = socketpair();
        send_with_fds(a.as_raw_fd(), b"data", &[]).unwrap();

        let mut buf = [0u8; 8];
        let mut fds = Vec::new();
        let n = recv_with_fds(b.as_raw_fd(), &mut buf, &mut fds).unwrap();
        assert_eq!(n, 4);
        assert!(fds.is_empty());
    }
}
