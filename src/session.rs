use std::ffi::CString;
use std::io::Read;

use thiserror::Error;

use crate::err;

pub const SESSION_VERSION: i32 = 1;
pub const MAX_ENVELOPE_SIZE: usize = 16 * 1024;

const ARG_BUF_SIZE: usize = 8 * 1024;
const USER_SIZE: usize = 32;
const LANG_SIZE: usize = 1024;

/// Resources a session request may carry limits for; the names double as
/// the environment variables `wsh` imports them from.
pub const KNOWN_RLIMITS: [(&str, i32); 15] = [
    ("RLIMIT_AS", libc::RLIMIT_AS as i32),
    ("RLIMIT_CORE", libc::RLIMIT_CORE as i32),
    ("RLIMIT_CPU", libc::RLIMIT_CPU as i32),
    ("RLIMIT_DATA", libc::RLIMIT_DATA as i32),
    ("RLIMIT_FSIZE", libc::RLIMIT_FSIZE as i32),
    ("RLIMIT_LOCKS", libc::RLIMIT_LOCKS as i32),
    ("RLIMIT_MEMLOCK", libc::RLIMIT_MEMLOCK as i32),
    ("RLIMIT_MSGQUEUE", libc::RLIMIT_MSGQUEUE as i32),
    ("RLIMIT_NICE", libc::RLIMIT_NICE as i32),
    ("RLIMIT_NOFILE", libc::RLIMIT_NOFILE as i32),
    ("RLIMIT_NPROC", libc::RLIMIT_NPROC as i32),
    ("RLIMIT_RSS", libc::RLIMIT_RSS as i32),
    ("RLIMIT_RTPRIO", libc::RLIMIT_RTPRIO as i32),
    ("RLIMIT_SIGPENDING", libc::RLIMIT_SIGPENDING as i32),
    ("RLIMIT_STACK", libc::RLIMIT_STACK as i32),
];

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("session request version {0} not supported")]
    VersionMismatch(i32),
    #[error("argument data does not fit the envelope")]
    ArgOverflow,
    #[error("user name too long")]
    UserTooLong,
    #[error("LANG value too long")]
    LangTooLong,
    #[error("malformed envelope field: {0}")]
    Malformed(&'static str),
    #[error("malformed rlimit value in {0}: {1:?}")]
    BadRlimit(&'static str, String),
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RlimitEntry {
    pub id: i32,
    pub soft: u64,
    pub hard: u64,
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct RlimitTable {
    count: i32,
    entries: [RlimitEntry; KNOWN_RLIMITS.len()],
}

impl RlimitTable {
    pub fn empty() -> Self {
        unsafe { std::mem::zeroed() }
    }

    pub fn push(&mut self, entry: RlimitEntry) {
        assert!((self.count as usize) < self.entries.len());
        self.entries[self.count as usize] = entry;
        self.count += 1;
    }

    pub fn entries(&self) -> &[RlimitEntry] {
        &self.entries[..self.count as usize]
    }

    /// Builds the table from the recognised RLIMIT_* environment
    /// variables: `"<soft> <hard>"`, or a single value for both.
    pub fn from_env() -> Result<Self, EnvelopeError> {
        let mut table = Self::empty();

        for (name, id) in KNOWN_RLIMITS {
            let Ok(value) = std::env::var(name) else {
                continue;
            };

            let mut parts = value.split_whitespace();
            let bad = || EnvelopeError::BadRlimit(name, value.clone());
            let soft: u64 = parts.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
            let hard: u64 = match parts.next() {
                Some(hard) => hard.parse().map_err(|_| bad())?,
                None => soft,
            };
            if parts.next().is_some() {
                return Err(bad());
            }

            table.push(RlimitEntry { id, soft, hard });
        }

        Ok(table)
    }

    /// Applies every entry to the calling process.
    pub fn apply(&self) -> nix::Result<()> {
        for entry in self.entries() {
            let limit = libc::rlimit {
                rlim_cur: entry.soft,
                rlim_max: entry.hard,
            };
            err(unsafe { libc::setrlimit(entry.id as _, &limit) })?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
#[repr(C)]
struct ArgList {
    count: i32,
    buf: [u8; ARG_BUF_SIZE],
}

/// Fixed-size session envelope, sent in native byte order; both ends live
/// on the same host and speak the same process ABI.
#[repr(C)]
pub struct SessionRequest {
    pub version: i32,
    pub tty: i32,
    arg: ArgList,
    pub rlim: RlimitTable,
    user: [u8; USER_SIZE],
    lang: [u8; LANG_SIZE],
}

const _: () = assert!(std::mem::size_of::<SessionRequest>() <= MAX_ENVELOPE_SIZE);

impl SessionRequest {
    pub fn new() -> Self {
        let mut req: Self = unsafe { std::mem::zeroed() };
        req.version = SESSION_VERSION;
        req
    }

    pub fn validate(&self) -> Result<(), EnvelopeError> {
        if self.version != SESSION_VERSION {
            return Err(EnvelopeError::VersionMismatch(self.version));
        }
        if self.arg.count < 0 || self.arg.count as usize > ARG_BUF_SIZE {
            return Err(EnvelopeError::Malformed("arg.count"));
        }
        if self.rlim.count < 0 || self.rlim.count as usize > KNOWN_RLIMITS.len() {
            return Err(EnvelopeError::Malformed("rlim.count"));
        }
        Ok(())
    }

    /// Packs argv NUL-separated into the fixed buffer.
    pub fn set_args(&mut self, args: &[String]) -> Result<(), EnvelopeError> {
        let mut off = 0;
        for arg in args {
            let bytes = arg.as_bytes();
            if bytes.contains(&0) {
                return Err(EnvelopeError::Malformed("argument with NUL byte"));
            }
            if off + bytes.len() + 1 > ARG_BUF_SIZE {
                return Err(EnvelopeError::ArgOverflow);
            }
            self.arg.buf[off..off + bytes.len()].copy_from_slice(bytes);
            off += bytes.len();
            self.arg.buf[off] = 0;
            off += 1;
        }
        self.arg.count = args.len() as i32;
        Ok(())
    }

    pub fn args(&self) -> Result<Vec<CString>, EnvelopeError> {
        let mut out = Vec::with_capacity(self.arg.count as usize);
        let mut rest = &self.arg.buf[..];

        for _ in 0..self.arg.count {
            let nul = rest
                .iter()
                .position(|&b| b == 0)
                .ok_or(EnvelopeError::Malformed("unterminated argument"))?;
            out.push(
                CString::new(&rest[..nul]).expect("split at first NUL leaves none inside"),
            );
            rest = &rest[nul + 1..];
        }

        Ok(out)
    }

    pub fn set_user(&mut self, user: Option<&str>) -> Result<(), EnvelopeError> {
        let user = user.unwrap_or("");
        if user.as_bytes().len() >= USER_SIZE {
            return Err(EnvelopeError::UserTooLong);
        }
        self.user = [0; USER_SIZE];
        self.user[..user.len()].copy_from_slice(user.as_bytes());
        Ok(())
    }

    pub fn user(&self) -> &str {
        cstr_field(&self.user)
    }

    pub fn set_lang(&mut self, lang: &str) -> Result<(), EnvelopeError> {
        if lang.as_bytes().len() >= LANG_SIZE {
            return Err(EnvelopeError::LangTooLong);
        }
        self.lang = [0; LANG_SIZE];
        self.lang[..lang.len()].copy_from_slice(lang.as_bytes());
        Ok(())
    }

    pub fn lang(&self) -> Option<&str> {
        let lang = cstr_field(&self.lang);
        (!lang.is_empty()).then_some(lang)
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self as *const Self as *const u8,
                std::mem::size_of::<Self>(),
            )
        }
    }

    pub fn read_from(reader: &mut impl Read) -> std::io::Result<Self> {
        let mut req: Self = unsafe { std::mem::zeroed() };
        let buf = unsafe {
            std::slice::from_raw_parts_mut(
                &mut req as *mut Self as *mut u8,
                std::mem::size_of::<Self>(),
            )
        };
        reader.read_exact(buf)?;
        Ok(req)
    }
}

impl Default for SessionRequest {
    fn default() -> Self {
        Self::new()
    }
}

fn cstr_field(field: &[u8]) -> &str {
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    std::str::from_utf8(&field[..end]).unwrap_or("")
}

#[derive(Clone, Copy)]
#[repr(C)]
pub struct SessionResponse {
    pub version: i32,
}

impl SessionResponse {
    pub fn new() -> Self {
        Self {
            version: SESSION_VERSION,
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(
                self as *const Self as *const u8,
                std::mem::size_of::<Self>(),
            )
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        if bytes.len() < std::mem::size_of::<Self>() {
            return Err(EnvelopeError::Malformed("short session response"));
        }
        let res =
            unsafe { std::ptr::read_unaligned(bytes.as_ptr() as *const Self) };
        if res.version != SESSION_VERSION {
            return Err(EnvelopeError::VersionMismatch(res.version));
        }
        Ok(res)
    }
}

impl Default for SessionResponse {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trips_as_bytes() {
        let mut req = SessionRequest::new();
        req.tty = 1;
        req.set_args(&["/bin/echo".into(), "hello world".into()]).unwrap();
        req.set_user(Some("vcap")).unwrap();
        req.set_lang("en_US.UTF-8").unwrap();
        req.rlim.push(RlimitEntry {
            id: libc::RLIMIT_NOFILE as i32,
            soft: 64,
            hard: 64,
        });

        let bytes = req.as_bytes().to_vec();
        let parsed = SessionRequest::read_from(&mut bytes.as_slice()).unwrap();
        parsed.validate().unwrap();

        assert_eq!(parsed.tty, 1);
        assert_eq!(
            parsed.args().unwrap(),
            vec![
                CString::new("/bin/echo").unwrap(),
                CString::new("hello world").unwrap()
            ]
        );
        assert_eq!(parsed.user(), "vcap");
        assert_eq!(parsed.lang(), Some("en_US.UTF-8"));
        assert_eq!(parsed.rlim.entries().len(), 1);
        assert_eq!(parsed.rlim.entries()[0].soft, 64);
    }

    #[test]
    fn empty_request_has_defaults() {
        let req = SessionRequest::new();
        req.validate().unwrap();
        assert!(req.args().unwrap().is_empty());
        assert_eq!(req.user(), "");
        assert_eq!(req.lang(), None);
    }

    #[test]
    fn oversized_argv_is_rejected() {
        let mut req = SessionRequest::new();
        let big = "x".repeat(ARG_BUF_SIZE);
        assert!(matches!(
            req.set_args(&[big]),
            Err(EnvelopeError::ArgOverflow)
        ));
    }

    #[test]
    fn version_is_checked() {
        let mut req = SessionRequest::new();
        req.version = 7;
        assert!(matches!(
            req.validate(),
            Err(EnvelopeError::VersionMismatch(7))
        ));
    }

    #[test]
    fn rlimits_parse_from_env() {
        std::env::set_var("RLIMIT_NOFILE", "64 128");
        std::env::set_var("RLIMIT_CORE", "0");
        std::env::remove_var("RLIMIT_NPROC");

        let table = RlimitTable::from_env().unwrap();
        let nofile = table
            .entries()
            .iter()
            .find(|e| e.id == libc::RLIMIT_NOFILE as i32)
            .unwrap();
        assert_eq!((nofile.soft, nofile.hard), (64, 128));

        // a single value sets both limits
        let core = table
            .entries()
            .iter()
            .find(|e| e.id == libc::RLIMIT_CORE as i32)
            .unwrap();
        assert_eq!((core.soft, core.hard), (0, 0));

        std::env::set_var("RLIMIT_NOFILE", "not-a-number");
        assert!(RlimitTable::from_env().is_err());

        std::env::remove_var("RLIMIT_NOFILE");
        std::env::remove_var("RLIMIT_CORE");
    }
}
