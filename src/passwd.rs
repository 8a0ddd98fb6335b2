use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
}

/* The system resolver would dlopen nsswitch modules from whatever libc the
 * container ships, which may not match the libc this binary runs against.
 * Parsing /etc/passwd directly sidesteps that entirely. */
pub fn getpwnam(name: &str) -> Result<Option<PasswdEntry>> {
    lookup_in(Path::new("/etc/passwd"), name)
}

fn lookup_in(path: &Path, name: &str) -> Result<Option<PasswdEntry>> {
    let file = File::open(path).with_context(|| format!("open {}", path.display()))?;

    for line in BufReader::new(file).lines() {
        let line = line?;
        if let Some(entry) = parse_line(&line) {
            if entry.name == name {
                return Ok(Some(entry));
            }
        }
    }

    Ok(None)
}

fn parse_line(line: &str) -> Option<PasswdEntry> {
    // name:passwd:uid:gid:gecos:home:shell
    let mut fields = line.split(':');
    let name = fields.next()?;
    let _passwd = fields.next()?;
    let uid = fields.next()?.parse().ok()?;
    let gid = fields.next()?.parse().ok()?;
    let _gecos = fields.next()?;
    let home = fields.next()?;
    let shell = fields.next()?;

    Some(PasswdEntry {
        name: name.to_string(),
        uid,
        gid,
        home: home.to_string(),
        shell: shell.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = "\
root:x:0:0:root:/root:/bin/bash
daemon:x:1:1:daemon:/usr/sbin:/usr/sbin/nologin
broken line without colons
short:x:100
vcap:x:1000:1000:container user:/home/vcap:/bin/sh
";

    fn sample_file() -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();
        f
    }

    #[test]
    fn finds_users_by_name() {
        let f = sample_file();

        let root = lookup_in(f.path(), "root").unwrap().unwrap();
        assert_eq!(root.uid, 0);
        assert_eq!(root.gid, 0);
        assert_eq!(root.home, "/root");
        assert_eq!(root.shell, "/bin/bash");

        let vcap = lookup_in(f.path(), "vcap").unwrap().unwrap();
        assert_eq!(vcap.uid, 1000);
        assert_eq!(vcap.home, "/home/vcap");
    }

    #[test]
    fn unknown_user_is_none() {
        let f = sample_file();
        assert_eq!(lookup_in(f.path(), "nobody9").unwrap(), None);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let f = sample_file();
        // the truncated "short" entry never resolves
        assert_eq!(lookup_in(f.path(), "short").unwrap(), None);
        // but entries after it still do
        assert!(lookup_in(f.path(), "vcap").unwrap().is_some());
    }
}
