use std::ffi::{CStr, CString};
use std::os::raw::{c_char, c_int};
use std::{mem, ptr};

use crate::bytes::ByteString;
use crate::error::NativeSyscallError;

const INITIAL_BUFFER: usize = 1024;
const MAX_BUFFER: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passwd {
    pub name: ByteString,
    pub uid: u32,
    pub gid: u32,
    pub home: ByteString,
    pub shell: ByteString,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub name: ByteString,
    pub gid: u32,
    pub members: Vec<ByteString>,
}

unsafe fn c_bytes(p: *const c_char) -> ByteString {
    if p.is_null() {
        ByteString::new()
    } else {
        ByteString::from(CStr::from_ptr(p).to_bytes())
    }
}

// 不同 libc 对查找不到的报告方式不一致
fn is_miss(rc: c_int) -> bool {
    matches!(rc, libc::ENOENT | libc::ESRCH | libc::EBADF | libc::EPERM)
}

fn lookup_passwd<F>(syscall: &'static str, mut call: F) -> Result<Option<Passwd>, NativeSyscallError>
where
    F: FnMut(*mut libc::passwd, *mut c_char, usize, *mut *mut libc::passwd) -> c_int,
{
    let mut buf_len = INITIAL_BUFFER;
    loop {
        let mut pwd: libc::passwd = unsafe { mem::zeroed() };
        let mut buf = vec![0 as c_char; buf_len];
        let mut result: *mut libc::passwd = ptr::null_mut();
        let rc = call(&mut pwd, buf.as_mut_ptr(), buf.len(), &mut result);
        if rc == libc::ERANGE && buf_len < MAX_BUFFER {
            buf_len *= 2;
            continue;
        }
        if rc != 0 {
            return if is_miss(rc) {
                Ok(None)
            } else {
                Err(NativeSyscallError::new(rc, syscall))
            };
        }
        if result.is_null() {
            return Ok(None);
        }
        let entry = unsafe {
            Passwd {
                name: c_bytes(pwd.pw_name),
                uid: pwd.pw_uid,
                gid: pwd.pw_gid,
                home: c_bytes(pwd.pw_dir),
                shell: c_bytes(pwd.pw_shell),
            }
        };
        return Ok(Some(entry));
    }
}

fn lookup_group<F>(syscall: &'static str, mut call: F) -> Result<Option<Group>, NativeSyscallError>
where
    F: FnMut(*mut libc::group, *mut c_char, usize, *mut *mut libc::group) -> c_int,
{
    let mut buf_len = INITIAL_BUFFER;
    loop {
        let mut grp: libc::group = unsafe { mem::zeroed() };
        let mut buf = vec![0 as c_char; buf_len];
        let mut result: *mut libc::group = ptr::null_mut();
        let rc = call(&mut grp, buf.as_mut_ptr(), buf.len(), &mut result);
        if rc == libc::ERANGE && buf_len < MAX_BUFFER {
            buf_len *= 2;
            continue;
        }
        if rc != 0 {
            return if is_miss(rc) {
                Ok(None)
            } else {
                Err(NativeSyscallError::new(rc, syscall))
            };
        }
        if result.is_null() {
            return Ok(None);
        }
        let mut members = Vec::new();
        unsafe {
            let mut member = grp.gr_mem;
            while !member.is_null() && !(*member).is_null() {
                members.push(c_bytes(*member));
                member = member.add(1);
            }
        }
        let entry = Group {
            name: unsafe { c_bytes(grp.gr_name) },
            gid: grp.gr_gid,
            members,
        };
        return Ok(Some(entry));
    }
}

pub fn passwd_by_uid(uid: u32) -> Result<Option<Passwd>, NativeSyscallError> {
    lookup_passwd("getpwuid_r", |pwd, buf, len, result| unsafe {
        libc::getpwuid_r(uid, pwd, buf, len, result)
    })
}

pub fn passwd_by_name(name: &[u8]) -> Result<Option<Passwd>, NativeSyscallError> {
    let Ok(name) = CString::new(name) else {
        return Ok(None);
    };
    lookup_passwd("getpwnam_r", |pwd, buf, len, result| unsafe {
        libc::getpwnam_r(name.as_ptr(), pwd, buf, len, result)
    })
}

pub fn group_by_gid(gid: u32) -> Result<Option<Group>, NativeSyscallError> {
    lookup_group("getgrgid_r", |grp, buf, len, result| unsafe {
        libc::getgrgid_r(gid, grp, buf, len, result)
    })
}

pub fn group_by_name(name: &[u8]) -> Result<Option<Group>, NativeSyscallError> {
    let Ok(name) = CString::new(name) else {
        return Ok(None);
    };
    lookup_group("getgrnam_r", |grp, buf, len, result| unsafe {
        libc::getgrnam_r(name.as_ptr(), grp, buf, len, result)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_user() {
        let root = passwd_by_uid(0).unwrap().expect("uid 0 should exist");
        assert_eq!(root.uid, 0);
        let by_name = passwd_by_name(root.name.as_bytes()).unwrap().unwrap();
        assert_eq!(by_name.uid, 0);
    }

    #[test]
    fn test_root_group() {
        let group = group_by_gid(0).unwrap().expect("gid 0 should exist");
        assert_eq!(group.gid, 0);
        let by_name = group_by_name(group.name.as_bytes()).unwrap().unwrap();
        assert_eq!(by_name.gid, 0);
    }

    #[test]
    fn test_lookup_miss_is_none() {
        assert_eq!(passwd_by_uid(0xFFFF_FFF0).unwrap(), None);
        assert_eq!(group_by_gid(0xFFFF_FFF0).unwrap(), None);
        assert_eq!(passwd_by_name(b"no-such-user-\xff").unwrap(), None);
        assert_eq!(group_by_name(b"nul\0inside").unwrap(), None);
    }
}
