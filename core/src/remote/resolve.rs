//! Server address resolution and invoking-user lookup.

use std::ffi::CStr;
use std::net::{Ipv4Addr, SocketAddr, ToSocketAddrs};


/// Resolve a server name to an IPv4 address.
///
/// A dotted-quad found anywhere in `server` wins without any lookup;
/// otherwise the first IPv4 result of a forward lookup is used.
pub fn resolve(server: &str) -> Option<Ipv4Addr> {
    if let Some(ip) = find_ipv4(server) {
        return Some(ip);
    }
    let addrs = (server, 0u16).to_socket_addrs().ok()?;
    addrs
        .filter_map(|addr| match addr {
            SocketAddr::V4(v4) => Some(*v4.ip()),
            SocketAddr::V6(_) => None,
        })
        .next()
}


/// The leftmost run of four dot-separated digit groups that parses as an
/// address. A longer dotted run contributes its first four groups.
fn find_ipv4(text: &str) -> Option<Ipv4Addr> {
    let bytes = text.as_bytes();
    (0..bytes.len())
        .filter(|&i| i == 0 || !bytes[i - 1].is_ascii_digit())
        .filter_map(|start| dotted_quad_at(text, start))
        .find_map(|quad| quad.parse().ok())
}


fn dotted_quad_at(text: &str, start: usize) -> Option<&str> {
    let bytes = text.as_bytes();
    let mut end = start;
    for group in 0..4 {
        if group > 0 {
            if bytes.get(end) != Some(&b'.') {
                return None;
            }
            end += 1;
        }
        let digits = bytes[end..].iter().take_while(|b| b.is_ascii_digit()).count();
        if digits == 0 {
            return None;
        }
        end += digits;
    }
    text.get(start..end)
}


/// Name of the user running this process.
///
/// Looked up from the password database by real uid, falling back to `$USER`.
pub fn current_user() -> String {
    passwd_name().unwrap_or_else(|| std::env::var("USER").unwrap_or_default())
}


fn passwd_name() -> Option<String> {
    let mut buf = vec![0 as libc::c_char; 4096];
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();
    // SAFETY: every pointer refers to storage that outlives the call, and
    // `buf.len()` is its true size.
    let rc = unsafe {
        libc::getpwuid_r(
            libc::getuid(),
            &mut pwd,
            buf.as_mut_ptr(),
            buf.len(),
            &mut result,
        )
    };
    if rc != 0 || result.is_null() || pwd.pw_name.is_null() {
        return None;
    }
    // SAFETY: on success pw_name points into `buf` and is NUL-terminated.
    let name = unsafe { CStr::from_ptr(pwd.pw_name) };
    Some(name.to_string_lossy().into_owned())
}
