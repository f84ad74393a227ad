//! libc interposition of `bind(2)` and `connect(2)`.
//!
//! The real functions are resolved once via `dlsym(RTLD_NEXT)`. Every call
//! copies the caller's sockaddr, applies the rewrite decision from
//! [`crate::rewrite`], and delegates. Anything the shim does not recognize
//! (unix sockets, raw families, truncated addresses) passes through as-is.

use std::mem;

use libc::{c_int, sockaddr, sockaddr_in, sockaddr_in6, socklen_t, AF_INET, AF_INET6};
use once_cell::sync::Lazy;

use crate::rewrite::{rewrite_v4, rewrite_v6, ShimConfig};
use crate::{KNOWN_PORTS_ENV, PORT_OFFSET_ENV};

type SockCallFn = unsafe extern "C" fn(c_int, *const sockaddr, socklen_t) -> c_int;

static CONFIG: Lazy<Option<ShimConfig>> = Lazy::new(|| {
    ShimConfig::from_env_strings(
        std::env::var(PORT_OFFSET_ENV).ok().as_deref(),
        std::env::var(KNOWN_PORTS_ENV).ok().as_deref(),
    )
});

static REAL_BIND: Lazy<Option<SockCallFn>> = Lazy::new(|| lookup(b"bind\0"));
static REAL_CONNECT: Lazy<Option<SockCallFn>> = Lazy::new(|| lookup(b"connect\0"));

fn lookup(name: &'static [u8]) -> Option<SockCallFn> {
    let sym = unsafe { libc::dlsym(libc::RTLD_NEXT, name.as_ptr() as *const libc::c_char) };
    if sym.is_null() {
        None
    } else {
        Some(unsafe { mem::transmute::<*mut libc::c_void, SockCallFn>(sym) })
    }
}

unsafe fn call_rewritten(
    real: SockCallFn,
    fd: c_int,
    addr: *const sockaddr,
    len: socklen_t,
    outbound: bool,
) -> c_int {
    let cfg = match CONFIG.as_ref() {
        Some(c) => c,
        None => return real(fd, addr, len),
    };
    if addr.is_null() {
        return real(fd, addr, len);
    }

    match (*addr).sa_family as c_int {
        AF_INET if len as usize >= mem::size_of::<sockaddr_in>() => {
            let mut sin = *(addr as *const sockaddr_in);
            if let Some(port_be) = rewrite_v4(cfg, sin.sin_port, sin.sin_addr.s_addr, outbound) {
                sin.sin_port = port_be;
                return real(fd, &sin as *const sockaddr_in as *const sockaddr, len);
            }
        }
        AF_INET6 if len as usize >= mem::size_of::<sockaddr_in6>() => {
            let mut sin6 = *(addr as *const sockaddr_in6);
            if let Some(port_be) =
                rewrite_v6(cfg, sin6.sin6_port, &sin6.sin6_addr.s6_addr, outbound)
            {
                sin6.sin6_port = port_be;
                return real(fd, &sin6 as *const sockaddr_in6 as *const sockaddr, len);
            }
        }
        _ => {}
    }
    real(fd, addr, len)
}

/// # Safety
/// Standard `bind(2)` contract: `addr` must point to at least `len` valid bytes.
#[no_mangle]
pub unsafe extern "C" fn bind(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    match *REAL_BIND {
        Some(real) => call_rewritten(real, fd, addr, len, false),
        None => -1,
    }
}

/// # Safety
/// Standard `connect(2)` contract: `addr` must point to at least `len` valid bytes.
#[no_mangle]
pub unsafe extern "C" fn connect(fd: c_int, addr: *const sockaddr, len: socklen_t) -> c_int {
    match *REAL_CONNECT {
        Some(real) => call_rewritten(real, fd, addr, len, true),
        None => -1,
    }
}
