//! Error numbers written into the last-error slot.
//!
//! Values match Linux `<errno.h>` so generated callers built against the
//! host headers interpret them unchanged.

/// Operation not permitted.
pub const EPERM: i32 = 1;
/// Resource temporarily unavailable.
pub const EAGAIN: i32 = 11;
/// Out of memory.
pub const ENOMEM: i32 = 12;
/// Bad address.
pub const EFAULT: i32 = 14;
/// Device or resource busy.
pub const EBUSY: i32 = 16;
/// Invalid argument.
pub const EINVAL: i32 = 22;
/// Operation not supported.
pub const ENOTSUP: i32 = 95;

/// Symbolic name for an error number, for diagnostics.
#[must_use]
pub const fn name(code: i32) -> &'static str {
    match code {
        0 => "OK",
        EPERM => "EPERM",
        EAGAIN => "EAGAIN",
        ENOMEM => "ENOMEM",
        EFAULT => "EFAULT",
        EBUSY => "EBUSY",
        EINVAL => "EINVAL",
        ENOTSUP => "ENOTSUP",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_cover_every_constant() {
        for code in [EPERM, EAGAIN, ENOMEM, EFAULT, EBUSY, EINVAL, ENOTSUP] {
            assert_ne!(name(code), "UNKNOWN", "missing name for {code}");
        }
        assert_eq!(name(0), "OK");
        assert_eq!(name(-7), "UNKNOWN");
    }
}
