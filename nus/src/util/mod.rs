use std::ops::{Div, Rem};

pub(crate) mod read;

#[inline(always)]
pub(crate) fn div_rem<T>(x: T, y: T) -> (T, T)
where T: Div<Output = T> + Rem<Output = T> + Copy {
    let quot = x / y;
    let rem = x % y;
    (quot, rem)
}

/// Creates a fixed-size array reference from a slice.
#[macro_export]
macro_rules! array_ref {
    ($slice:expr, $offset:expr, $size:expr) => {{
        #[inline(always)]
        fn to_array<T>(slice: &[T]) -> &[T; $size] {
            unsafe { &*(slice.as_ptr() as *const [_; $size]) }
        }
        to_array(&$slice[$offset..$offset + $size])
    }};
}

/// Compile-time assertion.
#[macro_export]
macro_rules! static_assert {
    ($condition:expr) => {
        const _: () = core::assert!($condition);
    };
}

/// Reads a NUL-terminated string from a fixed-size field.
pub(crate) fn fixed_str(buf: &[u8]) -> Option<&str> {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    std::str::from_utf8(&buf[..end]).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_div_rem() {
        assert_eq!(div_rem(0x1_0005u64, 0xFC00), (1, 0x405));
    }

    #[test]
    fn test_fixed_str() {
        assert_eq!(fixed_str(b"Root-CA00000003\0\0\0"), Some("Root-CA00000003"));
        assert_eq!(fixed_str(b"abc"), Some("abc"));
        assert_eq!(fixed_str(&[0xFF, 0]), None);
    }
}
