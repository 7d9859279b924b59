//! Semantic register value types
//!
//! A [`RegisterValue`] knows its width in words and its host-order byte image.
//! Scalars use native byte order and pair with [`Converter::Abcd`](super::Converter);
//! byte arrays and [`FixedString`] are already in wire order and pair with
//! [`Converter::Identity`](super::Converter).

use crate::error::{ModbusError, ModbusResult};
use std::fmt;

/// A value that can live in a register
pub trait RegisterValue: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Register width in 16-bit words
    const WORDS: u16;

    fn to_host_bytes(&self) -> Vec<u8>;

    fn from_host_bytes(bytes: &[u8]) -> ModbusResult<Self>;
}

fn check_width(bytes: &[u8], expected: usize, type_name: &str) -> ModbusResult<()> {
    if bytes.len() != expected {
        return Err(ModbusError::InvalidValue(format!(
            "{} needs {} bytes, got {}",
            type_name,
            expected,
            bytes.len()
        )));
    }
    Ok(())
}

macro_rules! scalar_register_value {
    ($($ty:ty),+) => {
        $(
            impl RegisterValue for $ty {
                const WORDS: u16 = (std::mem::size_of::<$ty>() / 2) as u16;

                fn to_host_bytes(&self) -> Vec<u8> {
                    self.to_ne_bytes().to_vec()
                }

                fn from_host_bytes(bytes: &[u8]) -> ModbusResult<Self> {
                    check_width(bytes, std::mem::size_of::<$ty>(), stringify!($ty))?;
                    let mut raw = [0u8; std::mem::size_of::<$ty>()];
                    raw.copy_from_slice(bytes);
                    Ok(<$ty>::from_ne_bytes(raw))
                }
            }
        )+
    };
}

scalar_register_value!(u16, i16, u32, i32, f32, f64);

/// Raw memory region, `N` must be even
impl<const N: usize> RegisterValue for [u8; N] {
    const WORDS: u16 = (N / 2) as u16;

    fn to_host_bytes(&self) -> Vec<u8> {
        self.to_vec()
    }

    fn from_host_bytes(bytes: &[u8]) -> ModbusResult<Self> {
        check_width(bytes, N, "memory")?;
        let mut raw = [0u8; N];
        raw.copy_from_slice(bytes);
        Ok(raw)
    }
}

/// Zero-padded string of at most `N` bytes
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct FixedString<const N: usize>([u8; N]);

impl<const N: usize> FixedString<N> {
    /// Build from text, truncating to `N` bytes
    pub fn new(text: &str) -> Self {
        let mut raw = [0u8; N];
        let bytes = text.as_bytes();
        let len = bytes.len().min(N);
        raw[..len].copy_from_slice(&bytes[..len]);
        Self(raw)
    }

    /// Text up to the first NUL, lossy for invalid UTF-8
    pub fn as_string(&self) -> String {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(N);
        String::from_utf8_lossy(&self.0[..end]).into_owned()
    }

    pub fn as_bytes(&self) -> &[u8; N] {
        &self.0
    }
}

impl<const N: usize> Default for FixedString<N> {
    fn default() -> Self {
        Self([0u8; N])
    }
}

impl<const N: usize> fmt::Debug for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_string())
    }
}

impl<const N: usize> fmt::Display for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl<const N: usize> From<&str> for FixedString<N> {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl<const N: usize> RegisterValue for FixedString<N> {
    const WORDS: u16 = (N / 2) as u16;

    fn to_host_bytes(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    fn from_host_bytes(bytes: &[u8]) -> ModbusResult<Self> {
        check_width(bytes, N, "string")?;
        let mut raw = [0u8; N];
        raw.copy_from_slice(bytes);
        Ok(Self(raw))
    }
}

/// Declare a one-word enum usable as a register value
///
/// Unknown raw values are rejected with [`ModbusError::InvalidValue`].
#[macro_export]
macro_rules! register_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident = $raw:expr
            ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u16)]
        $vis enum $name {
            $(
                $(#[$vmeta])*
                $variant = $raw
            ),+
        }

        impl ::std::convert::TryFrom<u16> for $name {
            type Error = $crate::ModbusError;

            fn try_from(raw: u16) -> ::std::result::Result<Self, Self::Error> {
                match raw {
                    $(x if x == $raw => Ok(Self::$variant),)+
                    other => Err($crate::ModbusError::InvalidValue(format!(
                        "{} is not a valid {}",
                        other,
                        stringify!($name)
                    ))),
                }
            }
        }

        impl ::std::convert::From<$name> for u16 {
            fn from(value: $name) -> u16 {
                value as u16
            }
        }

        impl $crate::registers::RegisterValue for $name {
            const WORDS: u16 = 1;

            fn to_host_bytes(&self) -> Vec<u8> {
                (*self as u16).to_ne_bytes().to_vec()
            }

            fn from_host_bytes(bytes: &[u8]) -> $crate::ModbusResult<Self> {
                let raw = <u16 as $crate::registers::RegisterValue>::from_host_bytes(bytes)?;
                Self::try_from(raw)
            }
        }
    };
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)] // Tests can use unwrap()
mod tests {
    use super::*;

    register_enum! {
        enum Lamp {
            Off = 0,
            On = 1,
        }
    }

    #[test]
    fn test_widths() {
        assert_eq!(<u16 as RegisterValue>::WORDS, 1);
        assert_eq!(<f32 as RegisterValue>::WORDS, 2);
        assert_eq!(<f64 as RegisterValue>::WORDS, 4);
        assert_eq!(<[u8; 48] as RegisterValue>::WORDS, 24);
        assert_eq!(<FixedString<22> as RegisterValue>::WORDS, 11);
    }

    #[test]
    fn test_fixed_string_truncates_and_pads() {
        let s = FixedString::<4>::new("ABCDEF");
        assert_eq!(s.as_bytes(), b"ABCD");
        let s = FixedString::<6>::new("AB");
        assert_eq!(s.as_bytes(), &[b'A', b'B', 0, 0, 0, 0]);
        assert_eq!(s.as_string(), "AB");
    }

    #[test]
    fn test_register_enum_rejects_unknown() {
        assert_eq!(Lamp::try_from(1).unwrap(), Lamp::On);
        assert!(matches!(Lamp::try_from(7), Err(ModbusError::InvalidValue(_))));
        let bytes = Lamp::On.to_host_bytes();
        assert_eq!(Lamp::from_host_bytes(&bytes).unwrap(), Lamp::On);
    }

    #[test]
    fn test_width_mismatch_is_invalid_value() {
        assert!(matches!(
            u32::from_host_bytes(&[1, 2]),
            Err(ModbusError::InvalidValue(_))
        ));
    }
}
