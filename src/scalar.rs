/*!
OpenCL integer scalar types and host reference arithmetic.

The reference functions here define the expected device results. They are
written in terms of the OpenCL C semantics rather than Rust's intrinsics, so
they can be checked against [`i32::saturating_add`] and friends in tests.
*/
use bytemuck::Pod;
use derive_more::Display;
use num_traits::{PrimInt, WrappingAdd};
use serde::{Deserialize, Serialize};
use std::{
    fmt::{self, Debug, LowerHex},
    str::FromStr,
};

mod sealed {
    #[doc(hidden)]
    pub trait Sealed {}

    macro_rules! impl_sealed {
        ($($t:ty),+) => {
            $(
                impl Sealed for $t {}
            )+
        };
    }

    impl_sealed!(i8, u8, i16, u16, i32, u32, i64, u64);
}
use sealed::Sealed;

/// OpenCL C integer types.
#[allow(missing_docs)]
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Display, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntType {
    #[display(fmt = "char")]
    Char,
    #[display(fmt = "uchar")]
    UChar,
    #[display(fmt = "short")]
    Short,
    #[display(fmt = "ushort")]
    UShort,
    #[display(fmt = "int")]
    Int,
    #[display(fmt = "uint")]
    UInt,
    #[display(fmt = "long")]
    Long,
    #[display(fmt = "ulong")]
    ULong,
}

impl IntType {
    /// All types, in the order they are tested.
    pub fn iter() -> impl ExactSizeIterator<Item = Self> {
        use IntType::*;
        [Char, UChar, Short, UShort, Int, UInt, Long, ULong].into_iter()
    }
    /// Size of the type in bytes.
    #[inline]
    pub fn size(&self) -> usize {
        use IntType::*;
        match self {
            Char | UChar => 1,
            Short | UShort => 2,
            Int | UInt => 4,
            Long | ULong => 8,
        }
    }
    /// Name of the type in OpenCL C, ie "char", "ulong".
    #[inline]
    pub fn name(&self) -> &'static str {
        use IntType::*;
        match self {
            Char => "char",
            UChar => "uchar",
            Short => "short",
            UShort => "ushort",
            Int => "int",
            UInt => "uint",
            Long => "long",
            ULong => "ulong",
        }
    }
    #[inline]
    pub fn is_signed(&self) -> bool {
        use IntType::*;
        matches!(self, Char | Short | Int | Long)
    }
    /// Long and ulong are optional on embedded profiles.
    #[inline]
    pub fn is_64bit(&self) -> bool {
        self.size() == 8
    }
}

impl FromStr for IntType {
    type Err = ();
    fn from_str(input: &str) -> Result<Self, ()> {
        Self::iter().find(|x| x.name() == input).ok_or(())
    }
}

/// Vector widths of OpenCL C vector types.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Debug, Serialize, Deserialize)]
pub struct VectorWidth(u8);

impl VectorWidth {
    pub const ONE: Self = Self(1);
    pub const THREE: Self = Self(3);

    /// 1, 2, 3, 4, 8, 16
    pub fn iter() -> impl ExactSizeIterator<Item = Self> {
        [1, 2, 3, 4, 8, 16].into_iter().map(Self)
    }
    /// Creates a width, returns None if it is not a valid OpenCL vector width.
    pub fn new(width: usize) -> Option<Self> {
        Self::iter().find(|x| x.get() == width)
    }
    #[inline]
    pub fn get(&self) -> usize {
        self.0 as usize
    }
    /// The suffix of the vector type name, "" for scalars.
    pub fn suffix(&self) -> String {
        if self.0 == 1 {
            String::new()
        } else {
            self.0.to_string()
        }
    }
}

impl fmt::Display for VectorWidth {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Integer types with a host reference for `add_sat`.
pub trait SatInt: Default + Pod + PrimInt + WrappingAdd + Debug + LowerHex + Sealed {
    /// The [`IntType`] of the scalar.
    const INT_TYPE: IntType;
    /// `add_sat(self, rhs)` as defined by OpenCL C.
    fn add_sat_ref(self, rhs: Self) -> Self;
}

macro_rules! impl_sat_int {
    (narrow $($t:ty => $v:ident),+) => {
        $(
            impl SatInt for $t {
                const INT_TYPE: IntType = IntType::$v;
                #[inline]
                fn add_sat_ref(self, rhs: Self) -> Self {
                    // computed in int and clamped
                    let r = self as i32 + rhs as i32;
                    r.clamp(<$t>::MIN as i32, <$t>::MAX as i32) as $t
                }
            }
        )+
    };
    (unsigned $($t:ty => $v:ident),+) => {
        $(
            impl SatInt for $t {
                const INT_TYPE: IntType = IntType::$v;
                #[inline]
                fn add_sat_ref(self, rhs: Self) -> Self {
                    let r = self.wrapping_add(rhs);
                    if r < self {
                        <$t>::MAX
                    } else {
                        r
                    }
                }
            }
        )+
    };
    (signed $($t:ty => $v:ident),+) => {
        $(
            impl SatInt for $t {
                const INT_TYPE: IntType = IntType::$v;
                #[inline]
                fn add_sat_ref(self, rhs: Self) -> Self {
                    let r = self.wrapping_add(rhs);
                    if rhs > 0 {
                        if r < self {
                            return <$t>::MAX;
                        }
                    } else if r > self {
                        return <$t>::MIN;
                    }
                    r
                }
            }
        )+
    };
}

impl_sat_int!(narrow i8 => Char, u8 => UChar, i16 => Short, u16 => UShort);
impl_sat_int!(unsigned u32 => UInt, u64 => ULong);
impl_sat_int!(signed i32 => Int, i64 => Long);

/// A device result that differs from the host reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AddSatMismatch<T> {
    pub index: usize,
    pub width: VectorWidth,
    pub a: T,
    pub b: T,
    pub expected: T,
    pub actual: T,
}

impl<T: SatInt> fmt::Display for AddSatMismatch<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let w = 2 * T::INT_TYPE.size();
        let ty = format!("{}{}", T::INT_TYPE.name(), self.width.suffix());
        write!(
            f,
            "{}) Failure for add_sat( ({ty}) 0x{:0w$x}, ({ty}) 0x{:0w$x}) = *0x{:0w$x} vs 0x{:0w$x}",
            self.index, self.a, self.b, self.expected, self.actual,
        )
    }
}

/// Checks `out[i] == add_sat(a[i], b[i])` and returns the first mismatch.
///
/// The slices are truncated to the shortest.
pub fn verify_add_sat<T: SatInt>(
    a: &[T],
    b: &[T],
    out: &[T],
    width: VectorWidth,
) -> Option<AddSatMismatch<T>> {
    a.iter()
        .zip(b)
        .zip(out)
        .enumerate()
        .find_map(|(index, ((&a, &b), &actual))| {
            let expected = a.add_sat_ref(b);
            (expected != actual).then_some(AddSatMismatch {
                index,
                width,
                a,
                b,
                expected,
                actual,
            })
        })
}
