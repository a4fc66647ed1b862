use std::fmt;

/// Source selected for one destination channel of a [`Swizzle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwizzleSource {
    X,
    Y,
    Z,
    W,
    Zero,
    One,
}

impl SwizzleSource {
    fn from_bits(bits: u16) -> Self {
        match bits & 0x7 {
            0 => Self::X,
            1 => Self::Y,
            2 => Self::Z,
            3 => Self::W,
            5 => Self::One,
            // 4 is the architectural zero; 6 and 7 are reserved and read as zero.
            _ => Self::Zero,
        }
    }

    fn bits(self) -> u16 {
        match self {
            Self::X => 0,
            Self::Y => 1,
            Self::Z => 2,
            Self::W => 3,
            Self::Zero => 4,
            Self::One => 5,
        }
    }
}

/// Per-channel source selection for a texture view.
///
/// Four 3-bit selectors packed into the low 12 bits: red in bits 0..3, green in 3..6, blue in
/// 6..9 and alpha in 9..12. Equality and hashing use the packed value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Swizzle(u16);

impl Swizzle {
    pub const IDENTITY: Swizzle = Swizzle((1 << 3) | (2 << 6) | (3 << 9));

    pub fn new(r: SwizzleSource, g: SwizzleSource, b: SwizzleSource, a: SwizzleSource) -> Self {
        Self(r.bits() | (g.bits() << 3) | (b.bits() << 6) | (a.bits() << 9))
    }

    /// Wrap a packed value; bits above the four selectors are dropped.
    pub fn from_raw(raw: u16) -> Self {
        Self(raw & 0x0FFF)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    /// Selector for destination channel `index` (0 = red .. 3 = alpha).
    pub fn channel(self, index: usize) -> SwizzleSource {
        debug_assert!(index < 4);
        SwizzleSource::from_bits(self.0 >> (3 * index as u16))
    }

    pub fn r(self) -> SwizzleSource {
        self.channel(0)
    }

    pub fn g(self) -> SwizzleSource {
        self.channel(1)
    }

    pub fn b(self) -> SwizzleSource {
        self.channel(2)
    }

    pub fn a(self) -> SwizzleSource {
        self.channel(3)
    }

    pub fn is_identity(self) -> bool {
        self == Self::IDENTITY
    }

    /// Swizzle equivalent to applying `inner` first and then `self` to its result.
    pub fn compose(self, inner: Swizzle) -> Swizzle {
        let pick = |source: SwizzleSource| match source {
            SwizzleSource::X => inner.r(),
            SwizzleSource::Y => inner.g(),
            SwizzleSource::Z => inner.b(),
            SwizzleSource::W => inner.a(),
            constant => constant,
        };
        Swizzle::new(pick(self.r()), pick(self.g()), pick(self.b()), pick(self.a()))
    }
}

impl Default for Swizzle {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl fmt::Debug for Swizzle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Swizzle({:?}, {:?}, {:?}, {:?})",
            self.r(),
            self.g(),
            self.b(),
            self.a()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_selects_matching_channels() {
        let s = Swizzle::IDENTITY;
        assert_eq!(s.raw(), 0x688);
        assert_eq!(
            [s.r(), s.g(), s.b(), s.a()],
            [SwizzleSource::X, SwizzleSource::Y, SwizzleSource::Z, SwizzleSource::W]
        );
    }

    #[test]
    fn packed_value_matches_constructor() {
        use SwizzleSource::*;
        let bgra = Swizzle::new(Z, Y, X, One);
        assert_eq!(Swizzle::from_raw(bgra.raw()), bgra);
        assert_eq!(bgra.a(), One);
        assert_ne!(bgra, Swizzle::IDENTITY);
    }

    #[test]
    fn compose_applies_inner_first() {
        use SwizzleSource::*;
        let bgra = Swizzle::new(Z, Y, X, W);
        let splat_red = Swizzle::new(X, X, X, One);
        assert_eq!(splat_red.compose(bgra), Swizzle::new(Z, Z, Z, One));
        assert_eq!(Swizzle::IDENTITY.compose(bgra), bgra);
        assert_eq!(bgra.compose(Swizzle::IDENTITY), bgra);
    }

    #[test]
    fn reserved_selectors_read_as_zero() {
        let s = Swizzle::from_raw(0xF000 | 0b111_110_100_000);
        assert_eq!(s.raw(), 0b111_110_100_000);
        assert_eq!(s.g(), SwizzleSource::Zero);
        assert_eq!(s.b(), SwizzleSource::Zero);
        assert_eq!(s.a(), SwizzleSource::Zero);
    }
}
