use fixed::types::I32F32;

/// Q32.32 fixed-point: 32 integer bits, 32 fractional bits.
///
/// Used for every fractional quantity in the simulation (defect rates,
/// delay thresholds, uniform draws) so arithmetic is bit-identical across
/// platforms. Never use `f64` inside the simulation loop.
pub type Fixed64 = I32F32;

/// Ticks are the atomic unit of virtual time. The kernel does not assign a
/// physical meaning to one tick; the host picks it via [`crate::clock`]'s
/// duration helpers.
pub type Ticks = u64;

/// Convert an f64 to Fixed64. Use only for initialization, never in sim loop.
#[inline]
pub fn f64_to_fixed64(v: f64) -> Fixed64 {
    Fixed64::from_num(v)
}

/// Convert Fixed64 to f64. Use only for display, never in sim loop.
#[inline]
pub fn fixed64_to_f64(v: Fixed64) -> f64 {
    v.to_num::<f64>()
}

/// `ceil(count × keep)` for batch arithmetic. `keep` must be in [0, 1].
#[inline]
pub fn ceil_scaled(count: u32, keep: Fixed64) -> u32 {
    (Fixed64::from_num(count) * keep).ceil().to_num::<u32>()
}

/// `floor(ticks × factor)` for variable-delay arithmetic. `factor` must be
/// in [0, 1); `ticks` must fit in the integer range of [`Fixed64`].
#[inline]
pub fn scale_ticks(ticks: Ticks, factor: Fixed64) -> Ticks {
    (Fixed64::from_num(ticks) * factor).floor().to_num::<u64>()
}
