use anyhow::{bail, Context};
use bytes::{Buf, BufMut};

/// A linear mapping between two time domains 'a' and 'b' with a rational slope:
///
/// ```ascii
/// b = (a - a_zero) * a_to_b_numer / a_to_b_denom + b_zero
/// ```
///
/// This is used for media time -> common time, common time -> local time etc. Integer division
///  rounds toward negative infinity in both directions, and all intermediate arithmetic is done
///  in 128 bit so that only results outside the i64 range fail.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LinearTransform {
    pub a_zero: i64,
    pub b_zero: i64,
    pub a_to_b_numer: i32,
    pub a_to_b_denom: u32,
}

impl LinearTransform {
    pub const SERIALIZED_LEN: usize = 8 + 4 + 4 + 8;

    pub fn identity() -> LinearTransform {
        LinearTransform {
            a_zero: 0,
            b_zero: 0,
            a_to_b_numer: 1,
            a_to_b_denom: 1,
        }
    }

    pub fn forward(&self, a: i64) -> Option<i64> {
        if self.a_to_b_denom == 0 {
            return None;
        }
        let scaled = (a as i128 - self.a_zero as i128) * self.a_to_b_numer as i128;
        let b = scaled.div_euclid(self.a_to_b_denom as i128) + self.b_zero as i128;
        i64::try_from(b).ok()
    }

    pub fn reverse(&self, b: i64) -> Option<i64> {
        if self.a_to_b_numer == 0 {
            return None;
        }
        let mut scaled = (b as i128 - self.b_zero as i128) * self.a_to_b_denom as i128;
        let mut divisor = self.a_to_b_numer as i128;
        if divisor < 0 {
            scaled = -scaled;
            divisor = -divisor;
        }
        let a = scaled.div_euclid(divisor) + self.a_zero as i128;
        i64::try_from(a).ok()
    }

    /// Chain this transform (a -> b) with `other` (b -> c), resulting in a transform a -> c.
    ///
    /// Returns `None` if the combined slope does not fit the numerator / denominator range even
    ///  after reducing the fraction, or if the combined offset overflows.
    pub fn compose(&self, other: &LinearTransform) -> Option<LinearTransform> {
        let c_zero = other.forward(self.b_zero)?;

        let numer = self.a_to_b_numer as i64 * other.a_to_b_numer as i64;
        let denom = self.a_to_b_denom as u64 * other.a_to_b_denom as u64;
        let (numer, denom) = reduce(numer, denom)?;

        Some(LinearTransform {
            a_zero: self.a_zero,
            b_zero: c_zero,
            a_to_b_numer: i32::try_from(numer).ok()?,
            a_to_b_denom: u32::try_from(denom).ok()?,
        })
    }

    /// Reduce the slope's fraction to lowest terms
    pub fn reduce(&self) -> LinearTransform {
        match reduce(self.a_to_b_numer as i64, self.a_to_b_denom as u64) {
            Some((numer, denom)) => LinearTransform {
                a_to_b_numer: numer as i32,
                a_to_b_denom: denom as u32,
                ..*self
            },
            None => *self,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) {
        buf.put_i64(self.a_zero);
        buf.put_i32(self.a_to_b_numer);
        buf.put_u32(self.a_to_b_denom);
        buf.put_i64(self.b_zero);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<LinearTransform> {
        let a_zero = buf.try_get_i64().context("clock transform truncated")?;
        let a_to_b_numer = buf.try_get_i32().context("clock transform truncated")?;
        let a_to_b_denom = buf.try_get_u32().context("clock transform truncated")?;
        let b_zero = buf.try_get_i64().context("clock transform truncated")?;
        if a_to_b_denom == 0 {
            bail!("clock transform with zero denominator");
        }
        Ok(LinearTransform {
            a_zero,
            b_zero,
            a_to_b_numer,
            a_to_b_denom,
        })
    }
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

fn reduce(numer: i64, denom: u64) -> Option<(i64, u64)> {
    if denom == 0 {
        return None;
    }
    let divisor = gcd(numer.unsigned_abs(), denom);
    if divisor <= 1 {
        return Some((numer, denom));
    }
    Some((numer / divisor as i64, denom / divisor))
}
