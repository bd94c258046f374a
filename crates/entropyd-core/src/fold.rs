//! XOR bit folding.
//!
//! HWRNGs over-sample to compensate for small biases; folding XORs the upper
//! half of a buffer into the lower half, concentrating entropy while halving
//! the bytes the rest of the pipeline has to move.

use crate::error::{Error, Result};

/// Fold `buf[..len]` in half `folds` times, XORing the upper half into the
/// lower half on each pass. Returns the folded length `len / 2^folds`.
///
/// The bytes past the returned length are left untouched.
pub fn fold_in_place(buf: &mut [u8], len: usize, folds: u32) -> Result<usize> {
    if len > buf.len() {
        return Err(Error::Config(format!(
            "fold length {len} exceeds buffer of {}",
            buf.len()
        )));
    }
    if folds > 0 && len % (1usize << folds) != 0 {
        return Err(Error::Config(format!(
            "cannot fold {len} bytes {folds} times: not divisible by {}",
            1usize << folds
        )));
    }

    let mut len = len;
    for _ in 0..folds {
        len /= 2;
        for i in 0..len {
            buf[i] ^= buf[len + i];
        }
    }
    Ok(len)
}
