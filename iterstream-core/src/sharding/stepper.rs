// iterstream-core/src/sharding/stepper.rs

use crate::error::{IterStreamError, Result};

use super::context::ShardIdentity;

/// Positional filter keeping elements at `offset, offset + stride, ...`.
///
/// This is the whole sharding algorithm: each of `stride` consumers applies
/// the same stepper with its own offset, and together they cover the source
/// exactly once without talking to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stepper {
    offset: usize,
    stride: usize,
}

impl Stepper {
    /// Creates a stepper.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStep` unless `stride >= 1` and `offset < stride`.
    pub fn new(offset: usize, stride: usize) -> Result<Self> {
        if stride == 0 || offset >= stride {
            return Err(IterStreamError::invalid_step(offset, stride));
        }
        Ok(Self { offset, stride })
    }

    /// Creates a stepper selecting the shard owned by `identity`.
    pub fn for_identity(identity: ShardIdentity) -> Result<Self> {
        Self::new(identity.index, identity.count)
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    /// Returns true if this stepper passes every element through.
    pub fn is_identity(&self) -> bool {
        self.stride == 1
    }

    /// Applies the filter to an iterator.
    pub fn apply<I: Iterator>(self, iter: I) -> Step<I> {
        Step {
            inner: iter,
            offset: self.offset,
            stride: self.stride,
            position: 0,
        }
    }
}

/// Iterator produced by [`Stepper::apply`].
#[derive(Debug, Clone)]
pub struct Step<I> {
    inner: I,
    offset: usize,
    stride: usize,
    position: usize,
}

impl<I: Iterator> Iterator for Step<I> {
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let item = self.inner.next()?;
            let position = self.position;
            self.position = self.position.wrapping_add(1);
            if position % self.stride == self.offset {
                return Some(item);
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let (_, upper) = self.inner.size_hint();
        (0, upper)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_k() {
        let it: Vec<u32> = (0..10).collect();

        let evens: Vec<_> = Stepper::new(0, 2).unwrap().apply(it.iter().copied()).collect();
        assert_eq!(evens, vec![0, 2, 4, 6, 8]);

        let odds: Vec<_> = Stepper::new(1, 2).unwrap().apply(it.iter().copied()).collect();
        assert_eq!(odds, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_invalid_parameters() {
        assert!(matches!(
            Stepper::new(0, 0),
            Err(IterStreamError::InvalidStep { offset: 0, stride: 0 })
        ));
        assert!(Stepper::new(3, 3).is_err());
        assert!(Stepper::new(4, 3).is_err());
        assert!(Stepper::for_identity(ShardIdentity::new(4, 4)).is_err());
    }

    #[test]
    fn test_stride_one_is_identity() {
        let stepper = Stepper::new(0, 1).unwrap();
        assert!(stepper.is_identity());
        let out: Vec<_> = stepper.apply(0..17).collect();
        assert_eq!(out, (0..17).collect::<Vec<_>>());
    }

    #[test]
    fn test_infinite_source() {
        let out: Vec<_> = Stepper::new(2, 5).unwrap().apply(0u64..).take(4).collect();
        assert_eq!(out, vec![2, 7, 12, 17]);
    }

    #[test]
    fn test_offsets_partition_source() {
        for len in 0..40usize {
            let source: Vec<usize> = (0..len).map(|i| i * 31 % 97).collect();
            for stride in 1..9 {
                let mut seen = vec![0u32; len];
                for offset in 0..stride {
                    let shard: Vec<usize> = Stepper::new(offset, stride)
                        .unwrap()
                        .apply(0..len)
                        .collect();
                    // Each shard preserves relative order
                    assert!(shard.windows(2).all(|w| w[0] < w[1]));
                    for position in shard {
                        seen[position] += 1;
                    }
                }
                assert!(seen.iter().all(|&n| n == 1), "len={len} stride={stride}");

                let mut merged: Vec<usize> = (0..stride)
                    .flat_map(|offset| {
                        Stepper::new(offset, stride).unwrap().apply(source.iter().copied())
                    })
                    .collect();
                let mut expected = source.clone();
                merged.sort_unstable();
                expected.sort_unstable();
                assert_eq!(merged, expected);
            }
        }
    }

    #[test]
    fn test_single_pass() {
        let mut pulls = 0;
        let source = (0..10).inspect(|_| pulls += 1);
        let out: Vec<_> = Stepper::new(1, 3).unwrap().apply(source).collect();
        assert_eq!(out, vec![1, 4, 7]);
        assert_eq!(pulls, 10);
    }
}
