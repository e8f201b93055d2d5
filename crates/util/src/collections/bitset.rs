/// A growable bit set.
#[derive(Clone, Debug, Default)]
pub struct BitSet {
    inner: Vec<u64>,
}

impl BitSet {
    pub fn new() -> Self {
        Self { inner: Vec::new() }
    }

    pub fn with_capacity(capacity: impl TryInto<usize>) -> Self {
        let capacity = crate::cast_usize!(capacity);
        Self {
            inner: vec![0; capacity.div_ceil(64)],
        }
    }

    #[inline]
    pub fn set(&mut self, n: impl TryInto<usize>) {
        let n = crate::cast_usize!(n);
        let (word, bit) = (n / 64, n % 64);
        if word >= self.inner.len() {
            self.inner.resize(word + 1, 0);
        }
        // Safety: the resize above guarantees the word exists.
        unsafe {
            *self.inner.get_unchecked_mut(word) |= 1 << bit;
        }
    }

    #[inline]
    pub fn unset(&mut self, n: impl TryInto<usize>) {
        let n = crate::cast_usize!(n);
        let (word, bit) = (n / 64, n % 64);
        if let Some(word) = self.inner.get_mut(word) {
            *word &= !(1 << bit);
        }
    }

    #[inline]
    pub fn get(&self, n: impl TryInto<usize>) -> bool {
        let n = crate::cast_usize!(n);
        let (word, bit) = (n / 64, n % 64);
        self.inner
            .get(word)
            .is_some_and(|word| *word & (1 << bit) != 0)
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }
}
