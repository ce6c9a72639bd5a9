//! Typed per-record transforms.

/// Consumes one input and produces a lazy sequence of outputs.
///
/// Implementations must be pure: a hosting runtime may apply the same
/// record more than once.
pub trait Transform<I>: Send + Sync {
    type Output;
    type Outputs: IntoIterator<Item = Self::Output>;

    fn apply(&self, input: &I) -> Self::Outputs;
}

/// Result of extracting a key from one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Extracted<K, V> {
    Keyed(K, V),
    /// The record contributes nothing and is dropped before combining.
    Skip,
}

impl<K, V> From<Extracted<K, V>> for Option<(K, V)> {
    fn from(value: Extracted<K, V>) -> Self {
        match value {
            Extracted::Keyed(key, contribution) => Some((key, contribution)),
            Extracted::Skip => None,
        }
    }
}

/// Adapts a `Fn(&R) -> Extracted<K, V>` into a [`Transform`] that yields at
/// most one keyed contribution per record.
#[derive(Clone)]
pub struct KeyExtractor<F> {
    f: F,
}

impl<F> KeyExtractor<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<R, K, V, F> Transform<R> for KeyExtractor<F>
where
    F: Fn(&R) -> Extracted<K, V> + Send + Sync,
{
    type Output = (K, V);
    type Outputs = std::option::IntoIter<(K, V)>;

    fn apply(&self, input: &R) -> Self::Outputs {
        let pair: Option<(K, V)> = (self.f)(input).into();
        pair.into_iter()
    }
}
