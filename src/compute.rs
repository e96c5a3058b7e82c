/// What a [`HashMap::compute_v2`](crate::HashMap::compute_v2) transform wants done with the
/// entry it was shown.
///
/// Unlike the `Option<V>` returned by the transform of
/// [`HashMap::compute`](crate::HashMap::compute), this can express "leave the entry exactly as
/// it is" without writing the current value back.
///
/// # Examples
///
/// ```
/// use compute_map::{ComputeOp, HashMap};
///
/// let map = HashMap::new();
/// let map = map.pin();
/// map.insert("hits", 84);
///
/// // raise the stored value to at least 63, but never lower it
/// let min = 63;
/// let (v, present) = map.compute_v2("hits", |old| match old {
///     Some(&old) if old >= min => ComputeOp::Noop,
///     _ => ComputeOp::Update(min),
/// });
/// assert_eq!((v, present), (Some(&84), true));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ComputeOp<V> {
    /// Store the value, inserting the entry if it was absent.
    ///
    /// The entry is overwritten even if the new value equals the old one.
    Update(V),
    /// Remove the entry if it is present.
    Delete,
    /// Leave the map untouched.
    Noop,
}

impl<V> From<Option<V>> for ComputeOp<V> {
    /// `Some(v)` updates to `v`, `None` deletes.
    ///
    /// This is how the transform of [`HashMap::compute`](crate::HashMap::compute) is
    /// interpreted.
    fn from(value: Option<V>) -> Self {
        match value {
            Some(value) => ComputeOp::Update(value),
            None => ComputeOp::Delete,
        }
    }
}
