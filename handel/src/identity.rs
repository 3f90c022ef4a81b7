// Copyright 2019-2024 ChainSafe Systems
// SPDX-License-Identifier: Apache-2.0, MIT

/// A participant of the protocol: its dense id, network address and public
/// key.
#[derive(Clone, Debug, PartialEq)]
pub struct Identity<P> {
    id: i32,
    address: String,
    public_key: P,
}

impl<P> Identity<P> {
    pub fn new(id: i32, address: impl Into<String>, public_key: P) -> Self {
        Self {
            id,
            address: address.into(),
            public_key,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn public_key(&self) -> &P {
        &self.public_key
    }
}

/// Ordered, read-only collection of identities indexed by their id in
/// `[0, size)`.
pub trait Registry<P>: Send + Sync {
    fn size(&self) -> usize;

    /// Identity at index `idx`, if any.
    fn identity(&self, idx: usize) -> Option<&Identity<P>>;

    /// Identities in `[from, to)`, or `None` if the range is out of bounds.
    fn identities(&self, from: usize, to: usize) -> Option<&[Identity<P>]>;
}

/// [`Registry`] backed by a vector where the identity at index `i` has id `i`.
#[derive(Clone, Debug)]
pub struct ArrayRegistry<P> {
    ids: Vec<Identity<P>>,
}

impl<P> ArrayRegistry<P> {
    pub fn new(ids: Vec<Identity<P>>) -> Self {
        Self { ids }
    }
}

impl<P: Send + Sync> Registry<P> for ArrayRegistry<P> {
    fn size(&self) -> usize {
        self.ids.len()
    }

    fn identity(&self, idx: usize) -> Option<&Identity<P>> {
        self.ids.get(idx)
    }

    fn identities(&self, from: usize, to: usize) -> Option<&[Identity<P>]> {
        self.ids.get(from..to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_registry() {
        let reg = ArrayRegistry::new(
            (0..5)
                .map(|i| Identity::new(i, format!("node-{i}"), i * 10))
                .collect(),
        );
        assert_eq!(reg.size(), 5);
        assert_eq!(reg.identity(3).map(|id| *id.public_key()), Some(30));
        assert!(reg.identity(5).is_none());

        let ids = reg.identities(1, 4).unwrap();
        assert_eq!(ids.iter().map(Identity::id).collect::<Vec<_>>(), [1, 2, 3]);
        assert_eq!(ids[0].address(), "node-1");
        assert!(reg.identities(3, 6).is_none());
        assert!(reg.identities(4, 2).is_none());
        assert_eq!(reg.identities(2, 2).map(<[_]>::len), Some(0));
    }
}
