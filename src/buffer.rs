//! Appendable byte chains ("ropes") shared by keys, values, record headers,
//! and transaction payloads.
//!
//! A [`Buf`] is an ordered chain of reference-counted fragments. Appending
//! never copies payload bytes: the appended chain's fragments are captured
//! *by value* (cheap refcount bumps), so growing the source afterwards can
//! never extend a chain it was appended to. Commit walks the fragments in
//! order and writes them straight through a lease, with no intermediate
//! flattening.

use bytes::{Bytes, BytesMut};
use snafu::OptionExt;

use crate::{LengthOverflowSnafu, Result};

/// A refcounted, appendable chain of byte fragments.
///
/// Cloning a `Buf` is cheap and shares the underlying fragment storage;
/// dropping the last clone of a fragment releases it. The total length is
/// capped at `u32::MAX`, the on-disk size type.
#[derive(Clone, Debug, Default)]
pub struct Buf {
    fragments: Vec<Bytes>,
    len: u32,
}

impl Buf {
    /// An empty chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing allocation without copying it.
    ///
    /// # Errors
    ///
    /// Fails with a length-overflow error if `data` is longer than the
    /// on-disk size type allows.
    pub fn direct(data: impl Into<Bytes>) -> Result<Self> {
        let data = data.into();
        let len = u32::try_from(data.len()).ok().context(LengthOverflowSnafu)?;
        Ok(Self {
            fragments: if data.is_empty() { Vec::new() } else { vec![data] },
            len,
        })
    }

    /// Copies `data` into a freshly allocated single-fragment chain.
    ///
    /// # Errors
    ///
    /// Fails with a length-overflow error if `data` is longer than the
    /// on-disk size type allows.
    pub fn copy_from(data: &[u8]) -> Result<Self> {
        Self::direct(Bytes::copy_from_slice(data))
    }

    /// Total length of all fragments in the chain.
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Appends `other`'s chain to this one.
    ///
    /// The fragments are captured by value: later appends to `other` do not
    /// change `self`, and `other` remains usable on its own.
    ///
    /// # Errors
    ///
    /// Fails with a length-overflow error if the combined length would
    /// overflow the on-disk size type; `self` is left unchanged.
    pub fn append(&mut self, other: &Buf) -> Result<()> {
        let len = self.len.checked_add(other.len).context(LengthOverflowSnafu)?;
        self.fragments.extend(other.fragments.iter().cloned());
        self.len = len;
        Ok(())
    }

    /// The fragments of the chain, in write order.
    pub(crate) fn fragments(&self) -> impl Iterator<Item = &[u8]> {
        self.fragments.iter().map(|b| b.as_ref())
    }

    /// Flattens the chain into one contiguous fragment and returns it.
    ///
    /// A chain of zero or one fragments is returned as-is; otherwise the
    /// fragments are copied once into a single allocation which replaces the
    /// chain's storage, so repeated calls are free.
    pub fn to_bytes(&mut self) -> Bytes {
        if self.fragments.len() > 1 {
            let mut flat = BytesMut::with_capacity(self.len as usize);
            for fragment in &self.fragments {
                flat.extend_from_slice(fragment);
            }
            self.fragments = vec![flat.freeze()];
        }
        self.fragments.first().cloned().unwrap_or_else(Bytes::new)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::Buf;
    use crate::Error;

    #[test]
    fn append_captures_by_value() {
        let mut a = Buf::copy_from(b"head").expect("buf should not fail");
        let mut b = Buf::copy_from(b"tail").expect("buf should not fail");
        a.append(&b).expect("append should not fail");

        // Growing `b` afterwards must not extend `a`'s view.
        let extra = Buf::copy_from(b"-more").expect("buf should not fail");
        b.append(&extra).expect("append should not fail");

        assert_eq!(a.to_bytes().as_ref(), b"headtail");
        assert_eq!(b.to_bytes().as_ref(), b"tail-more");
    }

    #[test]
    fn append_rejects_length_overflow() {
        // Fake a chain at the cap without allocating 4GiB.
        let mut a = Buf::copy_from(b"x").expect("buf should not fail");
        a.len = u32::MAX;
        let b = Buf::copy_from(b"y").expect("buf should not fail");
        assert!(matches!(a.append(&b), Err(Error::LengthOverflow)));
        assert_eq!(a.len(), u32::MAX);
    }

    #[test]
    fn flatten_of_empty_chain_is_empty() {
        let mut buf = Buf::new();
        assert!(buf.is_empty());
        assert_eq!(buf.to_bytes().len(), 0);
    }

    #[test]
    fn direct_takes_ownership_without_copying() {
        let storage = vec![1u8, 2, 3, 4];
        let ptr = storage.as_ptr();
        let mut buf = Buf::direct(storage).expect("buf should not fail");
        assert_eq!(buf.len(), 4);
        // Still the same allocation.
        assert_eq!(buf.to_bytes().as_ptr(), ptr);
    }

    proptest! {
        #[test]
        fn copy_round_trips(data in proptest::collection::vec(any::<u8>(), 0..512)) {
            let mut buf = Buf::copy_from(&data).expect("buf should not fail");
            prop_assert_eq!(buf.len() as usize, data.len());
            let bytes = buf.to_bytes();
            prop_assert_eq!(bytes.as_ref(), data.as_slice());
        }

        #[test]
        fn append_concatenates_in_order(
            head in proptest::collection::vec(any::<u8>(), 0..256),
            tail in proptest::collection::vec(any::<u8>(), 0..256),
        ) {
            let mut a = Buf::copy_from(&head).expect("buf should not fail");
            let b = Buf::copy_from(&tail).expect("buf should not fail");
            a.append(&b).expect("append should not fail");

            prop_assert_eq!(u64::from(a.len()), (head.len() + tail.len()) as u64);
            let mut expected = head.clone();
            expected.extend_from_slice(&tail);
            let a_bytes = a.to_bytes();
            prop_assert_eq!(a_bytes.as_ref(), expected.as_slice());
        }
    }
}
