//! Node identifier, lookup target or value key, and the XOR metric over them.

use std::cmp::Ordering;
use std::convert::TryFrom;
use std::fmt::{self, Debug, Display, Formatter};
use std::str::FromStr;

use rand::Rng;

use crate::{Error, Result};

/// The size of identifiers in bytes.
pub const ID_SIZE: usize = 20;

/// The size of identifiers in bits, and the deepest a routing table can go.
pub const ID_BITS: usize = ID_SIZE * 8;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash)]
/// A 160 bit identifier locating both nodes and stored values in the XOR proximity space.
pub struct Id([u8; ID_SIZE]);

impl Id {
    /// Generate a random Id.
    pub fn random() -> Id {
        let mut rng = rand::thread_rng();
        let random_bytes: [u8; ID_SIZE] = rng.gen();

        Id(random_bytes)
    }

    /// Create a new Id from some bytes. Returns Err if `bytes` is not of length
    /// [ID_SIZE].
    pub fn from_bytes<T: AsRef<[u8]>>(bytes: T) -> Result<Id> {
        let bytes = bytes.as_ref();
        if bytes.len() != ID_SIZE {
            return Err(Error::InvalidIdSize(bytes.len()));
        }

        let mut tmp: [u8; ID_SIZE] = [0; ID_SIZE];
        tmp[..ID_SIZE].clone_from_slice(&bytes[..ID_SIZE]);

        Ok(Id(tmp))
    }

    pub fn as_bytes(&self) -> &[u8; ID_SIZE] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    /// The full width XOR distance between this Id and `other`.
    ///
    /// Distances order as unsigned magnitudes; the distance to self is zero.
    pub fn xor(&self, other: &Id) -> Distance {
        let mut result = [0_u8; ID_SIZE];

        for (i, byte) in result.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }

        Distance(result)
    }

    /// Returns `true` if this Id is strictly closer to `target` than `other` is.
    pub fn is_closer_to(&self, target: &Id, other: &Id) -> bool {
        self.xor(target) < other.xor(target)
    }

    /// Compare two identifiers by their proximity to this Id,
    /// usable to sort any set of identifiers by ascending XOR distance.
    pub fn cmp_distance(&self, a: &Id, b: &Id) -> Ordering {
        a.xor(self).cmp(&b.xor(self)).then_with(|| a.cmp(b))
    }

    /// The number of leading bits shared with `other`.
    ///
    /// Ranges from 0 (first bits differ) to [ID_BITS] (same Id), and decides
    /// which routing table bucket an Id falls into.
    pub fn common_prefix_length(&self, other: &Id) -> usize {
        for i in 0..ID_SIZE {
            let xor = self.0[i] ^ other.0[i];

            if xor != 0 {
                return i * 8 + xor.leading_zeros() as usize;
            }
        }

        ID_BITS
    }
}

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq)]
/// Unsigned magnitude of the XOR of two identifiers.
pub struct Distance(pub(crate) [u8; ID_SIZE]);

impl Distance {
    pub const ZERO: Distance = Distance([0; ID_SIZE]);
    pub const MAX: Distance = Distance([0xff; ID_SIZE]);
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl Debug for Distance {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({:x?})", &self.0)
    }
}

impl FromStr for Id {
    type Err = Error;

    fn from_str(s: &str) -> Result<Id> {
        if s.len() != ID_SIZE * 2 {
            return Err(Error::InvalidIdEncoding(s.into()));
        }

        let mut bytes = [0_u8; ID_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[i * 2..i * 2 + 2], 16)
                .map_err(|_| Error::InvalidIdEncoding(s.into()))?;
        }

        Ok(Id(bytes))
    }
}

impl TryFrom<&str> for Id {
    type Error = Error;

    fn try_from(s: &str) -> Result<Id> {
        s.parse()
    }
}

impl From<[u8; ID_SIZE]> for Id {
    fn from(bytes: [u8; ID_SIZE]) -> Id {
        Id(bytes)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn distance_to_self_is_zero() {
        let id = Id::random();

        assert_eq!(id.xor(&id), Distance::ZERO);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = Id::random();
        let b = Id::random();

        assert_eq!(a.xor(&b), b.xor(&a));
    }

    #[test]
    fn ordering_by_distance() {
        let target = Id::from([0; ID_SIZE]);

        let mut closer = [0_u8; ID_SIZE];
        closer[ID_SIZE - 1] = 1;

        let mut further = [0_u8; ID_SIZE];
        further[0] = 1;

        let closer = Id::from(closer);
        let further = Id::from(further);

        assert!(closer.is_closer_to(&target, &further));
        assert!(!further.is_closer_to(&target, &closer));
        assert_eq!(
            target.cmp_distance(&closer, &further),
            Ordering::Less
        );
    }

    #[test]
    fn common_prefix_length() {
        let a = Id::from([0; ID_SIZE]);

        assert_eq!(a.common_prefix_length(&a), ID_BITS);

        let mut bytes = [0_u8; ID_SIZE];
        bytes[0] = 0b1000_0000;
        assert_eq!(a.common_prefix_length(&Id::from(bytes)), 0);

        let mut bytes = [0_u8; ID_SIZE];
        bytes[1] = 0b0001_0000;
        assert_eq!(a.common_prefix_length(&Id::from(bytes)), 11);
    }

    #[test]
    fn from_hex() {
        let id: Id = "aefb7fac689c1122107dfcde08f6fa2ec4cfec66".parse().unwrap();

        assert_eq!(id.to_string(), "aefb7fac689c1122107dfcde08f6fa2ec4cfec66");
        assert!("too-short".parse::<Id>().is_err());
    }

    #[test]
    fn from_bytes_rejects_wrong_size() {
        assert!(Id::from_bytes([0_u8; 19]).is_err());
        assert!(Id::from_bytes([0_u8; 20]).is_ok());
    }
}
