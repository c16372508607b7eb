/// ChunkId is the 128-bit identity of an immutable stored chunk.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId([u8; 16]);

/// ChunkTreeId identifies a chunk tree committed under an output table.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkTreeId([u8; 16]);

/// NodeId is the compact directory index of a cluster node.
pub type NodeId = u32;

macro_rules! impl_hex_id {
    ($name:ident) => {
        impl $name {
            pub fn new(b: [u8; 16]) -> Self {
                Self(b)
            }
            pub fn is_zero(&self) -> bool {
                self.0 == [0u8; 16]
            }
            pub fn as_bytes(&self) -> &[u8; 16] {
                &self.0
            }
            /// Build an id from a pair of 64-bit halves, useful in tests
            /// and in compact wire forms.
            pub fn from_parts(hi: u64, lo: u64) -> Self {
                let mut b = [0u8; 16];
                b[..8].copy_from_slice(&hi.to_be_bytes());
                b[8..].copy_from_slice(&lo.to_be_bytes());
                Self(b)
            }
            pub fn from_hex<T: AsRef<[u8]>>(hex: T) -> Result<Self, hex::FromHexError> {
                let vec_bytes = hex::decode(hex)?;
                let exact: [u8; 16] = vec_bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| hex::FromHexError::InvalidStringLength)?;

                Ok(Self(exact))
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let hi = u64::from_be_bytes(self.0[..8].try_into().unwrap());
                let lo = u64::from_be_bytes(self.0[8..].try_into().unwrap());
                write!(f, "{hi:016x}-{lo:016x}")
            }
        }

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                <Self as std::fmt::Display>::fmt(self, f)
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
            where
                S: serde::Serializer,
            {
                format!("{self}").serialize(serializer)
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
            where
                D: serde::Deserializer<'de>,
            {
                use serde::de::Error;
                let s = std::borrow::Cow::<'de, str>::deserialize(deserializer)?;
                let no_dashes = s.replace('-', "");
                Self::from_hex(&no_dashes)
                    .map_err(|err| D::Error::custom(format!("invalid id: {err}")))
            }
        }
    };
}

impl_hex_id!(ChunkId);
impl_hex_id!(ChunkTreeId);

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn id_display_round_trip() {
        let id = ChunkId::from_parts(0xdead_beef, 42);
        assert_eq!(id.to_string(), "00000000deadbeef-000000000000002a");

        let json = serde_json::to_string(&id).unwrap();
        let back: ChunkId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn from_hex_validates_length() {
        let id = ChunkId::from_hex("00000000deadbeef000000000000002a").unwrap();
        assert_eq!(id, ChunkId::from_parts(0xdead_beef, 42));

        assert!(matches!(
            ChunkId::from_hex("deadbeef"),
            Err(hex::FromHexError::InvalidStringLength)
        ));
    }

    #[test]
    fn zero_id() {
        assert!(ChunkId::new([0; 16]).is_zero());
        assert!(!ChunkId::from_parts(0, 1).is_zero());
    }
}
