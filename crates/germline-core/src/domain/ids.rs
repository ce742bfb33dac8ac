//! Identifier newtypes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Candidate identifier: arena slot plus the generation that occupies it.
///
/// Slots are reused after retirement; the generation distinguishes the new
/// occupant from the retired one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateId {
    pub slot: u32,
    pub generation: u32,
}

impl CandidateId {
    pub fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }
}

impl std::fmt::Display for CandidateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "c{}.{}", self.slot, self.generation)
    }
}

impl std::str::FromStr for CandidateId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let body = s
            .strip_prefix('c')
            .ok_or_else(|| format!("candidate id must start with 'c': {s}"))?;
        let (slot, generation) = body
            .split_once('.')
            .ok_or_else(|| format!("candidate id must look like c<slot>.<generation>: {s}"))?;
        Ok(Self {
            slot: slot.parse().map_err(|_| format!("bad slot in {s}"))?,
            generation: generation
                .parse()
                .map_err(|_| format!("bad generation in {s}"))?,
        })
    }
}

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(
    /// Training job identifier.
    JobId
);
uuid_id!(
    /// Trained artifact identifier.
    ArtifactId
);
uuid_id!(
    /// Agent descriptor identifier.
    DescriptorId
);

/// Registry entry identifier, assigned monotonically by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntryId(pub u64);

impl std::fmt::Display for EntryId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "e{}", self.0)
    }
}

impl std::str::FromStr for EntryId {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let digits = s.strip_prefix('e').unwrap_or(s);
        digits
            .parse()
            .map(EntryId)
            .map_err(|_| format!("invalid entry id: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_id_display_parse() {
        let id = CandidateId::new(4, 2);
        assert_eq!(id.to_string(), "c4.2");
        assert_eq!("c4.2".parse::<CandidateId>().unwrap(), id);
        assert!("4.2".parse::<CandidateId>().is_err());
        assert!("c4".parse::<CandidateId>().is_err());
    }

    #[test]
    fn entry_id_accepts_prefixed_and_bare() {
        assert_eq!("e12".parse::<EntryId>().unwrap(), EntryId(12));
        assert_eq!("12".parse::<EntryId>().unwrap(), EntryId(12));
        assert!("ex".parse::<EntryId>().is_err());
    }

    #[test]
    fn uuid_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
        assert_ne!(ArtifactId::new(), ArtifactId::new());
    }
}
