//! Deterministic display-name assignment.
//!
//! The real public-name generator is an external collaborator (see
//! out of scope here); `/register` still needs to return *something*,
//! so this is a minimal built-in word-pair generator seeded by the
//! client's id. It is intentionally small — swap it for the richer
//! generator without touching the session registry's contract.

use uuid::Uuid;

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "cedar", "dusty", "ember", "faint", "gilt", "hazy", "iron", "jade", "keen",
    "lucid", "misty", "noble", "opal", "plain", "quiet", "rusty", "sable", "tidal",
];

const NOUNS: &[&str] = &[
    "falcon", "otter", "badger", "heron", "lynx", "marten", "osprey", "petrel", "raven", "sparrow",
    "tapir", "urchin", "vole", "wren", "yak", "zebra", "gecko", "ibis", "kite", "newt",
];

/// Derive a stable `adjective-noun-####` label from a client id.
pub fn assign(client_id: &Uuid) -> String {
    let bytes = client_id.as_bytes();
    let adj = ADJECTIVES[fold(&bytes[0..4]) as usize % ADJECTIVES.len()];
    let noun = NOUNS[fold(&bytes[4..8]) as usize % NOUNS.len()];
    let suffix = fold(&bytes[8..12]) % 10_000;
    format!("{adj}-{noun}-{suffix:04}")
}

fn fold(chunk: &[u8]) -> u32 {
    u32::from_be_bytes(chunk.try_into().expect("4-byte chunk"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_for_same_id() {
        let id = Uuid::new_v4();
        assert_eq!(assign(&id), assign(&id));
    }

    #[test]
    fn differs_across_ids_with_overwhelming_probability() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert_ne!(assign(&a), assign(&b));
    }

    #[test]
    fn shape_is_adjective_noun_suffix() {
        let name = assign(&Uuid::new_v4());
        let parts: Vec<&str> = name.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert!(ADJECTIVES.contains(&parts[0]));
        assert!(NOUNS.contains(&parts[1]));
        assert_eq!(parts[2].len(), 4);
    }
}
