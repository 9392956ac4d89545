use uuid::Uuid;

/// 32-bit identifier carried on the media wire in place of the full 128-bit
/// stable id. Non-cryptographic: it trims header overhead and hides the full
/// id from passive observers, nothing more.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ShortId(pub u32);

impl std::fmt::Display for ShortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

const FNV_OFFSET: u32 = 0x811C_9DC5;
const FNV_PRIME: u32 = 0x0100_0193;

/// FNV-1a over the stable id bytes, folded with a per-process salt.
///
/// `attempt` perturbs the input so the registry can retry on collision;
/// attempt 0 is the canonical mapping.
pub fn short_id_for(stable: &Uuid, salt: u32, attempt: u32) -> ShortId {
    let mut h = FNV_OFFSET ^ salt;
    for &b in stable.as_bytes() {
        h ^= b as u32;
        h = h.wrapping_mul(FNV_PRIME);
    }
    if attempt != 0 {
        for b in attempt.to_be_bytes() {
            h ^= b as u32;
            h = h.wrapping_mul(FNV_PRIME);
        }
    }
    ShortId(h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stable_for_same_input() {
        let id = Uuid::new_v4();
        assert_eq!(short_id_for(&id, 7, 0), short_id_for(&id, 7, 0));
    }

    #[test]
    fn salt_changes_mapping() {
        let id = Uuid::new_v4();
        assert_ne!(short_id_for(&id, 1, 0), short_id_for(&id, 2, 0));
    }

    #[test]
    fn attempt_perturbs() {
        let id = Uuid::new_v4();
        assert_ne!(short_id_for(&id, 1, 0), short_id_for(&id, 1, 1));
    }
}
