use crate::peer::types::{IceServerKind, ServerConfig};
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

/// Prefix the ICE server URL with `stun:` / `turn:` when the scheme is missing.
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:")
        || config.url.starts_with("turns:")
        || config.url.starts_with("stun:")
        || config.url.starts_with("stuns:")
    {
        config.url.clone()
    } else {
        let scheme = match config.kind {
            IceServerKind::Turn => "turn:",
            IceServerKind::Stun => "stun:",
        };
        format!("{}{}", scheme, config.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_added_by_kind() {
        let mut cfg = ServerConfig::stun("a", "stun.example.org:3478");
        assert_eq!(add_ice_url_scheme(&cfg), "stun:stun.example.org:3478");

        cfg.kind = IceServerKind::Turn;
        assert_eq!(add_ice_url_scheme(&cfg), "turn:stun.example.org:3478");

        cfg.url = "stun:other:19302".into();
        assert_eq!(add_ice_url_scheme(&cfg), "stun:other:19302");
    }

    #[test]
    fn ids_are_hex() {
        let id = random_id();
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, random_id());
    }
}
