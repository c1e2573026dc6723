use rustls::crypto::hpke::Hpke;
use rustls::crypto::{aws_lc_rs, CryptoProvider};
use rustls::NamedGroup;

/// aws-lc-rs provider for ECH connections.
///
/// Post-quantum hybrid groups are dropped from the key exchange list.
pub fn build_provider() -> CryptoProvider {
    let mut provider = aws_lc_rs::default_provider();
    provider.kx_groups = provider
        .kx_groups
        .into_iter()
        .filter(|group| {
            !matches!(
                group.name(),
                NamedGroup::X25519MLKEM768 | NamedGroup::secp256r1MLKEM768 | NamedGroup::MLKEM768
            )
        })
        .collect();
    provider
}

/// HPKE suites offered when sealing the inner ClientHello.
pub fn hpke_suites() -> &'static [&'static dyn Hpke] {
    aws_lc_rs::hpke::ALL_SUPPORTED_SUITES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_has_classical_groups_only() {
        let provider = build_provider();
        assert!(!provider.kx_groups.is_empty());
        assert!(provider
            .kx_groups
            .iter()
            .all(|group| group.name() != NamedGroup::X25519MLKEM768));
        assert!(provider
            .kx_groups
            .iter()
            .any(|group| group.name() == NamedGroup::X25519));
    }

    #[test]
    fn hpke_suites_available() {
        assert!(!hpke_suites().is_empty());
    }
}
