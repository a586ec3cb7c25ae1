use crate::session::SessionAddress;

/// Decides whether a peer identity key is accepted for an address.
pub trait TrustPolicy: Send + Sync {
    fn has_trust(&self, address: &SessionAddress, identity_key: Option<&[u8]>) -> bool;
}

/// Placeholder policy: approves every identity without verification.
///
/// No identity check happens here yet; swap in a real policy through
/// `KeyStore::with_trust_policy`.
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysTrust;

impl TrustPolicy for AlwaysTrust {
    fn has_trust(&self, _address: &SessionAddress, _identity_key: Option<&[u8]>) -> bool {
        true
    }
}

impl<F> TrustPolicy for F
where
    F: Fn(&SessionAddress, Option<&[u8]>) -> bool + Send + Sync,
{
    fn has_trust(&self, address: &SessionAddress, identity_key: Option<&[u8]>) -> bool {
        self(address, identity_key)
    }
}
