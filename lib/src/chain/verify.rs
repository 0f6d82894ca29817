use bitcoin::secp256k1::{self, ecdsa, Message, PublicKey};

/// Runtime-dispatched signature verification: a capability value rather
/// than a hardcoded call, so the acceptor can be built with an alternative
/// implementation without recompiling it. The default is native secp256k1.
pub type VerifyFn = Box<dyn Fn(&PublicKey, &ecdsa::Signature, &Message) -> bool + Send + Sync>;

/// Builds the default verifier, backed by `bitcoin::secp256k1`'s verification
/// context. A fresh `Secp256k1<VerifyOnly>` is cheap to construct once and
/// reuse; it holds no per-call state.
pub fn native_verifier() -> VerifyFn {
    let secp = secp256k1::Secp256k1::verification_only();
    Box::new(move |pubkey, sig, msg| secp.verify_ecdsa(msg, sig, pubkey).is_ok())
}
