// TLS 1.2 PRF with HMAC-SHA256, the key derivation the device family
// specifies for its platform-binding handshake.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| Error::Crypto)?;
    for part in parts {
        mac.update(part);
    }
    let digest = mac.finalize().into_bytes();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Fill `out` with `P_SHA256(secret, label ‖ seed)` key material.
///
/// The output is a prefix-stable stream: requesting 32 bytes yields the
/// first 32 bytes of a 40-byte request.
pub fn tls_prf_sha256(secret: &[u8], label: &[u8], seed: &[u8], out: &mut [u8]) -> Result<()> {
    // A(1) = HMAC(secret, label ‖ seed); A(i) = HMAC(secret, A(i-1)).
    let mut a = hmac_sha256(secret, &[label, seed])?;
    let mut filled = 0;
    while filled < out.len() {
        let block = hmac_sha256(secret, &[&a[..], label, seed])?;
        let take = (out.len() - filled).min(block.len());
        out[filled..filled + take].copy_from_slice(&block[..take]);
        filled += take;
        let next = hmac_sha256(secret, &[&a[..]])?;
        a.zeroize();
        a = next;
    }
    a.zeroize();
    Ok(())
}
