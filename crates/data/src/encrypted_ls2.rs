//! Encrypted LeaseSet2 (store type 5).
//!
//! The envelope replaces the destination identity with a date-blinded
//! public key and wraps the inner LeaseSet2 in two ChaCha20 layers:
//!
//! ```text
//! envelope  = blinded-sig-type ‖ blinded-key ‖ published ‖ expires ‖ flags
//!             ‖ len ‖ outer-ciphertext ‖ signature(blinded key)
//! outer     = outer-salt ‖ ChaCha20(flag ‖ [auth-data] ‖ inner-salt ‖ inner-ct)
//! keys1     = HKDF(outer-salt, subcredential ‖ published, "ELS2_L1K", 44)
//! keys2     = HKDF(inner-salt, [cookie ‖] subcredential ‖ published, "ELS2_L2K", 44)
//! inner-pt  = store-type ‖ inner LeaseSet2
//! ```
//!
//! Client authorization hides a 32-byte cookie in per-client records found
//! by an 8-byte client id, derived by DH against an ephemeral key
//! ("ELS2_XCA") or from a pre-shared key ("ELS2PSKA").

use rand::RngCore;

use veil_crypto::sig::{RedDsaSigner, Verifier};
use veil_crypto::{chacha, kdf, x25519};

use crate::blinding::BlindedPublicKey;
use crate::keys::PrivateKeys;
use crate::lease_set::{
    read_offline_block, LeaseSet, LEASESET2_FLAG_OFFLINE_KEYS, STORE_TYPE_ENCRYPTED_LEASESET2,
    STORE_TYPE_META_LEASESET2, STORE_TYPE_STANDARD_LEASESET2,
};
use crate::{DataError, Reader};

const AUTH_FLAG_NONE: u8 = 0x00;
const AUTH_FLAG_DH: u8 = 0x01;
const AUTH_FLAG_PSK: u8 = 0x03;

const CLIENT_RECORD_LEN: usize = 40; // 8-byte id + 32-byte encrypted cookie

/// A client credential for decrypting an authorized LeaseSet.
pub enum ClientSecret {
    /// X25519 secret whose public key the publisher authorized.
    Dh([u8; 32]),
    /// Pre-shared 32-byte key.
    Psk([u8; 32]),
}

fn layer_keys(salt: &[u8], input: &[u8], info: &[u8]) -> ([u8; 32], [u8; 12]) {
    let okm = kdf::hkdf_n::<44>(salt, input, info);
    let mut key = [0u8; 32];
    let mut nonce = [0u8; 12];
    key.copy_from_slice(&okm[..32]);
    nonce.copy_from_slice(&okm[32..]);
    (key, nonce)
}

fn find_cookie(records: &[u8], okm: &[u8; 64]) -> Result<[u8; 32], DataError> {
    let key: [u8; 32] = okm[..32].try_into().expect("okm split");
    let nonce: [u8; 12] = okm[32..44].try_into().expect("okm split");
    let client_id = &okm[44..52];
    for record in records.chunks_exact(CLIENT_RECORD_LEN) {
        if &record[..8] == client_id {
            let mut cookie: [u8; 32] = record[8..].try_into().expect("40-byte record");
            chacha::xor(&key, &nonce, 1, &mut cookie);
            return Ok(cookie);
        }
    }
    Err(DataError::Malformed("client cookie not found"))
}

/// Recover the auth cookie from the outer plaintext's auth-data section.
/// Returns `(cookie, auth_data_len)`.
fn extract_auth_cookie(
    outer_plain: &[u8],
    secret: Option<&ClientSecret>,
    subcredential36: &[u8; 36],
) -> Result<(Option<[u8; 32]>, usize), DataError> {
    let mut r = Reader::new(outer_plain);
    let flag = r.u8()?;
    if flag & 0x01 == 0 {
        return Ok((None, 0));
    }
    if flag & 0x0e == 0 {
        // DH
        let ephemeral: [u8; 32] = r.take(32)?.try_into().expect("32 bytes");
        let num_clients = r.u16()? as usize;
        let records = r.take(num_clients * CLIENT_RECORD_LEN)?;
        let Some(ClientSecret::Dh(secret)) = secret else {
            return Err(DataError::Malformed("DH client secret required"));
        };
        let keypair = x25519::KeyPair::from_secret_bytes(secret);
        let mut auth_input = [0u8; 100];
        auth_input[..32].copy_from_slice(&keypair.agree(&ephemeral));
        auth_input[32..64].copy_from_slice(&keypair.public_bytes());
        auth_input[64..].copy_from_slice(subcredential36);
        let okm = kdf::hkdf_n::<64>(&ephemeral, &auth_input, b"ELS2_XCA");
        Ok((Some(find_cookie(records, &okm)?), r.position() - 1))
    } else if flag & 0x02 != 0 {
        // PSK
        let salt: [u8; 32] = r.take(32)?.try_into().expect("32 bytes");
        let num_clients = r.u16()? as usize;
        let records = r.take(num_clients * CLIENT_RECORD_LEN)?;
        let Some(ClientSecret::Psk(secret)) = secret else {
            return Err(DataError::Malformed("PSK client secret required"));
        };
        let mut auth_input = [0u8; 68];
        auth_input[..32].copy_from_slice(secret);
        auth_input[32..].copy_from_slice(subcredential36);
        let okm = kdf::hkdf_n::<64>(&salt, &auth_input, b"ELS2PSKA");
        Ok((Some(find_cookie(records, &okm)?), r.position() - 1))
    } else {
        Err(DataError::Malformed("client auth scheme"))
    }
}

/// Decrypt and verify an encrypted LeaseSet2. `key` is the blinded key the
/// requester derived from the known destination; `secret` is the client
/// credential when the publisher requires authorization.
pub fn decrypt(
    buf: &[u8],
    key: &BlindedPublicKey,
    secret: Option<&ClientSecret>,
) -> Result<LeaseSet, DataError> {
    let mut r = Reader::new(buf);
    let blinded_sig_type = veil_crypto::sig::SigType::from_code(r.u16()?)?;
    if blinded_sig_type != key.blinded_sig_type() {
        return Err(DataError::Malformed("blinded key type"));
    }
    let blinded_key: [u8; 32] = r
        .take(blinded_sig_type.pubkey_len())?
        .try_into()
        .map_err(|_| DataError::Malformed("blinded key length"))?;
    let published_bytes: [u8; 4] = r.take(4)?.try_into().expect("4 bytes");
    let published = u32::from_be_bytes(published_bytes);
    let _expires = r.u16()?;
    let flags = r.u16()?;

    let blinded_verifier = Verifier::new(blinded_sig_type, &blinded_key)?;
    let mut transient: Option<(veil_crypto::sig::SigType, Vec<u8>)> = None;
    if flags & LEASESET2_FLAG_OFFLINE_KEYS != 0 {
        let offset = r.position();
        let (t, pubkey, consumed) = read_offline_block(
            |msg, sig| {
                blinded_verifier
                    .verify(msg, sig)
                    .map_err(|_| DataError::BadSignature)
            },
            buf,
            offset,
            blinded_sig_type.sig_len(),
        )?;
        r.take(consumed)?;
        transient = Some((t, pubkey));
    }

    let outer_len = r.u16()? as usize;
    let outer_ciphertext = r.take(outer_len)?;
    if outer_len < 33 {
        return Err(DataError::Malformed("outer ciphertext length"));
    }

    // outer signature, possibly by a transient key
    let signed_len = r.position();
    let (sig_len, verify): (usize, Box<dyn Fn(&[u8], &[u8]) -> Result<(), DataError>>) =
        match &transient {
            Some((t, pubkey)) => {
                let v = Verifier::new(*t, pubkey)?;
                (
                    t.sig_len(),
                    Box::new(move |msg, sig| v.verify(msg, sig).map_err(|_| DataError::BadSignature)),
                )
            }
            None => (
                blinded_sig_type.sig_len(),
                Box::new(move |msg, sig| {
                    blinded_verifier
                        .verify(msg, sig)
                        .map_err(|_| DataError::BadSignature)
                }),
            ),
        };
    let sig = r.take(sig_len)?;
    let mut signed = Vec::with_capacity(1 + signed_len);
    signed.push(STORE_TYPE_ENCRYPTED_LEASESET2);
    signed.extend_from_slice(&buf[..signed_len]);
    verify(&signed, sig)?;

    // verify the blinding for the publication date
    let date = veil_core::time::date_string(published as u64);
    if key.blinded_key(&date)? != blinded_key {
        return Err(DataError::Malformed("blinded public key mismatch"));
    }

    let mut subcredential36 = [0u8; 36];
    subcredential36[..32].copy_from_slice(&key.subcredential(&blinded_key));
    subcredential36[32..].copy_from_slice(&published_bytes);

    // layer 1
    let (outer_salt, outer_ct) = outer_ciphertext.split_at(32);
    let (k1, n1) = layer_keys(outer_salt, &subcredential36, b"ELS2_L1K");
    let mut outer_plain = outer_ct.to_vec();
    chacha::xor(&k1, &n1, 1, &mut outer_plain);

    // layer 2
    let (cookie, auth_len) = extract_auth_cookie(&outer_plain, secret, &subcredential36)?;
    let inner_start = 1 + auth_len;
    if outer_plain.len() < inner_start + 33 {
        return Err(DataError::Malformed("inner ciphertext length"));
    }
    let inner_salt = &outer_plain[inner_start..inner_start + 32];
    let (k2, n2) = match cookie {
        Some(cookie) => {
            let mut input = [0u8; 68];
            input[..32].copy_from_slice(&cookie);
            input[32..].copy_from_slice(&subcredential36);
            layer_keys(inner_salt, &input, b"ELS2_L2K")
        }
        None => layer_keys(inner_salt, &subcredential36, b"ELS2_L2K"),
    };
    let mut inner_plain = outer_plain[inner_start + 32..].to_vec();
    chacha::xor(&k2, &n2, 1, &mut inner_plain);

    // inner store type + inner LS2, verified again under the real identity
    let inner_type = *inner_plain.first().ok_or(DataError::Malformed("inner store type"))?;
    if inner_type != STORE_TYPE_STANDARD_LEASESET2 && inner_type != STORE_TYPE_META_LEASESET2 {
        return Err(DataError::Malformed("inner store type"));
    }
    LeaseSet::from_buffer_v2(inner_type, &inner_plain[1..])
}

/// Authorized clients for the publish side.
pub enum AuthScheme<'a> {
    None,
    /// X25519 public keys of authorized clients.
    Dh(&'a [[u8; 32]]),
    /// Pre-shared keys of authorized clients.
    Psk(&'a [[u8; 32]]),
}

fn write_client_records(
    out: &mut Vec<u8>,
    cookie: &[u8; 32],
    per_client_okm: impl Iterator<Item = [u8; 64]>,
) {
    let mut records = Vec::new();
    let mut count = 0u16;
    for okm in per_client_okm {
        let key: [u8; 32] = okm[..32].try_into().expect("okm split");
        let nonce: [u8; 12] = okm[32..44].try_into().expect("okm split");
        records.extend_from_slice(&okm[44..52]);
        let mut encrypted = *cookie;
        chacha::xor(&key, &nonce, 1, &mut encrypted);
        records.extend_from_slice(&encrypted);
        count += 1;
    }
    out.extend_from_slice(&count.to_be_bytes());
    out.extend_from_slice(&records);
}

/// Build an encrypted LeaseSet2 envelope around a signed inner LeaseSet2.
pub fn encrypt(
    keys: &PrivateKeys,
    inner_ls2: &[u8],
    published: u32,
    expires_delta: u16,
    auth: AuthScheme<'_>,
) -> Result<Vec<u8>, DataError> {
    let blinded = BlindedPublicKey::from_identity(keys.identity())?;
    let date = veil_core::time::date_string(published as u64);
    let blinded_pub = blinded.blinded_key(&date)?;
    let signing_pubkey: [u8; 32] = keys
        .identity()
        .signing_pubkey()
        .try_into()
        .map_err(|_| DataError::Malformed("signing key length"))?;
    let blinded_priv = crate::blinding::blind_private_key(
        keys.identity().sig_type(),
        keys.signing_seed(),
        &signing_pubkey,
        &date,
    )?;
    let signer = RedDsaSigner::new(&blinded_priv)?;

    let published_bytes = published.to_be_bytes();
    let mut subcredential36 = [0u8; 36];
    subcredential36[..32].copy_from_slice(&blinded.subcredential(&blinded_pub));
    subcredential36[32..].copy_from_slice(&published_bytes);

    let mut rng = rand::rngs::OsRng;

    // layer 2 plaintext
    let mut inner_plain = Vec::with_capacity(1 + inner_ls2.len());
    inner_plain.push(STORE_TYPE_STANDARD_LEASESET2);
    inner_plain.extend_from_slice(inner_ls2);

    // auth section + cookie
    let mut auth_section = Vec::new();
    let cookie = match auth {
        AuthScheme::None => {
            auth_section.push(AUTH_FLAG_NONE);
            None
        }
        AuthScheme::Dh(clients) => {
            auth_section.push(AUTH_FLAG_DH);
            let mut cookie = [0u8; 32];
            rng.fill_bytes(&mut cookie);
            let ephemeral = x25519::KeyPair::generate();
            auth_section.extend_from_slice(&ephemeral.public_bytes());
            let esk_pub = ephemeral.public_bytes();
            write_client_records(
                &mut auth_section,
                &cookie,
                clients.iter().map(|client_pub| {
                    let mut auth_input = [0u8; 100];
                    auth_input[..32].copy_from_slice(&ephemeral.agree(client_pub));
                    auth_input[32..64].copy_from_slice(client_pub);
                    auth_input[64..].copy_from_slice(&subcredential36);
                    kdf::hkdf_n::<64>(&esk_pub, &auth_input, b"ELS2_XCA")
                }),
            );
            Some(cookie)
        }
        AuthScheme::Psk(clients) => {
            auth_section.push(AUTH_FLAG_PSK);
            let mut cookie = [0u8; 32];
            rng.fill_bytes(&mut cookie);
            let mut salt = [0u8; 32];
            rng.fill_bytes(&mut salt);
            auth_section.extend_from_slice(&salt);
            write_client_records(
                &mut auth_section,
                &cookie,
                clients.iter().map(|psk| {
                    let mut auth_input = [0u8; 68];
                    auth_input[..32].copy_from_slice(psk);
                    auth_input[32..].copy_from_slice(&subcredential36);
                    kdf::hkdf_n::<64>(&salt, &auth_input, b"ELS2PSKA")
                }),
            );
            Some(cookie)
        }
    };

    // layer 2 encryption
    let mut inner_salt = [0u8; 32];
    rng.fill_bytes(&mut inner_salt);
    let (k2, n2) = match &cookie {
        Some(cookie) => {
            let mut input = [0u8; 68];
            input[..32].copy_from_slice(cookie);
            input[32..].copy_from_slice(&subcredential36);
            layer_keys(&inner_salt, &input, b"ELS2_L2K")
        }
        None => layer_keys(&inner_salt, &subcredential36, b"ELS2_L2K"),
    };
    chacha::xor(&k2, &n2, 1, &mut inner_plain);

    let mut outer_plain = auth_section;
    outer_plain.extend_from_slice(&inner_salt);
    outer_plain.extend_from_slice(&inner_plain);

    // layer 1 encryption
    let mut outer_salt = [0u8; 32];
    rng.fill_bytes(&mut outer_salt);
    let (k1, n1) = layer_keys(&outer_salt, &subcredential36, b"ELS2_L1K");
    chacha::xor(&k1, &n1, 1, &mut outer_plain);

    let mut outer_ciphertext = outer_salt.to_vec();
    outer_ciphertext.extend_from_slice(&outer_plain);

    // envelope
    let mut body = Vec::with_capacity(48 + outer_ciphertext.len());
    body.extend_from_slice(&blinded.blinded_sig_type().code().to_be_bytes());
    body.extend_from_slice(&blinded_pub);
    body.extend_from_slice(&published_bytes);
    body.extend_from_slice(&expires_delta.to_be_bytes());
    body.extend_from_slice(&0u16.to_be_bytes()); // flags: signed by blinded key directly
    body.extend_from_slice(&(outer_ciphertext.len() as u16).to_be_bytes());
    body.extend_from_slice(&outer_ciphertext);

    let mut signed = Vec::with_capacity(1 + body.len());
    signed.push(STORE_TYPE_ENCRYPTED_LEASESET2);
    signed.extend_from_slice(&body);
    let sig = signer.sign(&signed).map_err(DataError::Crypto)?;
    body.extend_from_slice(&sig);
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lease_set::{build_standard_ls2, Lease};
    use veil_core::{time, IdentHash};

    fn build_inner(keys: &PrivateKeys, published: u32) -> Vec<u8> {
        let now = published as u64 * 1000;
        build_standard_ls2(
            keys,
            &[(4u16, vec![7u8; 32])],
            &[Lease {
                gateway: IdentHash::new([1u8; 32]),
                tunnel_id: 5,
                end_date: now + 600_000,
            }],
            published,
            600,
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_roundtrip_no_auth() {
        let keys = PrivateKeys::generate().unwrap();
        let published = time::seconds_since_epoch() as u32;
        let inner = build_inner(&keys, published);
        let envelope = encrypt(&keys, &inner, published, 600, AuthScheme::None).unwrap();

        let blinded = BlindedPublicKey::from_identity(keys.identity()).unwrap();
        let ls = decrypt(&envelope, &blinded, None).unwrap();
        assert_eq!(ls.hash(), keys.identity().hash());
        assert_eq!(ls.leases().len(), 1);
        assert_eq!(ls.published(), published);
    }

    #[test]
    fn test_roundtrip_psk_auth() {
        let keys = PrivateKeys::generate().unwrap();
        let published = time::seconds_since_epoch() as u32;
        let inner = build_inner(&keys, published);
        let psk1 = [41u8; 32];
        let psk2 = [42u8; 32];
        let envelope = encrypt(
            &keys,
            &inner,
            published,
            600,
            AuthScheme::Psk(&[psk1, psk2]),
        )
        .unwrap();

        let blinded = BlindedPublicKey::from_identity(keys.identity()).unwrap();
        // both authorized clients can decrypt
        for psk in [psk1, psk2] {
            let ls = decrypt(&envelope, &blinded, Some(&ClientSecret::Psk(psk))).unwrap();
            assert_eq!(ls.hash(), keys.identity().hash());
        }
        // an unauthorized key cannot find its cookie
        let err = decrypt(&envelope, &blinded, Some(&ClientSecret::Psk([9u8; 32])));
        assert!(err.is_err());
        // no credential at all fails too
        assert!(decrypt(&envelope, &blinded, None).is_err());
    }

    #[test]
    fn test_roundtrip_dh_auth() {
        let keys = PrivateKeys::generate().unwrap();
        let published = time::seconds_since_epoch() as u32;
        let inner = build_inner(&keys, published);

        let client = x25519::KeyPair::generate();
        let envelope = encrypt(
            &keys,
            &inner,
            published,
            600,
            AuthScheme::Dh(&[client.public_bytes()]),
        )
        .unwrap();

        let blinded = BlindedPublicKey::from_identity(keys.identity()).unwrap();
        let ls = decrypt(
            &envelope,
            &blinded,
            Some(&ClientSecret::Dh(client.secret_bytes())),
        )
        .unwrap();
        assert_eq!(ls.hash(), keys.identity().hash());

        let stranger = x25519::KeyPair::generate();
        assert!(decrypt(
            &envelope,
            &blinded,
            Some(&ClientSecret::Dh(stranger.secret_bytes()))
        )
        .is_err());
    }

    #[test]
    fn test_tampered_envelope_rejected() {
        let keys = PrivateKeys::generate().unwrap();
        let published = time::seconds_since_epoch() as u32;
        let inner = build_inner(&keys, published);
        let mut envelope = encrypt(&keys, &inner, published, 600, AuthScheme::None).unwrap();
        envelope[40] ^= 1;
        let blinded = BlindedPublicKey::from_identity(keys.identity()).unwrap();
        assert!(decrypt(&envelope, &blinded, None).is_err());
    }

    #[test]
    fn test_wrong_destination_key_rejected() {
        let keys = PrivateKeys::generate().unwrap();
        let other = PrivateKeys::generate().unwrap();
        let published = time::seconds_since_epoch() as u32;
        let inner = build_inner(&keys, published);
        let envelope = encrypt(&keys, &inner, published, 600, AuthScheme::None).unwrap();
        let wrong = BlindedPublicKey::from_identity(other.identity()).unwrap();
        assert!(decrypt(&envelope, &wrong, None).is_err());
    }
}
