//! DPoP proof minting (`spec.md` §4.C "DPOP proof rules", §9 "DPoP proof
//! minting"). Grounded on `jacquard-oatproxy/src/token.rs`'s
//! `create_upstream_dpop_proof` and `examples/simple_server/memory_store.rs`'s
//! `create_dpop_key` — the same P256-keypair-to-`jose_jwk::Jwk` construction
//! and JWS-over-DPoP-claims signing, lifted out of the proxy's two-sided
//! session model into a standalone helper this crate's OAuth manager and
//! XRPC client both call.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use jacquard_oauth::jose::{
    create_signed_jwt,
    jws::RegisteredHeader,
    jwt::{Claims, PublicClaims, RegisteredClaims},
};
use jose_jwa::{Algorithm, Signing};
use p256::ecdsa::SigningKey;
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// A fresh ephemeral DPoP keypair, generated once per pending login and kept
/// for the lifetime of the resulting session (`spec.md` §9: "treat session
/// deletion as key destruction").
pub fn generate_keypair() -> jose_jwk::Jwk {
    let signing_key = SigningKey::random(&mut OsRng);
    let verifying_key = signing_key.verifying_key();
    let point = verifying_key.to_encoded_point(false);

    jose_jwk::Jwk {
        key: jose_jwk::Key::Ec(jose_jwk::Ec {
            crv: jose_jwk::EcCurves::P256,
            x: point.x().expect("uncompressed point has x").to_vec().into(),
            y: point.y().expect("uncompressed point has y").to_vec().into(),
            d: Some(signing_key.to_bytes().to_vec().into()),
        }),
        prm: jose_jwk::Parameters::default(),
    }
}

/// Strips the private `d` component, leaving only the public key that gets
/// embedded in a proof's `jwk` header.
fn public_only(jwk: &jose_jwk::Jwk) -> jose_jwk::Jwk {
    jose_jwk::Jwk {
        key: match &jwk.key {
            jose_jwk::Key::Ec(ec) => jose_jwk::Key::Ec(jose_jwk::Ec {
                crv: ec.crv.clone(),
                x: ec.x.clone(),
                y: ec.y.clone(),
                d: None,
            }),
            other => other.clone(),
        },
        prm: jwk.prm.clone(),
    }
}

fn signing_key_from_jwk(jwk: &jose_jwk::Jwk) -> Result<SigningKey> {
    match jose_jwk::crypto::Key::try_from(&jwk.key)
        .map_err(|e| Error::Internal(format!("invalid DPoP key: {e:?}")))?
    {
        jose_jwk::crypto::Key::P256(jose_jwk::crypto::Kind::Secret(secret)) => Ok(secret.into()),
        _ => Err(Error::Internal("DPoP key is not a P256 secret key".into())),
    }
}

/// RFC 7638 JWK thumbprint, base64url-encoded. Used both as the `jkt`
/// confirmation value we may want to log and as a stable identifier for the
/// keypair if callers ever need to look one up by its public half.
pub fn thumbprint(jwk: &jose_jwk::Jwk) -> Result<String> {
    let jose_jwk::Key::Ec(ec) = &jwk.key else {
        return Err(Error::Internal("JWK thumbprint only supports EC keys".into()));
    };
    let canonical = serde_json::json!({
        "crv": format!("{:?}", ec.crv),
        "kty": "EC",
        "x": URL_SAFE_NO_PAD.encode(ec.x.as_ref()),
        "y": URL_SAFE_NO_PAD.encode(ec.y.as_ref()),
    });
    let bytes = serde_json::to_vec(&canonical).map_err(|e| Error::Internal(e.to_string()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(URL_SAFE_NO_PAD.encode(hasher.finalize()))
}

/// `htu` per `spec.md` §4.C is "the target URL sans query" — strip the
/// query string (and fragment, which a URL sent over HTTP never carries
/// anyway) rather than trusting every call site to pass a bare URL.
fn htu_without_query(url: &str) -> String {
    match url.split_once(['?', '#']) {
        Some((base, _)) => base.to_string(),
        None => url.to_string(),
    }
}

fn random_jti() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| CHARSET[(*b as usize) % CHARSET.len()] as char)
        .collect()
}

/// Mints a DPoP proof JWS per `spec.md` §4.C: `{typ:"dpop+jwt", alg:ES256,
/// jwk:<public key>}` header, `{htm, htu, iat, jti, ath?, nonce?}` claims.
/// `access_token` is `Some` for resource-server calls (so `ath` is set) and
/// `None` for calls to the token endpoint itself.
pub fn mint_proof(
    jwk: &jose_jwk::Jwk,
    method: &str,
    url: &str,
    access_token: Option<&str>,
    nonce: Option<&str>,
) -> Result<String> {
    let signing_key = signing_key_from_jwk(jwk)?;

    let ath = access_token.map(|token| {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        URL_SAFE_NO_PAD.encode(hasher.finalize()).into()
    });

    let now = chrono::Utc::now().timestamp();
    let claims = Claims {
        registered: RegisteredClaims {
            iss: None,
            sub: None,
            aud: None,
            exp: None,
            nbf: None,
            iat: Some(now),
            jti: Some(random_jti().into()),
        },
        public: PublicClaims {
            htm: Some(method.to_uppercase().into()),
            htu: Some(htu_without_query(url).into()),
            ath,
            nonce: nonce.map(|n| n.to_string().into()),
        },
    };

    let mut header = RegisteredHeader::from(Algorithm::Signing(Signing::Es256));
    header.typ = Some("dpop+jwt".into());
    header.jwk = Some(public_only(jwk));

    create_signed_jwt(signing_key, header.into(), claims)
        .map(|jwt| jwt.to_string())
        .map_err(|e| Error::Internal(format!("failed to sign DPoP proof: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proof_has_three_jws_segments() {
        let jwk = generate_keypair();
        let proof = mint_proof(&jwk, "post", "https://pds.example/xrpc/x", Some("tok"), None)
            .expect("mint proof");
        assert_eq!(proof.split('.').count(), 3);
    }

    #[test]
    fn thumbprint_is_stable_for_same_key() {
        let jwk = generate_keypair();
        let t1 = thumbprint(&jwk).unwrap();
        let t2 = thumbprint(&jwk).unwrap();
        assert_eq!(t1, t2);
    }

    #[test]
    fn public_only_strips_private_component() {
        let jwk = generate_keypair();
        let pub_jwk = public_only(&jwk);
        match pub_jwk.key {
            jose_jwk::Key::Ec(ec) => assert!(ec.d.is_none()),
            _ => panic!("expected EC key"),
        }
    }

    #[test]
    fn htu_strips_query_and_fragment() {
        assert_eq!(
            htu_without_query("https://pds.example/xrpc/x?repo=did:plc:a&limit=50"),
            "https://pds.example/xrpc/x"
        );
        assert_eq!(
            htu_without_query("https://pds.example/xrpc/x"),
            "https://pds.example/xrpc/x"
        );
    }
}
