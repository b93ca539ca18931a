//! Digest authentication for requests the bridge originates.
//!
//! Only MD5 / MD5-sess with qop `auth` (or no qop) are supported, matching
//! what residential SIP services deploy. Unsupported parameters are rejected
//! up front so a misconfigured registrar fails loudly instead of looping.

use ftth_rsipstack::rsip;
use rsip::headers::auth::{self, AuthQop, Qop};
use rsip::headers::{ToTypedHeader, UntypedHeader};
use rsip::typed;

use crate::config::SipAuth;
use crate::error::{Error, Result};

use super::utils::generate_cnonce;

#[derive(Clone, Debug)]
pub(super) struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub opaque: Option<String>,
    pub algorithm: Option<auth::Algorithm>,
    pub qop: Option<Qop>,
}

impl DigestChallenge {
    pub(super) fn from_www_authenticate(challenge: &typed::WwwAuthenticate) -> Result<Self> {
        if let Some(algorithm) = challenge.algorithm
            && !matches!(algorithm, auth::Algorithm::Md5 | auth::Algorithm::Md5Sess)
        {
            return Err(Error::configuration(format!(
                "unsupported digest algorithm {:?}",
                algorithm
            )));
        }

        if let Some(qop) = challenge.qop.as_ref()
            && !matches!(qop, Qop::Auth)
        {
            return Err(Error::configuration(format!(
                "unsupported digest qop {:?}",
                qop
            )));
        }

        Ok(Self {
            realm: challenge.realm.clone(),
            nonce: challenge.nonce.clone(),
            opaque: challenge.opaque.clone(),
            algorithm: challenge.algorithm,
            qop: challenge.qop.clone(),
        })
    }
}

/// Pull the digest challenge out of a 401 or 407 final response.
///
/// Proxy challenges are folded into the same structure and signed the same
/// way; residential registrars accept the credentials in either position.
pub(super) fn challenge_from_response(response: &rsip::Response) -> Result<DigestChallenge> {
    let header = response.headers.iter().find_map(|header| match header {
        rsip::Header::WwwAuthenticate(value) => Some(value.clone()),
        rsip::Header::ProxyAuthenticate(value) => Some(rsip::headers::WwwAuthenticate::new(
            value.value().to_string(),
        )),
        _ => None,
    });

    let Some(header) = header else {
        return Err(Error::sip_stack(format!(
            "{} response carries no digest challenge",
            response.status_code
        )));
    };

    let typed = header.typed().map_err(Error::sip_stack)?;
    DigestChallenge::from_www_authenticate(&typed)
}

pub(super) fn md5_hex(bytes: &[u8]) -> String {
    format!("{:032x}", md5::compute(bytes))
}

/// RFC 2617 digest response for one request.
fn digest_response(
    credentials: &SipAuth,
    challenge: &DigestChallenge,
    method: &str,
    uri: &str,
    nc_value: u32,
    cnonce: Option<&str>,
) -> Result<String> {
    let algorithm = challenge.algorithm.unwrap_or(auth::Algorithm::Md5);

    let ha1_base = format!(
        "{}:{}:{}",
        credentials.username, challenge.realm, credentials.password
    );
    let ha1 = match algorithm {
        auth::Algorithm::Md5 => md5_hex(ha1_base.as_bytes()),
        auth::Algorithm::Md5Sess => {
            let base = md5_hex(ha1_base.as_bytes());
            let cnonce = cnonce
                .ok_or_else(|| Error::configuration("cnonce required for MD5-sess"))?;
            md5_hex(format!("{}:{}:{}", base, challenge.nonce, cnonce).as_bytes())
        }
        other => {
            return Err(Error::configuration(format!(
                "unsupported digest algorithm {:?}",
                other
            )));
        }
    };

    let ha2 = md5_hex(format!("{}:{}", method, uri).as_bytes());
    let response = if let Some(cnonce) = cnonce {
        let nc_formatted = format!("{:08}", nc_value);
        md5_hex(
            format!(
                "{}:{}:{}:{}:auth:{}",
                ha1, challenge.nonce, nc_formatted, cnonce, ha2
            )
            .as_bytes(),
        )
    } else {
        md5_hex(format!("{}:{}:{}", ha1, challenge.nonce, ha2).as_bytes())
    };

    Ok(response)
}

/// Build the Authorization header answering `challenge` for `request`.
pub(super) fn build_authorization(
    credentials: &SipAuth,
    challenge: &DigestChallenge,
    request: &rsip::Request,
    nonce_count: u32,
) -> Result<typed::Authorization> {
    let method = request.method.to_string();
    let uri_string = request.uri.to_string();
    let nc_value = (nonce_count % 100_000_000).max(1);

    let (qop, cnonce) = match challenge.qop.clone() {
        Some(Qop::Auth) => {
            let cnonce = generate_cnonce();
            let nc_u8 = ((nc_value - 1) % 255 + 1) as u8;
            (
                Some(AuthQop::Auth {
                    cnonce: cnonce.clone(),
                    nc: nc_u8,
                }),
                Some(cnonce),
            )
        }
        Some(other) => {
            return Err(Error::configuration(format!(
                "unsupported digest qop {:?}",
                other
            )));
        }
        None => (None, None),
    };

    let response = digest_response(
        credentials,
        challenge,
        &method,
        &uri_string,
        nc_value,
        cnonce.as_deref(),
    )?;

    Ok(typed::Authorization {
        scheme: auth::Scheme::Digest,
        username: credentials.username.clone(),
        realm: challenge.realm.clone(),
        nonce: challenge.nonce.clone(),
        uri: request.uri.clone(),
        response,
        algorithm: Some(challenge.algorithm.unwrap_or(auth::Algorithm::Md5)),
        opaque: challenge.opaque.clone(),
        qop,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_hex_known_vector() {
        assert_eq!(md5_hex(b"hello"), "5d41402abc4b2a76b9719d911017c592");
    }

    // Worked example from RFC 2617 section 3.5.
    #[test]
    fn digest_response_rfc2617_example() {
        let credentials = SipAuth {
            username: "Mufasa".into(),
            password: "Circle Of Life".into(),
        };
        let challenge = DigestChallenge {
            realm: "testrealm@host.com".into(),
            nonce: "dcd98b7102dd2f0e8b11d0f600bfb0c093".into(),
            opaque: Some("5ccc069c403ebaf9f0171e9517f40e41".into()),
            algorithm: None,
            qop: Some(Qop::Auth),
        };

        let response = digest_response(
            &credentials,
            &challenge,
            "GET",
            "/dir/index.html",
            1,
            Some("0a4f113b"),
        )
        .unwrap();
        assert_eq!(response, "6629fae49393a05397450978507c4ef1");
    }

    #[test]
    fn digest_without_qop_omits_client_nonce() {
        let credentials = SipAuth {
            username: "doorbell".into(),
            password: "hunter2".into(),
        };
        let challenge = DigestChallenge {
            realm: "sip.example.net".into(),
            nonce: "abc123".into(),
            opaque: None,
            algorithm: Some(auth::Algorithm::Md5),
            qop: None,
        };

        let response =
            digest_response(&credentials, &challenge, "REGISTER", "sip:sip.example.net", 1, None)
                .unwrap();

        let ha1 = md5_hex(b"doorbell:sip.example.net:hunter2");
        let ha2 = md5_hex(b"REGISTER:sip:sip.example.net");
        let expected = md5_hex(format!("{ha1}:abc123:{ha2}").as_bytes());
        assert_eq!(response, expected);
    }

    #[test]
    fn rejects_unsupported_challenge_parameters() {
        let auth_int = typed::WwwAuthenticate {
            scheme: auth::Scheme::Digest,
            realm: "r".into(),
            domain: None,
            nonce: "n".into(),
            opaque: None,
            stale: None,
            algorithm: None,
            qop: Some(Qop::AuthInt),
            charset: None,
        };
        assert!(DigestChallenge::from_www_authenticate(&auth_int).is_err());
    }
}
