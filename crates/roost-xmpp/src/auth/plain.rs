//! SASL PLAIN payload decoding (RFC 4616).

use base64::prelude::*;

use crate::XmppError;

/// Decoded `authzid \0 authcid \0 password`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlainCredentials {
    /// Optional authorization identity
    pub authzid: Option<String>,
    /// Authentication identity
    pub authcid: String,
    /// Password
    pub password: String,
}

impl PlainCredentials {
    /// The local part to bind. Clients that send a bare JID as the authcid
    /// are reduced to its node.
    pub fn local_part(&self) -> &str {
        match self.authcid.split_once('@') {
            Some((node, _)) => node,
            None => &self.authcid,
        }
    }
}

/// Decode a base64 PLAIN initial response.
pub fn decode_plain(data: &str) -> Result<PlainCredentials, XmppError> {
    let data = data.trim();
    // "=" is the RFC 6120 encoding of an empty response.
    let decoded = if data == "=" {
        Vec::new()
    } else {
        BASE64_STANDARD
            .decode(data)
            .map_err(|e| XmppError::malformed_auth(format!("Invalid base64: {}", e)))?
    };

    let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
    let [authzid, authcid, password] = parts.as_slice() else {
        return Err(XmppError::malformed_auth(format!(
            "expected 3 NUL-separated fields, got {}",
            parts.len()
        )));
    };

    let authcid = std::str::from_utf8(authcid)
        .map_err(|_| XmppError::malformed_auth("authcid is not UTF-8"))?;
    if authcid.is_empty() {
        return Err(XmppError::malformed_auth("empty authcid"));
    }
    let password = std::str::from_utf8(password)
        .map_err(|_| XmppError::malformed_auth("password is not UTF-8"))?;

    Ok(PlainCredentials {
        authzid: (!authzid.is_empty()).then(|| String::from_utf8_lossy(authzid).into_owned()),
        authcid: authcid.to_string(),
        password: password.to_string(),
    })
}
