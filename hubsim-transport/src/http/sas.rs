use std::time::Duration;

use chrono::Utc;
use url::form_urlencoded::byte_serialize;

use hubsim_util::crypto::{InvalidKeyError, hmac_sha256_base64};
use hubsim_util::types::SharedAccessKey;

/// Lifetime of generated tokens
pub const TOKEN_TTL: Duration = Duration::from_secs(3600);

fn encode(value: &str) -> String {
    byte_serialize(value.as_bytes()).collect()
}

/// Build a shared access signature for `resource_uri` valid until `expiry`
/// (seconds since the epoch).
///
/// `policy_name` must be set when signing with a service policy key.
pub fn generate_sas_token(
    resource_uri: &str,
    key: &SharedAccessKey,
    policy_name: Option<&str>,
    expiry: i64,
) -> Result<String, InvalidKeyError> {
    let resource = encode(resource_uri);
    let signature = hmac_sha256_base64(key, &format!("{resource}\n{expiry}"))?;

    let mut token = format!(
        "SharedAccessSignature sr={resource}&sig={}&se={expiry}",
        encode(&signature)
    );
    if let Some(policy) = policy_name {
        token.push_str("&skn=");
        token.push_str(&encode(policy));
    }
    Ok(token)
}

/// Expiry timestamp for a token generated now
pub fn expiry_from_now() -> i64 {
    Utc::now().timestamp() + TOKEN_TTL.as_secs() as i64
}
