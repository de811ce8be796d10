// Identifier redaction
//
// Case-normalized deny list checked at every name boundary during capture:
// variable names, object keys and map keys rendered as strings. A match
// replaces the value with a redaction marker and stops recursion there.

use std::collections::HashSet;

// Built-in deny list. Entries are matched after normalization, so `api_key`,
// `apiKey` and `API-KEY` all hit the `apikey` entry.
pub const DEFAULT_REDACTED_IDENTIFIERS: &[&str] = &[
    "accesstoken",
    "apikey",
    "apisecret",
    "apisignature",
    "auth",
    "authorization",
    "bearer",
    "ccnumber",
    "certificatepin",
    "cipher",
    "clientid",
    "clientsecret",
    "connectionstring",
    "cookie",
    "credentials",
    "creditcard",
    "csrf",
    "csrftoken",
    "cvv",
    "databaseurl",
    "dburl",
    "encryptionkey",
    "encryptionkeyid",
    "gpgkey",
    "jti",
    "jwt",
    "licensekey",
    "masterkey",
    "mysqlpwd",
    "nonce",
    "oauth",
    "oauthtoken",
    "otp",
    "passhash",
    "passwd",
    "password",
    "passwordb",
    "pemfile",
    "pgpkey",
    "phpsessid",
    "pin",
    "pincode",
    "pkcs8",
    "privatekey",
    "publickey",
    "pwd",
    "recaptchakey",
    "refreshtoken",
    "routingnumber",
    "salt",
    "secret",
    "secretkey",
    "secrettoken",
    "securityanswer",
    "securitycode",
    "securityquestion",
    "serviceaccountcredentials",
    "session",
    "sessionid",
    "sessionkey",
    "setcookie",
    "signature",
    "signaturekey",
    "sshkey",
    "ssn",
    "symfony",
    "token",
    "transactionid",
    "twiliotoken",
    "xapikey",
    "xauthtoken",
    "xcsrftoken",
    "xforwardedfor",
    "xrealip",
    "xsrftoken",
];

/// Strip separator characters and lowercase, so naming-convention variants of
/// the same identifier compare equal.
pub fn normalize_identifier(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, '_' | '-' | '@' | '$' | '.' | ' '))
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Clone)]
pub struct Redaction {
    deny: HashSet<String>,
    allow: HashSet<String>,
}

impl Redaction {
    /// Build from the process configuration: extra denied identifiers are
    /// merged with the built-in list, excluded identifiers are exempted.
    pub fn new(extra_denied: &[String], excluded: &[String]) -> Self {
        let mut deny: HashSet<String> = DEFAULT_REDACTED_IDENTIFIERS
            .iter()
            .map(|name| normalize_identifier(name))
            .collect();
        deny.extend(extra_denied.iter().map(|name| normalize_identifier(name)));

        let allow = excluded.iter().map(|name| normalize_identifier(name)).collect();

        Self { deny, allow }
    }

    pub fn is_redacted(&self, name: &str) -> bool {
        let normalized = normalize_identifier(name);
        !self.allow.contains(&normalized) && self.deny.contains(&normalized)
    }
}

impl Default for Redaction {
    fn default() -> Self {
        Self::new(&[], &[])
    }
}
