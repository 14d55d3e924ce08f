//! Default User-Agent string for HTTP-family requests.

/// Project URL for User-Agent identification.
const PROJECT_UA_URL: &str = "https://github.com/fierce/netxfer";

/// Default User-Agent sent when the session config sets none.
#[must_use]
pub(crate) fn default_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("netxfer/{version} (+{PROJECT_UA_URL})")
}
